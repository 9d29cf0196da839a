//! Config subcommand handlers.

use std::fmt::Write as _;
use std::path::PathBuf;

use wizlink_config::{self as config, Config};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

// ── Helpers ─────────────────────────────────────────────────────────

fn target_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config::config_path)
}

fn detail(cfg: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "device_name:     {}", cfg.device_name);
    let _ = writeln!(out, "service_uuid:    {}", cfg.service_uuid);
    let _ = writeln!(out, "heartbeat_ms:    {}", cfg.heartbeat_ms);
    let _ = writeln!(out, "read_timeout_ms: {}", cfg.read_timeout_ms);
    let _ = write!(out, "channels:");
    for c in &cfg.channels {
        let _ = write!(out, "\n  {:<8} {} ({})", c.name, c.uuid, c.width);
    }
    out
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: key.into(),
        reason: reason.to_string(),
    }
}

/// Apply `key = value` to a scalar setting.
fn apply(cfg: &mut Config, key: &str, value: &str) -> Result<(), CliError> {
    match key {
        "device_name" => value.clone_into(&mut cfg.device_name),
        "service_uuid" => cfg.service_uuid = value.parse().map_err(|e| invalid(key, e))?,
        "heartbeat_ms" => cfg.heartbeat_ms = value.parse().map_err(|e| invalid(key, e))?,
        "read_timeout_ms" => cfg.read_timeout_ms = value.parse().map_err(|e| invalid(key, e))?,
        _ => {
            return Err(invalid(
                key,
                "unknown key (expected device_name, service_uuid, heartbeat_ms or read_timeout_ms)",
            ));
        }
    }
    Ok(())
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let cfg = config::load_config(global.config.as_deref())?;
            let out = output::render_single(&global.output, &cfg, detail, |c| {
                c.channels
                    .iter()
                    .map(|ch| ch.name.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            let path = target_path(global);
            if path.exists() && !force {
                return Err(CliError::AlreadyExists {
                    path: path.display().to_string(),
                });
            }
            let written = config::save_config(&Config::default(), Some(&path))?;
            if !global.quiet {
                eprintln!("Config written to {}", written.display());
            }
            Ok(())
        }

        ConfigCommand::Set { key, value } => {
            let path = target_path(global);
            let mut cfg = config::load_config(Some(&path))?;
            apply(&mut cfg, &key, &value)?;
            cfg.to_service_config()?;
            config::save_config(&cfg, Some(&path))?;
            if !global.quiet {
                eprintln!("Set {key} = {value}");
            }
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&target_path(global).display().to_string(), false);
            Ok(())
        }
    }
}
