//! Clap derive structures for the `wizlink` CLI.
//!
//! Defines the command tree, global flags, and shared argument types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use wizlink_core::Capability;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// wizlink -- BLE peripheral channel synchronization toolkit
#[derive(Debug, Parser)]
#[command(
    name = "wizlink",
    version,
    about = "Simulate and configure a BLE peripheral exposing synchronized integer channels",
    long_about = "Hosts a GATT service whose characteristics are fixed-width integer channels,\n\
        kept in sync with one connected central through heartbeat notifications\n\
        and remote writes.\n\n\
        `simulate` runs the full peripheral over an in-memory transport with a\n\
        scripted central, printing every service state transition.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "WIZLINK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "WIZLINK_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the peripheral against a simulated central
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// List configured channels
    #[command(alias = "ch")]
    Channels,

    /// Manage the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Simulate ─────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Remote write from the central, applied in order (name=value)
    #[arg(long = "set", short = 's', value_name = "NAME=VALUE")]
    pub set: Vec<Assignment>,

    /// Local write through the snapshot setters, applied after remote writes
    #[arg(long = "local", short = 'l', value_name = "NAME=VALUE")]
    pub local: Vec<Assignment>,

    /// Value every characteristic holds when the central connects
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub initial: i32,

    /// How long to stay connected after the writes (e.g. 3s, 500ms)
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
    pub hold: Duration,

    /// Treat a capability as denied (repeatable)
    #[arg(long, value_name = "CAPABILITY", value_parser = parse_capability)]
    pub deny: Vec<Capability>,

    /// Print the captured log tail after the run
    #[arg(long)]
    pub show_log: bool,
}

/// A `name=value` channel assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub channel: String,
    pub value: i32,
}

impl FromStr for Assignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (channel, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
        let channel = channel.trim();
        if channel.is_empty() {
            return Err("channel name must not be empty".into());
        }
        let value = value
            .trim()
            .parse::<i32>()
            .map_err(|e| format!("invalid value '{value}': {e}"))?;
        Ok(Self {
            channel: channel.to_owned(),
            value,
        })
    }
}

fn parse_capability(s: &str) -> Result<Capability, String> {
    Capability::from_str(s).map_err(|_| {
        format!(
            "unknown capability '{s}' (expected one of: {})",
            wizlink_core::REQUIRED_CAPABILITIES
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        )
    })
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration (defaults + file + environment)
    Show,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Set a scalar config value
    Set {
        /// Key: device_name, service_uuid, heartbeat_ms, read_timeout_ms
        key: String,
        /// New value
        value: String,
    },

    /// Print the config file path
    Path,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn assignment_parses_name_and_value() {
        let a: Assignment = "data2 = -99".parse().unwrap();
        assert_eq!(
            a,
            Assignment {
                channel: "data2".into(),
                value: -99
            }
        );
        assert!("data2".parse::<Assignment>().is_err());
        assert!("=4".parse::<Assignment>().is_err());
        assert!("data1=abc".parse::<Assignment>().is_err());
    }

    #[test]
    fn simulate_flags_parse() {
        let cli = Cli::try_parse_from([
            "wizlink",
            "simulate",
            "--set",
            "data1=10",
            "--hold",
            "250ms",
            "--deny",
            "bluetooth-connect",
        ])
        .unwrap();
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.set.len(), 1);
        assert_eq!(args.hold, Duration::from_millis(250));
        assert_eq!(args.deny, vec![Capability::BluetoothConnect]);
    }
}
