//! CLI error types with miette diagnostics.
//!
//! Maps core, config and transport failures into user-facing errors
//! with actionable help text and a stable exit code.

use miette::Diagnostic;
use thiserror::Error;

use wizlink_config::ConfigError;
use wizlink_core::{Capability, CoreError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const PERMISSION: i32 = 5;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Permissions ──────────────────────────────────────────────────
    #[error("Missing capabilities: {}", format_capabilities(.missing))]
    #[diagnostic(
        code(wizlink::permission_required),
        help("Grant the listed capabilities and start again, or drop the matching --deny flags.")
    )]
    PermissionRequired { missing: Vec<Capability> },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(wizlink::not_found),
        help("Run: wizlink {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    #[error("Config file already exists at {path}")]
    #[diagnostic(
        code(wizlink::conflict),
        help("Use --force to overwrite it.")
    )]
    AlreadyExists { path: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(wizlink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(wizlink::config),
        help("Inspect the effective configuration with: wizlink config show")
    )]
    Config(#[from] ConfigError),

    // ── Service ──────────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(wizlink::core))]
    Core(#[from] CoreError),

    #[error(transparent)]
    #[diagnostic(code(wizlink::transport))]
    Transport(#[from] wizlink_gatt::Error),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Timed out after {seconds}s waiting for {step}")]
    #[diagnostic(
        code(wizlink::timeout),
        help("Run again with -vv to see what the service was doing.")
    )]
    Timeout { step: String, seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(wizlink::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    #[diagnostic(code(wizlink::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

fn format_capabilities(missing: &[Capability]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PermissionRequired { .. } => exit_code::PERMISSION,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::AlreadyExists { .. } => exit_code::CONFLICT,
            Self::Validation { .. } | Self::Config(ConfigError::Validation { .. }) => {
                exit_code::USAGE
            }
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Transport(_) | Self::Core(CoreError::Transport(_)) => exit_code::CONNECTION,
            Self::Core(CoreError::Config { .. }) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}
