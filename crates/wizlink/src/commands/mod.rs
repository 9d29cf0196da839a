pub mod channels;
pub mod config_cmd;
pub mod simulate;

use wizlink_config::Config;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::log_buffer::LogBuffer;

/// Route a config-backed command to its handler.
pub async fn dispatch(
    cmd: Command,
    config: &Config,
    global: &GlobalOpts,
    logs: &LogBuffer,
) -> Result<(), CliError> {
    match cmd {
        Command::Simulate(args) => simulate::handle(&args, config, global, logs).await,
        Command::Channels => channels::handle(config, global),
        Command::Config(_) | Command::Completions(_) => unreachable!("handled in main"),
    }
}
