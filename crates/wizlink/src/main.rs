mod cli;
mod commands;
mod error;
mod log_buffer;
mod output;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::log_buffer::LogBuffer;

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup tracing based on verbosity; the buffer sees debug events regardless
    let logs = LogBuffer::default();
    init_tracing(cli.global.verbose, &logs);

    // Dispatch and handle errors with proper exit codes
    if let Err(err) = run(cli, logs).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, logs: &LogBuffer) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    tracing_subscriber::registry()
        .with(stderr)
        .with(logs.layer(Level::DEBUG))
        .init();
}

async fn run(cli: Cli, logs: LogBuffer) -> Result<(), CliError> {
    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        // Shell completions generation
        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "wizlink", &mut std::io::stdout());
            Ok(())
        }

        // Everything else runs against the effective configuration
        cmd => {
            let config = wizlink_config::load_config(cli.global.config.as_deref())?;
            tracing::debug!(command = ?cmd, "dispatching command");
            commands::dispatch(cmd, &config, &cli.global, &logs).await
        }
    }
}
