use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, error, info};
use std::process::ExitCode;

use spotibot::config::{self, Config, ConfigError};
use spotibot::daemon::{self, Daemon, EXIT_CONFIG, EXIT_UNEXPECTED};
use spotibot::{cli, completion};

/// Main entry point for SpotiBot.
///
/// Initializes logging, loads the `.env` file, parses command-line arguments
/// and routes to the selected command.
///
/// # Logging
///
/// Defaults to `info`, or `debug` with `--verbose`. `RUST_LOG` overrides both:
/// - `RUST_LOG=spotibot::controller=trace spotibot run`
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match execute(args).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(config_error) = e.downcast_ref::<ConfigError>() {
                error!("Configuration error: {config_error}");
                return ExitCode::from(EXIT_CONFIG);
            }
            error!("{e:#}");
            ExitCode::from(EXIT_UNEXPECTED)
        }
    }
}

async fn execute(args: cli::Args) -> Result<ExitCode> {
    let command = args.resolved_command();

    if let cli::Command::Completion { shell } = command {
        let mut cmd = cli::Args::command();
        completion::generate_completions(completion::shell_to_completion_shell(&shell), &mut cmd);
        return Ok(ExitCode::SUCCESS);
    }

    match config::load_env_file(args.env_file.as_deref()) {
        Ok(Some(path)) => debug!("Loaded environment from {}", path.display()),
        Ok(None) => debug!("No .env file found, using the process environment"),
        Err(e) => {
            error!("{e:#}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    }

    let config = Config::from_env()?;

    match command {
        cli::Command::Run => {
            let outcome = Daemon::new(config).run().await?;
            Ok(outcome.exit_code())
        }
        cli::Command::CheckConfig => {
            let summary = serde_json::to_string_pretty(&config.summary())
                .context("Failed to serialize configuration summary")?;
            println!("{summary}");
            info!("Configuration is valid");
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::TestNotify => {
            daemon::send_test_notification(&config).await?;
            println!("Test notification sent to {}", config.email.receiver);
            Ok(ExitCode::SUCCESS)
        }
        cli::Command::Completion { .. } => Ok(ExitCode::SUCCESS),
    }
}
