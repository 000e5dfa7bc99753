//! # Command-Line Interface Module
//!
//! Defines the `spotibot` command line using Clap derive macros.
//!
//! ## Commands
//!
//! - `run`: Start the playback daemon (the default)
//! - `check-config`: Validate the configuration and print it without secrets
//! - `test-notify`: Send a test failure notification
//! - `completion`: Generate shell completions
//!
//! ## Examples
//!
//! ```bash
//! spotibot --env-file /etc/spotibot.env run
//! spotibot check-config
//! spotibot -v test-notify
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "spotibot")]
#[command(about = "SpotiBot: keeps a playlist playing in the browser during a daily window")]
#[command(version)]
pub struct Args {
    /// Load settings from this .env file instead of ./.env
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// The subcommand to execute; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    pub fn resolved_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the playback daemon
    ///
    /// Signs in, then keeps the playlist playing inside the configured window,
    /// pausing whenever another device on the account is playing. Stops on
    /// Ctrl+C or SIGTERM, or after repeated failures (exit code 3).
    Run,

    /// Validate configuration and print it as JSON (secrets omitted)
    CheckConfig,

    /// Send a test notification to the configured receiver
    TestNotify,

    /// Generate shell completions
    ///
    /// Usage: spotibot completion bash > ~/.local/share/bash-completion/completions/spotibot
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
