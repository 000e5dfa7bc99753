//! Keeps a streaming playlist playing in a browser during a daily window.
//!
//! Core modules:
//! - [`controller`] - Polling state machine: start, pause, resume, escalate
//! - [`schedule`] - Daily hour window, including windows that wrap midnight
//! - [`conflict`] - Debounced "another device is playing" detection
//! - [`daemon`] - Process lifetime, signals and exit codes
//!
//! ### Capabilities
//!
//! - [`driver`] - The playback capability the controller drives
//! - [`chrome`] - Chrome implementation of it (chromiumoxide)
//! - [`notifier`] - Operator notification, SMTP implementation
//!
//! ### Supporting Modules
//!
//! - [`config`] - Environment / `.env` configuration with fail-fast validation
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use spotibot::config::{self, Config};
//! use spotibot::daemon::Daemon;
//!
//! # async fn start() -> anyhow::Result<()> {
//! config::load_env_file(None)?;
//! let config = Config::from_env()?;
//!
//! // Runs until Ctrl+C, SIGTERM or a fatal escalation
//! let outcome = Daemon::new(config).run().await?;
//! println!("exit code {:?}", outcome.exit_code());
//! # Ok(())
//! # }
//! ```
//!
//! ## Decision Rules
//!
//! Each tick reads the window and the debounced conflict state:
//!
//! - Another device playing: pause (or stay paused), whatever the hour
//! - Outside the window: pause
//! - Inside the window and free: start or resume, or check that the session
//!   is really still playing
//!
//! ## Error Handling
//!
//! Capability calls return `anyhow::Result` and are bounded by a timeout.
//! Failures are counted per operation; the controller escalates once a count
//! reaches the configured threshold, notifies the operator and stops.
//! Configuration problems surface as [`config::ConfigError`].

pub mod chrome;
pub mod cli;
pub mod completion;
pub mod config;
pub mod conflict;
pub mod controller;
pub mod daemon;
pub mod driver;
pub mod notifier;
pub mod schedule;
