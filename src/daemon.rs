//! # Playback Daemon
//!
//! Wires the configured browser driver and mail notifier into a
//! [`PlaybackController`] and runs it until a stop signal arrives or the
//! controller gives up.
//!
//! ## Lifetime
//!
//! 1. Build the driver and notifier from [`Config`]
//! 2. Listen for Ctrl+C / SIGTERM and turn them into a cancellation
//! 3. Run the controller; it shuts the browser down on every exit path
//!
//! ## Exit Codes
//!
//! | code | meaning |
//! |---|---|
//! | 0 | stopped on request |
//! | 1 | unexpected error |
//! | 2 | configuration error |
//! | 3 | gave up after repeated failures |

use anyhow::{Context, Result};
use log::{debug, error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::chrome::{ChromePlayer, PlayerSettings};
use crate::config::Config;
use crate::controller::{ControllerSettings, PlaybackController, RunOutcome, SystemClock};
use crate::notifier::{EmailNotifier, Notifier};

/// Exit code for unexpected errors.
pub const EXIT_UNEXPECTED: u8 = 1;

/// Exit code for missing or malformed configuration.
pub const EXIT_CONFIG: u8 = 2;

pub use crate::controller::EXIT_FATAL;

/// Subject of the mail sent by `test-notify`.
pub const TEST_SUBJECT: &str = "SpotiBot test notification";

/// The playback daemon
#[derive(Debug)]
pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until stopped or failed.
    pub async fn run(self) -> Result<RunOutcome> {
        let cancel = CancellationToken::new();
        let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

        let outcome = self.run_until(cancel).await;
        signals.abort();
        outcome
    }

    /// Run until `cancel` fires or the controller fails.
    pub async fn run_until(self, cancel: CancellationToken) -> Result<RunOutcome> {
        let notifier = EmailNotifier::new(&self.config.email, self.config.tuning.notify_timeout)
            .context("Failed to set up failure notifications")?;
        let driver = ChromePlayer::new(PlayerSettings::from_config(&self.config));
        let settings = ControllerSettings::from_config(&self.config);

        info!(
            "Starting SpotiBot for {} (playlist {})",
            self.config.credentials.username, self.config.playlist_link
        );

        let mut controller = PlaybackController::new(driver, notifier, SystemClock, settings)?;
        Ok(controller.run(cancel).await)
    }
}

/// Send a one-off mail to check the notification settings.
pub async fn send_test_notification(config: &Config) -> Result<()> {
    let notifier = EmailNotifier::new(&config.email, config.tuning.notify_timeout)?;
    let body = format!(
        "This is a test message from SpotiBot.\n\n\
         Failure notifications for {} will be sent to this address.\n",
        config.credentials.username
    );

    tokio::time::timeout(config.tuning.notify_timeout, notifier.notify(TEST_SUBJECT, &body))
        .await
        .context("Timed out sending test notification")??;

    info!("Test notification delivered to {}", config.email.receiver);
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    shutdown_signal().await;
    cancel.cancel();
}

/// Resolve on Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed that source is ignored rather than
/// stopping the daemon.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
    debug!("Shutdown signal handled");
}
