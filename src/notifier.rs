//! # Operator Notification
//!
//! The controller reports a fatal escalation through the [`Notifier`]
//! capability. Delivery is best-effort: the controller logs a failed
//! notification and moves on, it never retries.
//!
//! [`EmailNotifier`] sends a plain-text mail through an authenticated
//! STARTTLS relay (Gmail with an app password by default).

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info};
use std::time::Duration;

use crate::config::EmailConfig;

/// Subject used when the daemon gives up.
pub const FAILURE_SUBJECT: &str = "SpotiBot went down!";

/// One-shot message delivery to the operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> Result<()>;
}

/// SMTP mail notifier.
pub struct EmailNotifier {
    sender: Mailbox,
    receiver: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailNotifier {
    /// Build the transport. No connection is opened until the first send.
    pub fn new(config: &EmailConfig, timeout: Duration) -> Result<Self> {
        let credentials = Credentials::new(
            config.sender.email.to_string(),
            config.app_password.expose().to_string(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .with_context(|| format!("Invalid SMTP relay: {}", config.smtp_host))?
            .port(config.smtp_port)
            .credentials(credentials)
            .timeout(Some(timeout))
            .build();

        Ok(Self {
            sender: config.sender.clone(),
            receiver: config.receiver.clone(),
            transport,
        })
    }

    fn message(&self, subject: &str, body: &str) -> Result<Message> {
        Message::builder()
            .from(self.sender.clone())
            .to(self.receiver.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("Failed to build notification message")
    }
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("sender", &self.sender.to_string())
            .field("receiver", &self.receiver.to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        let message = self.message(subject, body)?;
        debug!("Sending notification to {}", self.receiver);

        self.transport
            .send(message)
            .await
            .with_context(|| format!("Failed to send mail to {}", self.receiver))?;

        info!("Notification sent to {}", self.receiver);
        Ok(())
    }
}
