//! # Configuration Module
//!
//! Loads the daemon configuration once at start-up from environment
//! variables, optionally seeded from a `.env` file.
//!
//! ## Required Keys
//!
//! | key | meaning |
//! |---|---|
//! | `PLAYLIST_LINK` | playlist URL opened by the browser |
//! | `LOGIN_USERNAME`, `LOGIN_PASSWORD` | streaming account credentials |
//! | `START_HOUR`, `END_HOUR` | daily window, `0-23`, start may be after end |
//! | `SHUFFLE`, `HEADLESS` | booleans |
//! | `SENDER_EMAIL`, `RECEIVER_EMAIL`, `APP_PASSWORD` | failure notification |
//!
//! ## Optional Keys
//!
//! `POLL_INTERVAL_SECS`, `IDLE_POLL_SECS`, `FAILURE_THRESHOLD`,
//! `CONFLICT_CONFIRMATIONS`, `COMMAND_TIMEOUT_SECS`, `NOTIFY_TIMEOUT_SECS`,
//! `ELEMENT_TIMEOUT_SECS`, `SMTP_HOST`, `SMTP_PORT`, `CHROME_EXECUTABLE`.
//!
//! Anything missing or malformed fails fast with a [`ConfigError`] before the
//! control loop starts.

use anyhow::{Context, Result};
use lettre::message::Mailbox;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// String that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Streaming account credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

/// Outbound notification settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub sender: Mailbox,
    pub receiver: Mailbox,
    pub app_password: Secret,
    pub smtp_host: String,
    pub smtp_port: u16,
}

/// Loop timing and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// Tick interval inside the window.
    pub poll_interval: Duration,
    /// Tick interval outside the window, capped by the window opening.
    pub idle_poll_interval: Duration,
    /// Consecutive failures of one kind before escalating.
    pub failure_threshold: u32,
    /// Consecutive polls needed to confirm a conflict change.
    pub conflict_confirmations: u32,
    /// Ceiling for any single driver call.
    pub command_timeout: Duration,
    /// Ceiling for the notifier call.
    pub notify_timeout: Duration,
    /// How long the browser waits for a page element to show up.
    pub element_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            idle_poll_interval: Duration::from_secs(900),
            failure_threshold: 3,
            conflict_confirmations: 2,
            command_timeout: Duration::from_secs(90),
            notify_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(15),
        }
    }
}

/// Immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub playlist_link: String,
    pub credentials: Credentials,
    pub start_hour: u32,
    pub end_hour: u32,
    pub shuffle: bool,
    pub headless: bool,
    pub email: EmailConfig,
    pub tuning: Tuning,
    pub chrome_executable: Option<PathBuf>,
}

pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value lookup. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| -> Option<String> {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let playlist_link = require("PLAYLIST_LINK")?;
        let username = require("LOGIN_USERNAME")?;
        let password = require("LOGIN_PASSWORD")?;
        let start_hour = parse_hour("START_HOUR", &require("START_HOUR")?)?;
        let end_hour = parse_hour("END_HOUR", &require("END_HOUR")?)?;
        let shuffle = parse_bool("SHUFFLE", &require("SHUFFLE")?)?;
        let headless = parse_bool("HEADLESS", &require("HEADLESS")?)?;
        let sender = parse_mailbox("SENDER_EMAIL", &require("SENDER_EMAIL")?)?;
        let receiver = parse_mailbox("RECEIVER_EMAIL", &require("RECEIVER_EMAIL")?)?;
        let app_password = require("APP_PASSWORD")?;

        let smtp_host = get("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string());
        let smtp_port = match get("SMTP_PORT") {
            Some(value) => parse_number::<u16>("SMTP_PORT", &value)?,
            None => DEFAULT_SMTP_PORT,
        };

        let defaults = Tuning::default();
        let tuning = Tuning {
            poll_interval: optional_secs(&get, "POLL_INTERVAL_SECS", defaults.poll_interval)?,
            idle_poll_interval: optional_secs(&get, "IDLE_POLL_SECS", defaults.idle_poll_interval)?,
            failure_threshold: optional_count(&get, "FAILURE_THRESHOLD", defaults.failure_threshold)?,
            conflict_confirmations: optional_count(
                &get,
                "CONFLICT_CONFIRMATIONS",
                defaults.conflict_confirmations,
            )?,
            command_timeout: optional_secs(&get, "COMMAND_TIMEOUT_SECS", defaults.command_timeout)?,
            notify_timeout: optional_secs(&get, "NOTIFY_TIMEOUT_SECS", defaults.notify_timeout)?,
            element_timeout: optional_secs(&get, "ELEMENT_TIMEOUT_SECS", defaults.element_timeout)?,
        };

        Ok(Self {
            playlist_link,
            credentials: Credentials {
                username,
                password: Secret::new(password),
            },
            start_hour,
            end_hour,
            shuffle,
            headless,
            email: EmailConfig {
                sender,
                receiver,
                app_password: Secret::new(app_password),
                smtp_host,
                smtp_port,
            },
            tuning,
            chrome_executable: get("CHROME_EXECUTABLE").map(PathBuf::from),
        })
    }

    /// Redacted view for `check-config`.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            playlist_link: self.playlist_link.clone(),
            username: self.credentials.username.clone(),
            start_hour: self.start_hour,
            end_hour: self.end_hour,
            shuffle: self.shuffle,
            headless: self.headless,
            sender_email: self.email.sender.to_string(),
            receiver_email: self.email.receiver.to_string(),
            smtp_relay: format!("{}:{}", self.email.smtp_host, self.email.smtp_port),
            poll_interval_secs: self.tuning.poll_interval.as_secs(),
            idle_poll_secs: self.tuning.idle_poll_interval.as_secs(),
            failure_threshold: self.tuning.failure_threshold,
            conflict_confirmations: self.tuning.conflict_confirmations,
            command_timeout_secs: self.tuning.command_timeout.as_secs(),
            chrome_executable: self.chrome_executable.clone(),
        }
    }
}

/// Configuration as printed by `spotibot check-config`; secrets omitted.
#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub playlist_link: String,
    pub username: String,
    pub start_hour: u32,
    pub end_hour: u32,
    pub shuffle: bool,
    pub headless: bool,
    pub sender_email: String,
    pub receiver_email: String,
    pub smtp_relay: String,
    pub poll_interval_secs: u64,
    pub idle_poll_secs: u64,
    pub failure_threshold: u32,
    pub conflict_confirmations: u32,
    pub command_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chrome_executable: Option<PathBuf>,
}

/// Parse a boolean setting.
///
/// Accepts `true/false`, `yes/no`, `t/f`, `1/0` and `on/off` in any case.
pub fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "t" | "1" | "on" => Ok(true),
        "false" | "no" | "f" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "expected a boolean such as true or false")),
    }
}

fn parse_hour(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    let hour = parse_number::<u32>(key, value)?;
    if hour > 23 {
        return Err(ConfigError::invalid(key, value, "hour must be between 0 and 23"));
    }
    Ok(hour)
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::invalid(key, value, "expected a non-negative integer"))
}

fn parse_mailbox(key: &'static str, value: &str) -> Result<Mailbox, ConfigError> {
    value
        .parse::<Mailbox>()
        .map_err(|e| ConfigError::invalid(key, value, e.to_string()))
}

fn optional_secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        Some(value) => {
            let secs = parse_number::<u64>(key, &value)?;
            if secs == 0 {
                return Err(ConfigError::invalid(key, &value, "must be at least 1 second"));
            }
            Ok(Duration::from_secs(secs))
        }
        None => Ok(default),
    }
}

fn optional_count<G>(get: &G, key: &'static str, default: u32) -> Result<u32, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        Some(value) => {
            let count = parse_number::<u32>(key, &value)?;
            if count == 0 {
                return Err(ConfigError::invalid(key, &value, "must be at least 1"));
            }
            Ok(count)
        }
        None => Ok(default),
    }
}

/// Merge a `.env` file into the process environment.
///
/// With an explicit `path` the file must exist. Without one, a `.env` in the
/// current directory is used when present. Variables already set in the
/// environment are never overwritten. Returns the file that was loaded.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load environment file {}", path.display()))?;
            Ok(Some(path.to_path_buf()))
        }
        None => match dotenvy::dotenv() {
            Ok(found) => Ok(Some(found)),
            Err(e) if e.not_found() => Ok(None),
            Err(e) => Err(e).context("Failed to load .env file"),
        },
    }
}

/// Returns the browser profile directory, creating it if needed.
///
/// - **Linux**: `~/.cache/spotibot/chrome-profile`
/// - **macOS**: `~/Library/Caches/spotibot/chrome-profile`
/// - **Windows**: `%LOCALAPPDATA%\spotibot\chrome-profile`
pub fn get_profile_dir() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system cache directory. Please ensure your platform supports standard cache directories."
        )
    })?;

    let profile_dir = cache_dir.join("spotibot").join("chrome-profile");
    fs::create_dir_all(&profile_dir).with_context(|| {
        format!(
            "Failed to create browser profile directory at {}. Please check file permissions.",
            profile_dir.display()
        )
    })?;

    Ok(profile_dir)
}
