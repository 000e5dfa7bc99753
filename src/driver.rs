//! Playback capability consumed by the controller.
//!
//! The controller never talks to a browser directly; it only sees this
//! trait. [`crate::chrome::ChromePlayer`] is the production implementation,
//! tests script their own.

use anyhow::Result;
use async_trait::async_trait;

/// Remote-controlled playback session on the streaming service.
///
/// Every call may block on network I/O. Callers bound each call with their
/// own timeout, so implementations do not need to guard against hangs
/// themselves.
#[async_trait]
pub trait PlaybackDriver: Send {
    /// Open the session and sign in. Calling it again starts over.
    async fn sign_in(&mut self) -> Result<()>;

    /// Whether another device on the same account is currently playing.
    async fn is_playing_elsewhere(&mut self) -> Result<bool>;

    /// Start the playlist, or resume it if it was started before.
    async fn start_or_resume(&mut self, playlist: &str, shuffle: bool) -> Result<()>;

    /// Pause local playback. A session that is not playing is left alone.
    async fn pause(&mut self) -> Result<()>;

    /// Whether the local session is really playing right now.
    async fn is_actively_playing(&mut self) -> Result<bool>;

    /// Release the underlying session. Must be safe to call more than once.
    async fn shutdown(&mut self);
}
