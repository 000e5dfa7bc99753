//! # Conflict Monitor
//!
//! Debounces the raw "is another device playing on this account" reading.
//!
//! The device banner can flicker while the service hands playback around or
//! the page re-renders. A change of the stable state is only accepted once
//! the new reading has been seen on `confirmations` consecutive polls.
//!
//! The first reading after start-up is adopted as-is.

use log::{debug, info};
use std::time::Instant;

/// Stable conflict state and the moment it last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictSignal {
    pub active: bool,
    pub last_changed: Instant,
}

/// Debounced view over raw conflict readings.
#[derive(Debug)]
pub struct ConflictMonitor {
    confirmations: u32,
    signal: Option<ConflictSignal>,
    /// Candidate value differing from the stable state, and how many
    /// consecutive polls have reported it.
    pending: Option<(bool, u32)>,
}

impl ConflictMonitor {
    /// Create a monitor requiring `confirmations` consecutive readings
    /// before the stable state flips. Values below 1 are treated as 1.
    pub fn new(confirmations: u32) -> Self {
        Self {
            confirmations: confirmations.max(1),
            signal: None,
            pending: None,
        }
    }

    /// Feed one raw reading, returning the stable state.
    pub fn observe(&mut self, raw: bool, now: Instant) -> bool {
        let Some(signal) = self.signal.as_mut() else {
            debug!("Initial conflict reading: {raw}");
            self.signal = Some(ConflictSignal { active: raw, last_changed: now });
            return raw;
        };

        if raw == signal.active {
            if self.pending.take().is_some() {
                debug!("Transient conflict reading reverted, keeping {}", signal.active);
            }
            return signal.active;
        }

        let seen = match self.pending {
            Some((value, count)) if value == raw => count + 1,
            _ => 1,
        };

        if seen >= self.confirmations {
            info!(
                "Conflict state changed: {} -> {raw} (confirmed on {seen} consecutive polls)",
                signal.active
            );
            signal.active = raw;
            signal.last_changed = now;
            self.pending = None;
        } else {
            debug!("Conflict reading {raw} seen {seen}/{} times", self.confirmations);
            self.pending = Some((raw, seen));
        }

        signal.active
    }

    /// Record that a reading could not be taken.
    ///
    /// An unknown reading never changes the stable state, but it does break
    /// a run of consecutive confirmations.
    pub fn observe_unknown(&mut self) {
        if self.pending.take().is_some() {
            debug!("Conflict reading unavailable, discarding pending change");
        }
    }

    /// Current stable state, `None` before the first reading.
    pub fn stable(&self) -> Option<bool> {
        self.signal.map(|signal| signal.active)
    }

    pub fn signal(&self) -> Option<ConflictSignal> {
        self.signal
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }
}
