//! # Schedule Window
//!
//! Decides whether the current wall-clock hour falls inside the daily window
//! during which automated playback is allowed.
//!
//! ## Window Shapes
//!
//! - `start < end`: a same-day window, `[start, end)`
//! - `start > end`: the window wraps midnight, `[start, 24) ∪ [0, end)`
//! - `start == end`: continuous operation, every hour is inside the window

use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime, Timelike};
use std::time::Duration;

/// Returns whether `now_hour` is inside the window `[start_hour, end_hour)`.
///
/// Hours are in `0..=23`. See the module documentation for the wrap-around
/// and equal-bounds rules.
///
/// # Examples
///
/// ```
/// use spotibot::schedule::in_window;
///
/// assert!(in_window(10, 8, 22));
/// assert!(!in_window(22, 8, 22));
/// assert!(in_window(1, 22, 6));
/// assert!(in_window(13, 5, 5));
/// ```
pub fn in_window(now_hour: u32, start_hour: u32, end_hour: u32) -> bool {
    if start_hour == end_hour {
        return true;
    }

    if start_hour < end_hour {
        (start_hour..end_hour).contains(&now_hour)
    } else {
        now_hour >= start_hour || now_hour < end_hour
    }
}

/// Configured daily playback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    start_hour: u32,
    end_hour: u32,
}

impl ScheduleWindow {
    /// Create a window, rejecting hours outside `0..=23`.
    pub fn new(start_hour: u32, end_hour: u32) -> Result<Self> {
        if start_hour > 23 {
            bail!("start hour {start_hour} is out of range (0-23)");
        }
        if end_hour > 23 {
            bail!("end hour {end_hour} is out of range (0-23)");
        }

        Ok(Self { start_hour, end_hour })
    }

    pub fn start_hour(&self) -> u32 {
        self.start_hour
    }

    pub fn end_hour(&self) -> u32 {
        self.end_hour
    }

    /// Whether the window covers all 24 hours.
    pub fn is_continuous(&self) -> bool {
        self.start_hour == self.end_hour
    }

    /// Whether `now` falls inside the window.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        in_window(now.hour(), self.start_hour, self.end_hour)
    }

    /// Time left until the window next opens, zero when already inside.
    ///
    /// Used to cap the idle sleep outside the window so a long idle poll
    /// never sleeps through the start hour.
    pub fn until_open(&self, now: NaiveDateTime) -> Duration {
        if self.contains(now) {
            return Duration::ZERO;
        }

        let opens_at = NaiveTime::from_hms_opt(self.start_hour, 0, 0)
            .map(|time| now.date().and_time(time));

        let Some(mut opens_at) = opens_at else {
            return Duration::ZERO;
        };
        if opens_at <= now {
            opens_at += ChronoDuration::days(1);
        }

        (opens_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_continuous() {
            write!(f, "all day")
        } else {
            write!(f, "{:02}:00-{:02}:00", self.start_hour, self.end_hour)
        }
    }
}
