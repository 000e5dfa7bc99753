//! # Playback Controller
//!
//! The control loop that decides, every polling tick, whether automated
//! playback should start, continue, pause or resume.
//!
//! ## Inputs
//!
//! - **Schedule**: is the current hour inside the configured window
//! - **Conflict**: is another device on the account playing (debounced)
//! - **Outcomes**: did the last browser command succeed
//!
//! ## State Machine
//!
//! ```text
//! NotStarted ──► Active ◄──► PausedForConflict
//!                  ▲
//!                  └───────► PausedOutsideWindow
//!
//! any state ──► Failed (terminal)
//! ```
//!
//! Conflict always wins over the schedule: when someone is listening on
//! another device the bot stays out of the way, window or not.
//!
//! ## Failure Policy
//!
//! Every capability call gets a bounded timeout, and a failure only counts
//! toward a per-operation [`FailureCounter`]. A success resets that operation's count.
//! When one operation fails `threshold` times in a row the controller enters
//! [`SessionState::Failed`], notifies the operator once and stops. Nothing a
//! capability returns can panic or unwind out of the loop.

use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::conflict::ConflictMonitor;
use crate::driver::PlaybackDriver;
use crate::notifier::{Notifier, FAILURE_SUBJECT};
use crate::schedule::ScheduleWindow;

/// Process exit code after a fatal escalation.
pub const EXIT_FATAL: u8 = 3;

/// Upper bound on how long the final browser shutdown may take.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the automated session currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Active,
    PausedForConflict,
    PausedOutsideWindow,
    /// Terminal. Carries the reason reported to the operator.
    Failed(String),
}

impl SessionState {
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::NotStarted => write!(f, "not started"),
            SessionState::Active => write!(f, "active"),
            SessionState::PausedForConflict => write!(f, "paused (other device playing)"),
            SessionState::PausedOutsideWindow => write!(f, "paused (outside window)"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Capability operations tracked separately by the [`FailureCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    SignIn,
    ConflictCheck,
    PlaybackCommand,
    Liveness,
}

impl OperationKind {
    pub fn label(self) -> &'static str {
        match self {
            OperationKind::SignIn => "sign-in",
            OperationKind::ConflictCheck => "conflict check",
            OperationKind::PlaybackCommand => "playback command",
            OperationKind::Liveness => "liveness check",
        }
    }

    fn failure_reason(self) -> &'static str {
        match self {
            OperationKind::SignIn => "sign-in failed",
            OperationKind::ConflictCheck => "conflict check unavailable",
            OperationKind::PlaybackCommand => "playback command failed",
            OperationKind::Liveness => "playback stalled",
        }
    }
}

/// Consecutive failure counts per operation kind.
#[derive(Debug, Clone)]
pub struct FailureCounter {
    threshold: u32,
    counts: HashMap<OperationKind, u32>,
}

impl FailureCounter {
    /// `threshold` is the failure count that escalates; values below 1 mean 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
        }
    }

    /// Count one more failure, returning the new consecutive count.
    pub fn record_failure(&mut self, kind: OperationKind) -> u32 {
        let count = self.counts.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, kind: OperationKind) {
        if let Some(previous) = self.counts.remove(&kind) {
            debug!("{} recovered after {previous} failure(s)", kind.label());
        }
    }

    /// Forget any failures of `kind` without treating it as a recovery.
    pub fn clear(&mut self, kind: OperationKind) {
        self.counts.remove(&kind);
    }

    pub fn count(&self, kind: OperationKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn is_exhausted(&self, kind: OperationKind) -> bool {
        self.count(kind) >= self.threshold
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn any_pending(&self) -> bool {
        !self.counts.is_empty()
    }
}

/// Playback command chosen for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No command; the state may still change.
    None,
    Pause,
    StartOrResume,
    /// Already active: confirm the session is really playing.
    CheckLiveness,
}

/// Outcome of the decision table: what to do and where it leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub next: SessionState,
}

/// The decision table. Pure; commands are carried out by the controller.
///
/// | window | conflict | state | action |
/// |---|---|---|---|
/// | no | any | Active | pause → PausedOutsideWindow |
/// | no | any | PausedForConflict | → PausedOutsideWindow |
/// | no | any | PausedOutsideWindow, NotStarted | none |
/// | yes | yes | Active | pause → PausedForConflict |
/// | yes | yes | NotStarted, PausedOutsideWindow | → PausedForConflict |
/// | yes | yes | PausedForConflict | none |
/// | yes | no | any paused, NotStarted | start/resume → Active |
/// | yes | no | Active | liveness check |
pub fn decide(window: bool, conflict: bool, state: &SessionState) -> Decision {
    use SessionState::*;

    let (action, next) = match (window, conflict, state) {
        (_, _, Failed(reason)) => (Action::None, Failed(reason.clone())),

        (false, _, Active) => (Action::Pause, PausedOutsideWindow),
        (false, _, PausedForConflict) => (Action::None, PausedOutsideWindow),
        (false, _, paused_or_idle) => (Action::None, paused_or_idle.clone()),

        (true, true, Active) => (Action::Pause, PausedForConflict),
        (true, true, _) => (Action::None, PausedForConflict),

        (true, false, Active) => (Action::CheckLiveness, Active),
        (true, false, _) => (Action::StartOrResume, Active),
    };

    Decision { action, next }
}

/// What one tick observed and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub window: bool,
    /// Debounced conflict state; `None` when the reading failed.
    pub conflict: Option<bool>,
    pub action: Action,
    pub state: SessionState,
}

/// How [`PlaybackController::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Operator asked to stop.
    Stopped,
    /// Escalated; the operator has been notified (best-effort).
    Failed(String),
}

impl RunOutcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunOutcome::Stopped => ExitCode::SUCCESS,
            RunOutcome::Failed(_) => ExitCode::from(EXIT_FATAL),
        }
    }
}

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The system's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Loop parameters, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub playlist: String,
    pub shuffle: bool,
    pub start_hour: u32,
    pub end_hour: u32,
    pub poll_interval: Duration,
    pub idle_poll_interval: Duration,
    pub failure_threshold: u32,
    pub conflict_confirmations: u32,
    pub command_timeout: Duration,
    pub notify_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            playlist: config.playlist_link.clone(),
            shuffle: config.shuffle,
            start_hour: config.start_hour,
            end_hour: config.end_hour,
            poll_interval: config.tuning.poll_interval,
            idle_poll_interval: config.tuning.idle_poll_interval,
            failure_threshold: config.tuning.failure_threshold,
            conflict_confirmations: config.tuning.conflict_confirmations,
            command_timeout: config.tuning.command_timeout,
            notify_timeout: config.tuning.notify_timeout,
        }
    }
}

/// Await `call`, turning a timeout into an ordinary failure.
async fn bounded<T>(limit: Duration, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{what} timed out after {}s", limit.as_secs())),
    }
}

/// Owns the session state and drives the playback capability.
pub struct PlaybackController<D, N, C = SystemClock> {
    driver: D,
    notifier: N,
    clock: C,
    settings: ControllerSettings,
    window: ScheduleWindow,
    monitor: ConflictMonitor,
    failures: FailureCounter,
    state: SessionState,
}

impl<D, N, C> PlaybackController<D, N, C>
where
    D: PlaybackDriver,
    N: Notifier,
    C: Clock,
{
    /// Create a controller in [`SessionState::NotStarted`].
    pub fn new(driver: D, notifier: N, clock: C, settings: ControllerSettings) -> Result<Self> {
        let window = ScheduleWindow::new(settings.start_hour, settings.end_hour)?;

        Ok(Self {
            driver,
            notifier,
            clock,
            window,
            monitor: ConflictMonitor::new(settings.conflict_confirmations),
            failures: FailureCounter::new(settings.failure_threshold),
            state: SessionState::NotStarted,
            settings,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn failures(&self) -> &FailureCounter {
        &self.failures
    }

    pub fn conflict_monitor(&self) -> &ConflictMonitor {
        &self.monitor
    }

    pub fn window(&self) -> &ScheduleWindow {
        &self.window
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Sign in, then tick until cancelled or failed.
    ///
    /// The driver is shut down before returning, whichever way the loop
    /// ended.
    pub async fn run(&mut self, cancel: CancellationToken) -> RunOutcome {
        info!(
            "Playback controller starting: window {}, poll every {}s, escalate after {} failures",
            self.window,
            self.settings.poll_interval.as_secs(),
            self.failures.threshold()
        );

        let outcome = self.drive(&cancel).await;

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.driver.shutdown()).await.is_err() {
            warn!("Driver shutdown timed out after {}s", SHUTDOWN_TIMEOUT.as_secs());
        }

        match &outcome {
            RunOutcome::Stopped => info!("Playback controller stopped"),
            RunOutcome::Failed(reason) => error!("Playback controller gave up: {reason}"),
        }
        outcome
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> RunOutcome {
        loop {
            if cancel.is_cancelled() {
                return RunOutcome::Stopped;
            }
            if self.sign_in().await {
                break;
            }
            if let SessionState::Failed(reason) = &self.state {
                return RunOutcome::Failed(reason.clone());
            }
            if !self.sleep_or_cancel(self.settings.poll_interval, cancel).await {
                return RunOutcome::Stopped;
            }
        }

        loop {
            if cancel.is_cancelled() {
                return RunOutcome::Stopped;
            }

            let report = self.tick().await;
            if let SessionState::Failed(reason) = &report.state {
                return RunOutcome::Failed(reason.clone());
            }

            let delay = self.next_delay(&report);
            debug!("Next tick in {}s", delay.as_secs());
            if !self.sleep_or_cancel(delay, cancel).await {
                return RunOutcome::Stopped;
            }
        }
    }

    /// Returns `false` if cancelled before `delay` elapsed.
    async fn sleep_or_cancel(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stop requested");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// One sign-in attempt. Returns whether the session is ready.
    pub async fn sign_in(&mut self) -> bool {
        let limit = self.settings.command_timeout;
        match bounded(limit, "sign-in", self.driver.sign_in()).await {
            Ok(()) => {
                self.failures.record_success(OperationKind::SignIn);
                info!("Signed in");
                true
            }
            Err(e) => {
                self.fail(OperationKind::SignIn, e).await;
                false
            }
        }
    }

    /// Run one polling tick.
    pub async fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let window = self.window.contains(now);

        if self.state.is_failed() {
            return self.report(window, None, Action::None);
        }

        let limit = self.settings.command_timeout;
        let conflict = match bounded(limit, "conflict check", self.driver.is_playing_elsewhere()).await {
            Ok(raw) => {
                self.failures.record_success(OperationKind::ConflictCheck);
                self.monitor.observe(raw, Instant::now())
            }
            Err(e) => {
                self.monitor.observe_unknown();
                self.fail(OperationKind::ConflictCheck, e).await;
                return self.report(window, None, Action::None);
            }
        };

        let decision = decide(window, conflict, &self.state);
        debug!(
            "Tick at {}: window={window} conflict={conflict} state={} -> {:?}",
            now.format("%H:%M"),
            self.state,
            decision.action
        );

        match decision.action {
            Action::None => self.transition(decision.next),
            Action::Pause => self.pause_playback(decision.next).await,
            Action::StartOrResume => self.start_playback().await,
            Action::CheckLiveness => self.check_liveness().await,
        }

        self.report(window, Some(conflict), decision.action)
    }

    fn report(&self, window: bool, conflict: Option<bool>, action: Action) -> TickReport {
        TickReport {
            window,
            conflict,
            action,
            state: self.state.clone(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if next != self.state {
            info!("Session {} -> {}", self.state, next);
            // Stalls only count within one active stretch.
            if self.state == SessionState::Active {
                self.failures.clear(OperationKind::Liveness);
            }
            self.state = next;
        }
    }

    async fn pause_playback(&mut self, next: SessionState) {
        let limit = self.settings.command_timeout;
        match bounded(limit, "pause", self.driver.pause()).await {
            Ok(()) => {
                self.failures.record_success(OperationKind::PlaybackCommand);
                self.transition(next);
            }
            Err(e) => {
                self.fail(OperationKind::PlaybackCommand, e.context("pause")).await;
            }
        }
    }

    async fn start_playback(&mut self) {
        let limit = self.settings.command_timeout;
        let call = self
            .driver
            .start_or_resume(&self.settings.playlist, self.settings.shuffle);

        match bounded(limit, "start/resume", call).await {
            Ok(()) => {
                self.failures.record_success(OperationKind::PlaybackCommand);
                self.transition(SessionState::Active);
            }
            Err(e) => {
                self.fail(OperationKind::PlaybackCommand, e.context("start/resume")).await;
            }
        }
    }

    /// A session believed active that is not playing is restarted right away;
    /// it escalates once the stall persists for `threshold` checks.
    async fn check_liveness(&mut self) {
        let limit = self.settings.command_timeout;
        let playing = bounded(limit, "liveness check", self.driver.is_actively_playing())
            .await
            .and_then(|playing| {
                if playing {
                    Ok(())
                } else {
                    Err(anyhow!("session is active but the player is not playing"))
                }
            });

        match playing {
            Ok(()) => self.failures.record_success(OperationKind::Liveness),
            Err(e) => {
                if self.fail(OperationKind::Liveness, e).await {
                    return;
                }
                info!("Restarting stalled playback");
                self.start_playback().await;
            }
        }
    }

    /// Count a failure; escalate at the threshold. Returns whether it escalated.
    async fn fail(&mut self, kind: OperationKind, error: anyhow::Error) -> bool {
        let count = self.failures.record_failure(kind);

        if self.failures.is_exhausted(kind) {
            let reason = format!("{}: {error:#}", kind.failure_reason());
            self.escalate(kind, reason).await;
            return true;
        }

        warn!(
            "{} failed ({count}/{}), retrying next tick: {error:#}",
            kind.label(),
            self.failures.threshold()
        );
        false
    }

    async fn escalate(&mut self, kind: OperationKind, reason: String) {
        if self.state.is_failed() {
            return;
        }

        let previous = std::mem::replace(&mut self.state, SessionState::Failed(reason.clone()));
        error!("Giving up after repeated {} failures: {reason}", kind.label());

        let body = self.failure_report(kind, &previous, &reason);
        let limit = self.settings.notify_timeout;
        match bounded(limit, "notification", self.notifier.notify(FAILURE_SUBJECT, &body)).await {
            Ok(()) => info!("Operator notified"),
            Err(e) => warn!("Could not notify operator: {e:#}"),
        }
    }

    fn failure_report(&self, kind: OperationKind, previous: &SessionState, reason: &str) -> String {
        format!(
            "SpotiBot stopped and needs attention.\n\n\
             Reason: {reason}\n\
             Operation: {}\n\
             Consecutive failures: {}\n\
             State before failure: {previous}\n\
             Window: {}\n\
             Time: {}\n",
            kind.label(),
            self.failures.count(kind),
            self.window,
            self.clock.now().format("%Y-%m-%d %H:%M:%S"),
        )
    }

    /// Idle polling only applies once the session has settled outside the
    /// window; anything still being retried keeps the normal interval.
    fn next_delay(&self, report: &TickReport) -> Duration {
        let settled = matches!(
            self.state,
            SessionState::PausedOutsideWindow | SessionState::NotStarted
        );

        if report.window || !settled || self.failures.any_pending() {
            return self.settings.poll_interval;
        }

        let until_open = self.window.until_open(self.clock.now()) + Duration::from_secs(1);
        self.settings
            .idle_poll_interval
            .min(until_open)
            .max(Duration::from_secs(1))
    }
}
