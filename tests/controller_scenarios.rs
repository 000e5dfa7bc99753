//! # Controller Scenarios
//!
//! Drives the playback controller with a scripted driver, a recording
//! notifier and a hand-set clock. Tokio time is paused so timeouts and sleeps
//! resolve instantly.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use spotibot::controller::{
    Action, Clock, ControllerSettings, OperationKind, PlaybackController, RunOutcome, SessionState,
};
use spotibot::driver::PlaybackDriver;
use spotibot::notifier::{Notifier, FAILURE_SUBJECT};

/// What the fake browser reports and how it misbehaves
#[derive(Debug, Default)]
struct Script {
    elsewhere: bool,
    elsewhere_fails: bool,
    sign_in_fails: bool,
    command_fails: bool,
    hang_commands: bool,
    stalled: bool,
    playing: bool,
    calls: Vec<&'static str>,
    shutdowns: u32,
}

#[derive(Clone, Default)]
struct FakeDriver {
    script: Arc<Mutex<Script>>,
}

impl FakeDriver {
    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn count(&self, call: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }
}

#[async_trait]
impl PlaybackDriver for FakeDriver {
    async fn sign_in(&mut self) -> Result<()> {
        let mut script = self.lock();
        script.calls.push("sign_in");
        if script.sign_in_fails {
            bail!("login button never appeared");
        }
        Ok(())
    }

    async fn is_playing_elsewhere(&mut self) -> Result<bool> {
        let mut script = self.lock();
        script.calls.push("check");
        if script.elsewhere_fails {
            bail!("device bar not found");
        }
        Ok(script.elsewhere)
    }

    async fn start_or_resume(&mut self, playlist: &str, shuffle: bool) -> Result<()> {
        assert_eq!(playlist, "https://open.spotify.com/playlist/abc");
        assert!(shuffle);

        let hang = {
            let mut script = self.lock();
            script.calls.push("start");
            script.hang_commands
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut script = self.lock();
        if script.command_fails {
            bail!("play button not clickable");
        }
        script.playing = true;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let mut script = self.lock();
        script.calls.push("pause");
        if script.command_fails {
            bail!("pause button not clickable");
        }
        script.playing = false;
        Ok(())
    }

    async fn is_actively_playing(&mut self) -> Result<bool> {
        let mut script = self.lock();
        script.calls.push("liveness");
        Ok(script.playing && !script.stalled)
    }

    async fn shutdown(&mut self) {
        self.lock().shutdowns += 1;
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
    fails: bool,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        if self.fails {
            bail!("smtp relay refused the connection");
        }
        Ok(())
    }
}

#[derive(Clone)]
struct ManualClock(Arc<Mutex<NaiveDateTime>>);

impl ManualClock {
    fn at(hour: u32, minute: u32) -> Self {
        Self(Arc::new(Mutex::new(time(hour, minute))))
    }

    fn set(&self, hour: u32, minute: u32) {
        *self.0.lock().unwrap() = time(hour, minute);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}

fn time(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 14)
        .and_then(|day| day.and_hms_opt(hour, minute, 0))
        .unwrap()
}

fn settings(start_hour: u32, end_hour: u32) -> ControllerSettings {
    ControllerSettings {
        playlist: "https://open.spotify.com/playlist/abc".to_string(),
        shuffle: true,
        start_hour,
        end_hour,
        poll_interval: Duration::from_secs(60),
        idle_poll_interval: Duration::from_secs(900),
        failure_threshold: 3,
        conflict_confirmations: 2,
        command_timeout: Duration::from_secs(5),
        notify_timeout: Duration::from_secs(5),
    }
}

type TestController = PlaybackController<FakeDriver, RecordingNotifier, ManualClock>;

fn controller(
    clock: &ManualClock,
    start_hour: u32,
    end_hour: u32,
) -> (TestController, FakeDriver, RecordingNotifier) {
    let driver = FakeDriver::default();
    let notifier = RecordingNotifier::default();
    let controller = PlaybackController::new(
        driver.clone(),
        notifier.clone(),
        clock.clone(),
        settings(start_hour, end_hour),
    )
    .unwrap();
    (controller, driver, notifier)
}

#[tokio::test(start_paused = true)]
async fn test_starts_inside_window_when_no_conflict() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);

    assert!(controller.sign_in().await);
    let report = controller.tick().await;

    assert!(report.window);
    assert_eq!(report.conflict, Some(false));
    assert_eq!(report.action, Action::StartOrResume);
    assert_eq!(controller.state(), &SessionState::Active);
    assert_eq!(driver.count("start"), 1);
    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pauses_after_conflict_is_confirmed_and_resumes_after_it_clears() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::Active);

    driver.lock().elsewhere = true;
    let report = controller.tick().await;
    assert_eq!(report.conflict, Some(false), "single reading must not flip");
    assert_eq!(controller.state(), &SessionState::Active);

    let report = controller.tick().await;
    assert_eq!(report.action, Action::Pause);
    assert_eq!(controller.state(), &SessionState::PausedForConflict);
    assert_eq!(driver.count("pause"), 1);

    driver.lock().elsewhere = false;
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::PausedForConflict);
    let report = controller.tick().await;
    assert_eq!(report.action, Action::StartOrResume);
    assert_eq!(controller.state(), &SessionState::Active);
    assert_eq!(driver.count("start"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_conflict_is_ignored() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    controller.tick().await;

    driver.lock().elsewhere = true;
    controller.tick().await;
    driver.lock().elsewhere = false;
    controller.tick().await;
    driver.lock().elsewhere = true;
    controller.tick().await;

    assert_eq!(controller.state(), &SessionState::Active);
    assert_eq!(driver.count("pause"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_at_start_up_never_starts_playback() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    driver.lock().elsewhere = true;

    for _ in 0..3 {
        let report = controller.tick().await;
        assert_eq!(report.conflict, Some(true));
    }

    assert_eq!(controller.state(), &SessionState::PausedForConflict);
    assert_eq!(driver.count("start"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pauses_when_window_closes() {
    let clock = ManualClock::at(21, 59);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::Active);

    clock.set(22, 0);
    let report = controller.tick().await;
    assert!(!report.window);
    assert_eq!(report.action, Action::Pause);
    assert_eq!(controller.state(), &SessionState::PausedOutsideWindow);

    clock.set(23, 30);
    let report = controller.tick().await;
    assert_eq!(report.action, Action::None);
    assert_eq!(driver.count("pause"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_wrapping_midnight() {
    let clock = ManualClock::at(23, 0);
    let (mut controller, _, _) = controller(&clock, 22, 6);

    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::Active);

    clock.set(3, 0);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::Active);

    clock.set(6, 0);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::PausedOutsideWindow);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_pause_becomes_window_pause_at_close() {
    let clock = ManualClock::at(21, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    driver.lock().elsewhere = true;
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::PausedForConflict);

    clock.set(22, 0);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::PausedOutsideWindow);
    assert_eq!(driver.count("pause"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_check_failures_escalate_once() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    driver.lock().elsewhere_fails = true;

    for attempt in 1..3 {
        let report = controller.tick().await;
        assert_eq!(report.conflict, None);
        assert_eq!(controller.failures().count(OperationKind::ConflictCheck), attempt);
        assert_eq!(controller.state(), &SessionState::NotStarted);
    }

    controller.tick().await;
    match controller.state() {
        SessionState::Failed(reason) => assert!(reason.contains("conflict check unavailable")),
        other => panic!("expected Failed, got {other:?}"),
    }

    controller.tick().await;
    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, FAILURE_SUBJECT);
    assert!(sent[0].1.contains("conflict check unavailable"));
    assert!(sent[0].1.contains("Consecutive failures: 3"));
    assert_eq!(driver.count("start"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_failure_count() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);

    driver.lock().command_fails = true;
    controller.tick().await;
    controller.tick().await;
    assert_eq!(controller.failures().count(OperationKind::PlaybackCommand), 2);

    driver.lock().command_fails = false;
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::Active);
    assert_eq!(controller.failures().count(OperationKind::PlaybackCommand), 0);

    driver.lock().command_fails = true;
    driver.lock().elsewhere = true;
    for _ in 0..4 {
        controller.tick().await;
    }
    assert!(matches!(controller.state(), SessionState::Failed(_)));
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_command_times_out_and_counts() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);
    driver.lock().hang_commands = true;

    let report = controller.tick().await;
    assert_eq!(report.action, Action::StartOrResume);
    assert_eq!(controller.state(), &SessionState::NotStarted);
    assert_eq!(controller.failures().count(OperationKind::PlaybackCommand), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_playback_is_restarted() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    controller.tick().await;

    driver.lock().stalled = true;
    let report = controller.tick().await;
    assert_eq!(report.action, Action::CheckLiveness);
    assert_eq!(driver.count("start"), 2);
    assert_eq!(controller.state(), &SessionState::Active);
    assert_eq!(controller.failures().count(OperationKind::Liveness), 1);

    driver.lock().stalled = false;
    controller.tick().await;
    assert_eq!(controller.failures().count(OperationKind::Liveness), 0);
    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_persistent_stall_escalates() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    controller.tick().await;

    driver.lock().stalled = true;
    for _ in 0..3 {
        controller.tick().await;
    }

    match controller.state() {
        SessionState::Failed(reason) => assert!(reason.contains("playback stalled")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_cancel_and_shuts_down() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        trigger.cancel();
    });

    let outcome = controller.run(cancel).await;

    assert_eq!(outcome, RunOutcome::Stopped);
    assert_eq!(outcome.exit_code(), std::process::ExitCode::SUCCESS);
    assert_eq!(driver.lock().shutdowns, 1);
    assert_eq!(driver.count("sign_in"), 1);
    assert_eq!(driver.count("start"), 1);
    assert!(driver.count("check") >= 3);
    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_polls_slowly_outside_window() {
    let clock = ManualClock::at(3, 0);
    let (mut controller, driver, _) = controller(&clock, 8, 22);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3500)).await;
        trigger.cancel();
    });

    assert_eq!(controller.run(cancel).await, RunOutcome::Stopped);
    assert_eq!(controller.state(), &SessionState::NotStarted);
    assert_eq!(driver.count("check"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_run_escalates_when_sign_in_keeps_failing() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    driver.lock().sign_in_fails = true;

    let outcome = controller.run(CancellationToken::new()).await;

    match &outcome {
        RunOutcome::Failed(reason) => assert!(reason.contains("sign-in failed")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(outcome.exit_code(), std::process::ExitCode::from(3));
    assert_eq!(driver.count("sign_in"), 3);
    assert_eq!(driver.count("check"), 0);
    assert_eq!(driver.lock().shutdowns, 1);
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifier_failure_still_stops() {
    let clock = ManualClock::at(10, 0);
    let driver = FakeDriver::default();
    let notifier = RecordingNotifier {
        fails: true,
        ..Default::default()
    };
    driver.lock().elsewhere_fails = true;

    let mut controller =
        PlaybackController::new(driver.clone(), notifier.clone(), clock, settings(8, 22)).unwrap();
    let outcome = controller.run(CancellationToken::new()).await;

    assert!(matches!(outcome, RunOutcome::Failed(_)));
    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(driver.lock().shutdowns, 1);
}

#[tokio::test(start_paused = true)]
async fn test_command_failures_escalate_on_third_tick() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    driver.lock().command_fails = true;

    controller.tick().await;
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::NotStarted);
    assert!(notifier.sent().is_empty());

    let report = controller.tick().await;
    match &report.state {
        SessionState::Failed(reason) => assert!(reason.contains("playback command failed")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(driver.count("start"), 3);
    assert_eq!(notifier.sent().len(), 1);
    assert!(notifier.sent()[0].1.contains("State before failure: not started"));
}

#[tokio::test(start_paused = true)]
async fn test_stall_before_window_close_does_not_keep_fast_polling() {
    let clock = ManualClock::at(21, 58);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    controller.tick().await;

    driver.lock().stalled = true;
    controller.tick().await;
    assert_eq!(controller.failures().count(OperationKind::Liveness), 1);
    assert_eq!(controller.state(), &SessionState::Active);

    clock.set(22, 0);
    controller.tick().await;
    assert_eq!(controller.state(), &SessionState::PausedOutsideWindow);
    assert_eq!(controller.failures().count(OperationKind::Liveness), 0);

    clock.set(23, 0);
    let checks_before = driver.count("check");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3500)).await;
        trigger.cancel();
    });

    assert_eq!(controller.run(cancel).await, RunOutcome::Stopped);
    assert_eq!(driver.count("check") - checks_before, 4);
    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalls_in_separate_active_stretches_do_not_add_up() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    controller.tick().await;

    driver.lock().stalled = true;
    for _ in 0..2 {
        controller.tick().await;
        controller.tick().await;
        assert_eq!(controller.failures().count(OperationKind::Liveness), 2);
        assert_eq!(controller.state(), &SessionState::Active);

        clock.set(22, 0);
        controller.tick().await;
        assert_eq!(controller.state(), &SessionState::PausedOutsideWindow);
        assert_eq!(controller.failures().count(OperationKind::Liveness), 0);

        clock.set(10, 0);
        let report = controller.tick().await;
        assert_eq!(report.action, Action::StartOrResume);
        assert_eq!(controller.state(), &SessionState::Active);
    }

    assert!(notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_exits_fatal_after_repeated_command_failures() {
    let clock = ManualClock::at(10, 0);
    let (mut controller, driver, notifier) = controller(&clock, 8, 22);
    driver.lock().command_fails = true;

    let outcome = controller.run(CancellationToken::new()).await;

    match &outcome {
        RunOutcome::Failed(reason) => assert!(reason.contains("playback command failed")),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(outcome.exit_code(), std::process::ExitCode::from(3));
    assert_eq!(driver.count("sign_in"), 1);
    assert_eq!(driver.count("start"), 3);
    assert_eq!(driver.lock().shutdowns, 1);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, FAILURE_SUBJECT);
}
