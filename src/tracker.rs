use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::accountant::{SessionAccountant, SessionState, StatusHandle, TickOutcome};
use crate::enforcement::CountdownNotifier;
use crate::error::EngineError;
use crate::event_log::{EndReason, SessionGoal};

/// How a tracked session finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub user_id: String,
    pub state: SessionState,
    pub reason: Option<EndReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub seconds_used_today: u64,
    pub remaining_seconds: u64,
    pub session_seconds: u64,
}

/// Drives a [`SessionAccountant`] on a fixed interval until the quota runs out
/// or shutdown is requested
pub struct SessionTracker {
    accountant: SessionAccountant,
    status: StatusHandle,
    notifier: Arc<dyn CountdownNotifier>,
    interval: Duration,
    warnings_minutes: Vec<u32>,
    warned: BTreeSet<u32>,
}

impl SessionTracker {
    pub fn new(
        accountant: SessionAccountant,
        notifier: Arc<dyn CountdownNotifier>,
        interval: Duration,
        warnings_minutes: Vec<u32>,
    ) -> Self {
        Self {
            status: accountant.status_handle(),
            accountant,
            notifier,
            interval,
            warnings_minutes,
            warned: BTreeSet::new(),
        }
    }

    /// Run the session to completion
    ///
    /// Ticks are synchronous units of work; they run on the blocking pool so a
    /// slow logout does not stall the runtime. Requires the multi-threaded
    /// runtime.
    pub async fn run<F>(
        mut self,
        goal: Option<SessionGoal>,
        shutdown: F,
    ) -> Result<SessionSummary, EngineError>
    where
        F: Future<Output = ()>,
    {
        let accountant = &mut self.accountant;
        let state = tokio::task::block_in_place(|| accountant.start(goal))?;
        if matches!(state, SessionState::Ended | SessionState::Exhausted) {
            return Ok(self.summary());
        }

        info!(
            "Tracking {} every {:?} (session {})",
            self.accountant.user_id(),
            self.interval,
            self.accountant.session_id()
        );

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, ending session");
                    let accountant = &mut self.accountant;
                    tokio::task::block_in_place(|| accountant.end())?;
                    break;
                }
                _ = interval.tick() => {
                    let accountant = &mut self.accountant;
                    match tokio::task::block_in_place(|| accountant.tick())? {
                        TickOutcome::Advanced { seconds_used, remaining_seconds } => {
                            let snapshot = self.status.snapshot();
                            debug!(
                                "{} {}: {}s used ({}s published for {:?}), {}s left",
                                self.accountant.user_id(),
                                snapshot.state.as_str(),
                                seconds_used,
                                snapshot.seconds_used,
                                snapshot.day,
                                remaining_seconds
                            );
                            self.maybe_warn(snapshot.remaining_seconds);
                        }
                        TickOutcome::Exhausted | TickOutcome::Inactive => break,
                    }
                }
            }
        }

        Ok(self.summary())
    }

    /// Send the smallest newly crossed countdown warning, once per threshold
    fn maybe_warn(&mut self, remaining_seconds: u64) {
        if self.status.state() != SessionState::Running || remaining_seconds == 0 {
            return;
        }

        let crossed: Vec<u32> = self
            .warnings_minutes
            .iter()
            .copied()
            .filter(|m| remaining_seconds <= u64::from(*m) * 60 && !self.warned.contains(m))
            .collect();

        if let Some(&minutes) = crossed.iter().min() {
            debug!("Crossed warning thresholds {:?}", crossed);
            self.notifier
                .send_warning(self.accountant.user_id(), minutes);
            self.warned.extend(crossed);
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            user_id: self.accountant.user_id().to_string(),
            state: self.accountant.state(),
            reason: self.accountant.end_reason(),
            started_at: self.accountant.session_start(),
            seconds_used_today: self
                .accountant
                .current()
                .map(|r| r.seconds_used)
                .unwrap_or(0),
            remaining_seconds: self.status.remaining_seconds(),
            session_seconds: self.accountant.session_seconds(),
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::tests::{CountingTerminator, Harness, RecordingLog, quota};
    use crate::accountant::Collaborators;
    use crate::clock::{Clock, ManualClock};
    use crate::config::BypassSwitch;
    use crate::event_log::EventKind;
    use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
    use std::sync::Mutex;

    /// Every reading moves time forward by `step` seconds
    struct SteppingClock {
        inner: ManualClock,
        step: i64,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            self.inner.advance_secs(self.step);
            self.inner.now()
        }

        fn local_day(&self, at: DateTime<Utc>) -> NaiveDate {
            self.inner.local_day(at)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        warnings: Mutex<Vec<u32>>,
    }

    impl CountdownNotifier for RecordingNotifier {
        fn send_warning(&self, _user_id: &str, minutes_remaining: u32) {
            self.warnings.lock().unwrap().push(minutes_remaining);
        }
    }

    fn stepping_deps(h: &Harness, step: i64) -> Collaborators {
        let offset = FixedOffset::east_opt(0).unwrap();
        Collaborators {
            clock: Arc::new(SteppingClock {
                inner: ManualClock::at_local("2025-11-16 10:00:00", offset).unwrap(),
                step,
            }),
            ..h.deps()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_until_exhausted() {
        let h = Harness::at("2025-11-16 10:00:00");
        let accountant = SessionAccountant::new(
            "alice",
            &quota(300, 30),
            BypassSwitch::default(),
            stepping_deps(&h, 30),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = SessionTracker::new(
            accountant,
            notifier.clone(),
            Duration::from_millis(5),
            vec![5, 1],
        );

        let summary = tracker
            .run(None, std::future::pending())
            .await
            .unwrap();

        assert_eq!(summary.state, SessionState::Ended);
        assert_eq!(summary.reason, Some(EndReason::LimitReached));
        assert!(summary.seconds_used_today >= 300);
        assert_eq!(summary.remaining_seconds, 0);
        assert!(summary.started_at.is_some());
        assert_eq!(h.terminator.count(), 1);
        assert_eq!(h.log.kinds(), vec![EventKind::Start, EventKind::Exhausted]);
        // 300s budget starts inside the 5 minute window
        assert_eq!(notifier.warnings.lock().unwrap().first(), Some(&5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_ends_session_normally() {
        let h = Harness::at("2025-11-16 10:00:00");
        let accountant = SessionAccountant::new(
            "alice",
            &quota(100_000, 30),
            BypassSwitch::default(),
            stepping_deps(&h, 1),
        );
        let tracker = SessionTracker::new(
            accountant,
            Arc::new(RecordingNotifier::default()),
            Duration::from_millis(5),
            vec![],
        );

        let summary = tracker
            .run(None, time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(summary.state, SessionState::Ended);
        assert_eq!(summary.reason, Some(EndReason::Logout));
        assert_eq!(h.terminator.count(), 0);
        assert_eq!(h.log.kinds(), vec![EventKind::Start, EventKind::End]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_already_exhausted_returns_without_ticking() {
        let h = Harness::at("2025-11-16 10:00:00");
        h.store
            .seed("alice", NaiveDate::from_ymd_opt(2025, 11, 16).unwrap(), 1800);
        let accountant = h.accountant(&quota(1800, 30), BypassSwitch::default());
        let tracker = SessionTracker::new(
            accountant,
            Arc::new(RecordingNotifier::default()),
            Duration::from_secs(3600),
            vec![5, 1],
        );

        let summary = tracker.run(None, std::future::pending()).await.unwrap();
        assert_eq!(summary.reason, Some(EndReason::LimitReached));
        assert_eq!(summary.session_seconds, 0);
        assert_eq!(h.terminator.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enforcement_failure_propagates() {
        let h = Harness::with(
            "2025-11-16 10:00:00",
            RecordingLog::default(),
            CountingTerminator {
                fail: true,
                ..Default::default()
            },
        );
        let accountant = SessionAccountant::new(
            "alice",
            &quota(60, 30),
            BypassSwitch::default(),
            stepping_deps(&h, 30),
        );
        let tracker = SessionTracker::new(
            accountant,
            Arc::new(RecordingNotifier::default()),
            Duration::from_millis(5),
            vec![],
        );

        let err = tracker.run(None, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, EngineError::Enforcement(_)));
    }

    #[test]
    fn test_warnings_fire_once_per_threshold() {
        let h = Harness::at("2025-11-16 10:00:00");
        let mut accountant = h.accountant(&quota(1800, 30), BypassSwitch::default());
        accountant.start(None).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut tracker = SessionTracker::new(
            accountant,
            notifier.clone(),
            Duration::from_secs(30),
            vec![5, 1],
        );

        tracker.maybe_warn(600);
        tracker.maybe_warn(300);
        tracker.maybe_warn(270);
        tracker.maybe_warn(30);
        tracker.maybe_warn(0);

        assert_eq!(*notifier.warnings.lock().unwrap(), vec![5, 1]);
    }

    #[test]
    fn test_jumping_past_thresholds_sends_smallest() {
        let h = Harness::at("2025-11-16 10:00:00");
        let mut accountant = h.accountant(&quota(1800, 30), BypassSwitch::default());
        accountant.start(None).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut tracker = SessionTracker::new(
            accountant,
            notifier.clone(),
            Duration::from_secs(30),
            vec![15, 5, 1],
        );

        tracker.maybe_warn(45);
        tracker.maybe_warn(20);
        assert_eq!(*notifier.warnings.lock().unwrap(), vec![1]);
    }
}
