//! Session accounting and enforcement.
//!
//! The accountant is the single writer of the current day's usage record. It is
//! driven by ticks; every tick credits the wall-clock time since the previous
//! one, persists the record, and checks the quota. Readers (a countdown UI, the
//! status command) go through [`StatusHandle`], which is a pair of atomics and
//! never waits on the tick loop.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{BypassSwitch, QuotaConfig};
use crate::enforcement::{SessionTerminator, Termination};
use crate::error::{EngineError, StoreError};
use crate::event_log::{EndReason, EventKind, EventLog, SessionEvent, SessionGoal};
use crate::store::{UsageRecord, UsageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Not started yet
    Idle = 0,
    Running = 1,
    /// Bypass switch set: time is counted for display, never enforced
    Unenforced = 2,
    /// Quota spent and termination requested but not confirmed
    Exhausted = 3,
    Ended = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Unenforced,
            3 => Self::Exhausted,
            4 => Self::Ended,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Unenforced => "unenforced",
            Self::Exhausted => "exhausted",
            Self::Ended => "ended",
        }
    }
}

/// Read-only view of the accountant's latest saved state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub day: Option<NaiveDate>,
    pub seconds_used: u64,
    pub remaining_seconds: u64,
}

#[derive(Debug)]
struct SharedStatus {
    /// Day (days from CE) in the high half, seconds used in the low half, so
    /// both change together in one store.
    usage: AtomicU64,
    state: AtomicU8,
    limit: u64,
}

/// Cheap, cloneable, lock-free query handle
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<SharedStatus>,
}

impl StatusHandle {
    fn new(limit: u64) -> Self {
        Self {
            inner: Arc::new(SharedStatus {
                usage: AtomicU64::new(0),
                state: AtomicU8::new(SessionState::Idle as u8),
                limit,
            }),
        }
    }

    fn publish_usage(&self, record: &UsageRecord) {
        let day = chrono::Datelike::num_days_from_ce(&record.day).max(0) as u64;
        let secs = record.seconds_used.min(u32::MAX as u64);
        self.inner.usage.store((day << 32) | secs, Ordering::Release);
    }

    fn publish_state(&self, state: SessionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let packed = self.inner.usage.load(Ordering::Acquire);
        let days = (packed >> 32) as i32;
        let seconds_used = packed & u32::MAX as u64;
        StatusSnapshot {
            state: SessionState::from_u8(self.inner.state.load(Ordering::Acquire)),
            day: (days > 0)
                .then(|| NaiveDate::from_num_days_from_ce_opt(days))
                .flatten(),
            seconds_used,
            remaining_seconds: self.inner.limit.saturating_sub(seconds_used),
        }
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.snapshot().remaining_seconds
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }
}

/// Result of a single tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced {
        seconds_used: u64,
        remaining_seconds: u64,
    },
    /// This tick spent the quota (or lost the store) and the session was ended
    Exhausted,
    /// Session already over; nothing was done
    Inactive,
}

/// Injected collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn UsageStore>,
    pub events: Arc<dyn EventLog>,
    pub terminator: Arc<dyn SessionTerminator>,
}

pub struct SessionAccountant {
    user_id: String,
    session_id: Uuid,
    limit: u64,
    tick_interval: u64,
    max_credit_ms: i64,
    bypass: BypassSwitch,
    deps: Collaborators,

    state: SessionState,
    goal: Option<SessionGoal>,
    current: Option<UsageRecord>,
    session_start: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
    carry_ms: i64,
    session_seconds: u64,
    end_reason: Option<EndReason>,
    termination_requested: bool,
    status: StatusHandle,
}

impl SessionAccountant {
    pub fn new(
        user_id: impl Into<String>,
        config: &QuotaConfig,
        bypass: BypassSwitch,
        deps: Collaborators,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: Uuid::new_v4(),
            limit: config.daily_limit_seconds,
            tick_interval: config.tick_interval_seconds,
            max_credit_ms: (config.max_tick_credit_seconds() as i64).saturating_mul(1000),
            bypass,
            deps,
            state: SessionState::Idle,
            goal: None,
            current: None,
            session_start: None,
            last_tick: None,
            carry_ms: 0,
            session_seconds: 0,
            end_reason: None,
            termination_requested: false,
            status: StatusHandle::new(config.daily_limit_seconds),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start
    }

    /// In-memory record; the source of truth for the exhaustion decision
    pub fn current(&self) -> Option<&UsageRecord> {
        self.current.as_ref()
    }

    /// Seconds credited during this session, across day boundaries
    pub fn session_seconds(&self) -> u64 {
        self.session_seconds
    }

    /// Read-only remaining-time view, safe to poll from other threads
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.status.publish_state(state);
    }

    /// Begin the session: load today's record and log the start
    ///
    /// A user who is already over budget is sent straight to exhaustion
    /// without waiting for a tick.
    pub fn start(&mut self, goal: Option<SessionGoal>) -> Result<SessionState, EngineError> {
        if self.state != SessionState::Idle {
            return Err(EngineError::AlreadyStarted(self.user_id.clone()));
        }

        let now = self.deps.clock.now();
        let today = self.deps.clock.local_day(now);
        self.session_start = Some(now);
        self.last_tick = Some(now);
        self.goal = goal;

        let loaded = self.deps.store.load(&self.user_id, today);
        let store_failure = match loaded {
            Ok(record) => {
                self.current = Some(record);
                None
            }
            Err(e) => {
                error!("Usage store unavailable at session start for {}: {}", self.user_id, e);
                self.current = Some(UsageRecord::new(&self.user_id, today));
                Some(e)
            }
        };
        if let Some(record) = &self.current {
            self.status.publish_usage(record);
        }

        self.record_event(EventKind::Start, None);

        if self.bypass.is_enabled() {
            warn!("Enforcement bypass is set; {} will not be limited", self.user_id);
            self.set_state(SessionState::Unenforced);
            return Ok(self.state);
        }

        self.set_state(SessionState::Running);
        let used = self.current.as_ref().map(|r| r.seconds_used).unwrap_or(0);
        info!(
            "Session started for {} on {} ({}s of {}s used)",
            self.user_id, today, used, self.limit
        );

        if store_failure.is_some() {
            return self.exhaust(EndReason::StoreUnavailable, true);
        }
        if used >= self.limit {
            info!("{} is already over today's limit", self.user_id);
            return self.exhaust(EndReason::LimitReached, true);
        }

        Ok(self.state)
    }

    /// One accounting step
    pub fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        match self.state {
            SessionState::Running | SessionState::Unenforced => {}
            SessionState::Idle => return Err(EngineError::NotStarted(self.user_id.clone())),
            SessionState::Exhausted | SessionState::Ended => return Ok(TickOutcome::Inactive),
        }

        let now = self.deps.clock.now();
        if let Err(e) = self.advance(now) {
            if self.state == SessionState::Unenforced {
                error!("Failed to persist usage for {} (unenforced): {}", self.user_id, e);
            } else {
                error!("Usage store unavailable for {}; denying further time: {}", self.user_id, e);
                self.exhaust(EndReason::StoreUnavailable, false)?;
                return Ok(TickOutcome::Exhausted);
            }
        }

        let seconds_used = self.current.as_ref().map(|r| r.seconds_used).unwrap_or(0);

        if self.state == SessionState::Running && seconds_used >= self.limit {
            info!("Daily limit reached for {} ({}s)", self.user_id, seconds_used);
            self.exhaust(EndReason::LimitReached, false)?;
            return Ok(TickOutcome::Exhausted);
        }

        Ok(TickOutcome::Advanced {
            seconds_used,
            remaining_seconds: self.limit.saturating_sub(seconds_used),
        })
    }

    /// Normal end of session (logout observed, engine stopped)
    pub fn end(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Running | SessionState::Unenforced => {}
            // Exhaustion already closed the session in the log
            _ => return Ok(()),
        }

        let now = self.deps.clock.now();
        let advanced = self.advance(now);

        self.end_reason = Some(EndReason::Logout);
        self.record_event(EventKind::End, Some(EndReason::Logout));
        self.set_state(SessionState::Ended);
        info!(
            "Session ended for {} after {}s",
            self.user_id, self.session_seconds
        );

        advanced?;
        self.deps.store.flush()?;
        Ok(())
    }

    /// Credit the time since the last tick, handling rollover, and save
    fn advance(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let today = self.deps.clock.local_day(now);
        let Some(current_day) = self.current.as_ref().map(|r| r.day) else {
            return Ok(());
        };

        if today > current_day {
            self.rollover(today)?;
        } else if today < current_day {
            warn!(
                "Clock anomaly: local day moved back from {} to {}; keeping {}",
                current_day, today, current_day
            );
        }

        let last = self.last_tick.unwrap_or(now);
        let mut elapsed_ms = (now - last).num_milliseconds();
        if elapsed_ms < 0 {
            warn!("Clock anomaly: time moved back {}ms; crediting nothing", -elapsed_ms);
            elapsed_ms = 0;
        }
        if elapsed_ms > self.max_credit_ms {
            info!(
                "Gap of {}s since last tick (suspend?); crediting {}s",
                elapsed_ms / 1000,
                self.max_credit_ms / 1000
            );
            elapsed_ms = self.max_credit_ms;
        }
        self.last_tick = Some(now);

        let total_ms = self.carry_ms + elapsed_ms;
        let credit = (total_ms / 1000) as u64;
        self.carry_ms = total_ms % 1000;

        let enforced = self.state == SessionState::Running;
        let ceiling = self.limit.saturating_add(self.tick_interval);
        let Some(record) = self.current.as_mut() else {
            return Ok(());
        };

        let before = record.seconds_used;
        let mut after = before.saturating_add(credit);
        if enforced && after > ceiling {
            after = ceiling.max(before);
        }
        record.seconds_used = after;
        self.session_seconds += after - before;
        debug!(
            "Tick for {}: +{}s, {}s used on {}",
            record.user_id, after - before, after, record.day
        );

        self.deps.store.save(record)?;
        self.status.publish_usage(record);
        Ok(())
    }

    /// Close out the old day's record and switch to the new day's
    fn rollover(&mut self, today: NaiveDate) -> Result<(), StoreError> {
        if let Some(old) = &self.current {
            info!(
                "Day rollover for {}: {} closed at {}s",
                self.user_id, old.day, old.seconds_used
            );
            self.deps.store.save(old)?;
        }

        // Another session may already have started today's record
        let fresh = self.deps.store.load(&self.user_id, today)?;
        self.status.publish_usage(&fresh);
        self.current = Some(fresh);
        Ok(())
    }

    /// Enter exhaustion: log, flush, terminate. Runs at most once per session.
    fn exhaust(&mut self, reason: EndReason, at_login: bool) -> Result<SessionState, EngineError> {
        if self.termination_requested {
            return Ok(self.state);
        }
        self.termination_requested = true;
        self.end_reason = Some(reason);
        self.set_state(SessionState::Exhausted);

        self.record_event(EventKind::Exhausted, Some(reason));

        // Usage must be durable before the logout proceeds
        if let Err(e) = self.deps.store.flush() {
            error!("Failed to flush usage for {} before logout: {}", self.user_id, e);
        }

        let request = Termination {
            user_id: &self.user_id,
            reason,
            at_login,
        };
        if let Err(e) = self.deps.terminator.terminate_session(&request) {
            error!("Enforcement action failed for {}: {}", self.user_id, e);
            return Err(e.into());
        }

        self.set_state(SessionState::Ended);
        Ok(self.state)
    }

    fn record_event(&self, kind: EventKind, reason: Option<EndReason>) {
        let event = SessionEvent {
            user_id: self.user_id.clone(),
            session_id: self.session_id,
            timestamp: self.deps.clock.now(),
            kind,
            seconds_used_today: self.current.as_ref().map(|r| r.seconds_used).unwrap_or(0),
            goal: match kind {
                EventKind::Start => self.goal.clone(),
                _ => None,
            },
            session_seconds: match kind {
                EventKind::Start => None,
                _ => Some(self.session_seconds),
            },
            reason,
        };

        if let Err(e) = self.deps.events.append(&event) {
            warn!("Failed to write {:?} event for {}: {}", kind, self.user_id, e);
        }
    }
}
