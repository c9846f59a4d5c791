//! Append-only audit trail of session start, end and exhaustion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::EventLogError;
use crate::fs_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    End,
    Exhausted,
}

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// User logged out or the engine was stopped
    Logout,
    /// Daily quota used up
    LimitReached,
    /// Usage could not be persisted; time denied
    StoreUnavailable,
}

/// What the user said they would do with the session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionGoal {
    pub category: String,
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionEvent {
    pub user_id: String,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub seconds_used_today: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<SessionGoal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
}

/// Write-only sink for session events
pub trait EventLog: Send + Sync {
    fn append(&self, event: &SessionEvent) -> Result<(), EventLogError>;
}

/// One JSON object per line in `<dir>/<user>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", user_id))
    }

    /// Last `limit` events for a user, oldest first
    pub fn recent(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<SessionEvent>> {
        read_events(&self.path_for(user_id), limit)
    }
}

fn read_events(path: &Path, limit: usize) -> anyhow::Result<Vec<SessionEvent>> {
    use anyhow::Context;

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event log: {}", path.display()))?;

    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        // A crash mid-append can leave a torn last line
        match serde_json::from_str::<SessionEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("Skipping line {} of {}: {}", n + 1, path.display(), e),
        }
    }

    let skip = events.len().saturating_sub(limit);
    Ok(events.split_off(skip))
}

impl EventLog for JsonlEventLog {
    fn append(&self, event: &SessionEvent) -> Result<(), EventLogError> {
        let line = serde_json::to_string(event)?;
        let path = self.path_for(&event.user_id);
        fs_util::append_line(&path, &line)
            .map_err(|source| EventLogError::LogWriteFailed { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(kind: EventKind, secs: u64) -> SessionEvent {
        SessionEvent {
            user_id: "alice".to_string(),
            session_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            seconds_used_today: secs,
            goal: None,
            session_seconds: None,
            reason: None,
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());

        log.append(&event(EventKind::Start, 0)).unwrap();
        log.append(&event(EventKind::Exhausted, 1800)).unwrap();

        let events = log.recent("alice", 10).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Start, EventKind::Exhausted]);
    }

    #[test]
    fn test_line_format() {
        let dir = tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());

        let mut end = event(EventKind::End, 600);
        end.reason = Some(EndReason::LimitReached);
        end.session_seconds = Some(300);
        log.append(&end).unwrap();

        let raw = std::fs::read_to_string(log.path_for("alice")).unwrap();
        assert!(raw.ends_with('\n'));
        assert!(raw.contains(r#""event":"end""#));
        assert!(raw.contains(r#""reason":"limit_reached""#));
        assert!(!raw.contains("goal"));
    }

    #[test]
    fn test_recent_skips_torn_line() {
        let dir = tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        log.append(&event(EventKind::Start, 0)).unwrap();
        fs_util::append_line(&log.path_for("alice"), r#"{"user_id":"ali"#).unwrap();

        assert_eq!(log.recent("alice", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_recent_limits_to_latest() {
        let dir = tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        for secs in 0..5 {
            log.append(&event(EventKind::Start, secs)).unwrap();
        }

        let events = log.recent("alice", 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seconds_used_today, 4);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "not a directory").unwrap();

        let log = JsonlEventLog::new(&blocker);
        let err = log.append(&event(EventKind::Start, 0)).unwrap_err();
        assert!(matches!(err, EventLogError::LogWriteFailed { .. }));
    }
}
