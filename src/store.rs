//! Durable per-user, per-day usage records.
//!
//! Layout: `<root>/<user>/<YYYY-MM-DD>.json`, one file per `(user, day)`.
//! Records from past days are never rewritten once their day is over; they stay
//! on disk as history.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};
use crate::fs_util;

/// Current record file version
const RECORD_VERSION: &str = "1.0";

/// Accounted usage for one user on one local calendar day
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub day: NaiveDate,
    pub seconds_used: u64,
}

impl UsageRecord {
    /// Fresh zero record
    pub fn new(user_id: &str, day: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            day,
            seconds_used: 0,
        }
    }
}

/// On-disk shape of a usage record
#[derive(Debug, Deserialize, Serialize)]
struct RecordFile {
    version: String,
    #[serde(flatten)]
    record: UsageRecord,
    updated_at: DateTime<Utc>,
}

/// Durable get/set of usage records keyed by `(user_id, day)`
pub trait UsageStore: Send + Sync {
    /// Existing record, or a zero record if none was ever saved
    fn load(&self, user_id: &str, day: NaiveDate) -> StoreResult<UsageRecord>;

    /// Persist the full record atomically
    fn save(&self, record: &UsageRecord) -> StoreResult<()>;

    /// Block until everything handed to `save` is durable
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Reject user ids that would escape the store directory
pub fn validate_user_id(user_id: &str) -> StoreResult<()> {
    let bad = user_id.is_empty()
        || user_id.starts_with('.')
        || user_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidUser(user_id.to_string()));
    }
    Ok(())
}

/// JSON-file usage store
#[derive(Debug, Clone)]
pub struct FileUsageStore {
    root: PathBuf,
}

impl FileUsageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the record file for `(user_id, day)`
    pub fn record_path(&self, user_id: &str, day: NaiveDate) -> PathBuf {
        self.root
            .join(user_id)
            .join(format!("{}.json", day.format("%Y-%m-%d")))
    }

    fn read_record(path: &Path) -> StoreResult<UsageRecord> {
        let content = std::fs::read_to_string(path).map_err(|source| StoreError::Unavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let file: RecordFile =
            serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;

        if file.version != RECORD_VERSION {
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                source: serde::de::Error::custom(format!(
                    "unsupported record version {}",
                    file.version
                )),
            });
        }

        Ok(file.record)
    }

    /// Stored records for a user, most recent day first
    pub fn history(&self, user_id: &str, limit: usize) -> StoreResult<Vec<UsageRecord>> {
        validate_user_id(user_id)?;
        let dir = self.root.join(user_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Unavailable {
            path: dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Unavailable {
                    path: dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable usage record: {}", e),
            }
        }

        records.sort_by(|a, b| b.day.cmp(&a.day));
        records.truncate(limit);
        Ok(records)
    }
}

impl UsageStore for FileUsageStore {
    fn load(&self, user_id: &str, day: NaiveDate) -> StoreResult<UsageRecord> {
        validate_user_id(user_id)?;
        let path = self.record_path(user_id, day);

        if !path.exists() {
            debug!("No usage record at {}, starting from zero", path.display());
            return Ok(UsageRecord::new(user_id, day));
        }

        let record = Self::read_record(&path)?;
        if record.user_id != user_id || record.day != day {
            return Err(StoreError::Corrupt {
                path,
                source: serde::de::Error::custom(format!(
                    "record is for {} on {}",
                    record.user_id, record.day
                )),
            });
        }

        Ok(record)
    }

    fn save(&self, record: &UsageRecord) -> StoreResult<()> {
        validate_user_id(&record.user_id)?;
        let path = self.record_path(&record.user_id, record.day);

        let file = RecordFile {
            version: RECORD_VERSION.to_string(),
            record: record.clone(),
            updated_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        fs_util::atomic_write(&path, content.as_bytes())
            .map_err(|source| StoreError::Unavailable { path, source })
    }
}

enum WriteCommand {
    Save(UsageRecord),
    Flush(mpsc::Sender<StoreResult<()>>),
}

/// Write-behind adapter: `save` only queues the record for a dedicated writer
/// thread, so a stuck disk never stalls the tick loop. Writer failures are
/// reported by the next `save` or `flush` call.
pub struct WriteBehindStore {
    inner: Arc<dyn UsageStore>,
    tx: mpsc::Sender<WriteCommand>,
    failure: Arc<Mutex<Option<StoreError>>>,
    flush_timeout: Duration,
}

impl WriteBehindStore {
    pub fn new(inner: Arc<dyn UsageStore>, flush_timeout: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteCommand>();
        let failure = Arc::new(Mutex::new(None));

        let writer_inner = inner.clone();
        let writer_failure = failure.clone();
        std::thread::Builder::new()
            .name("usage-writer".to_string())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        WriteCommand::Save(record) => {
                            if let Err(e) = writer_inner.save(&record) {
                                error!("Failed to persist usage for {}: {}", record.user_id, e);
                                *lock(&writer_failure) = Some(e);
                            }
                        }
                        WriteCommand::Flush(ack) => {
                            let result = match lock(&writer_failure).take() {
                                Some(e) => Err(e),
                                None => writer_inner.flush(),
                            };
                            let _ = ack.send(result);
                        }
                    }
                }
                debug!("Usage writer stopped");
            })?;

        Ok(Self {
            inner,
            tx,
            failure,
            flush_timeout,
        })
    }

    fn take_failure(&self) -> Option<StoreError> {
        lock(&self.failure).take()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UsageStore for WriteBehindStore {
    fn load(&self, user_id: &str, day: NaiveDate) -> StoreResult<UsageRecord> {
        self.flush()?;
        self.inner.load(user_id, day)
    }

    fn save(&self, record: &UsageRecord) -> StoreResult<()> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.tx
            .send(WriteCommand::Save(record.clone()))
            .map_err(|_| StoreError::WriterStopped)
    }

    fn flush(&self) -> StoreResult<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(WriteCommand::Flush(ack_tx))
            .map_err(|_| StoreError::WriterStopped)?;

        match ack_rx.recv_timeout(self.flush_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(self.flush_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::WriterStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_missing_record_loads_as_zero() {
        let dir = tempdir().unwrap();
        let store = FileUsageStore::new(dir.path());

        let record = store.load("alice", day("2025-11-16")).unwrap();
        assert_eq!(record, UsageRecord::new("alice", day("2025-11-16")));
    }

    #[test]
    fn test_save_then_reload_survives_restart() {
        let dir = tempdir().unwrap();
        let mut record = UsageRecord::new("alice", day("2025-11-16"));
        record.seconds_used = 1234;

        FileUsageStore::new(dir.path()).save(&record).unwrap();

        // A fresh store instance stands in for a restarted process
        let reloaded = FileUsageStore::new(dir.path())
            .load("alice", day("2025-11-16"))
            .unwrap();
        assert_eq!(reloaded.seconds_used, 1234);
    }

    #[test]
    fn test_records_are_keyed_by_user_and_day() {
        let dir = tempdir().unwrap();
        let store = FileUsageStore::new(dir.path());

        let mut alice = UsageRecord::new("alice", day("2025-11-16"));
        alice.seconds_used = 60;
        store.save(&alice).unwrap();

        assert_eq!(store.load("bob", day("2025-11-16")).unwrap().seconds_used, 0);
        assert_eq!(store.load("alice", day("2025-11-17")).unwrap().seconds_used, 0);
        assert!(store.record_path("alice", day("2025-11-16")).ends_with("alice/2025-11-16.json"));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileUsageStore::new(dir.path());
        let path = store.record_path("alice", day("2025-11-16"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = store.load("alice", day("2025-11-16")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_unwritable_root_is_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("state");
        std::fs::write(&blocker, "a file where a directory should be").unwrap();

        let store = FileUsageStore::new(&blocker);
        let err = store.save(&UsageRecord::new("alice", day("2025-11-16"))).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[test]
    fn test_rejects_path_like_user_ids() {
        let dir = tempdir().unwrap();
        let store = FileUsageStore::new(dir.path());

        for user in ["", "../root", "a/b", ".hidden"] {
            assert!(matches!(
                store.load(user, day("2025-11-16")),
                Err(StoreError::InvalidUser(_))
            ));
        }
    }

    #[test]
    fn test_history_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = FileUsageStore::new(dir.path());

        for (d, secs) in [("2025-11-14", 100), ("2025-11-16", 300), ("2025-11-15", 200)] {
            let mut record = UsageRecord::new("alice", day(d));
            record.seconds_used = secs;
            store.save(&record).unwrap();
        }

        let history = store.history("alice", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].day, day("2025-11-16"));
        assert_eq!(history[1].seconds_used, 200);

        assert!(store.history("nobody", 10).unwrap().is_empty());
    }

    struct SlowStore {
        inner: FileUsageStore,
        delay: Duration,
    }

    impl UsageStore for SlowStore {
        fn load(&self, user_id: &str, day: NaiveDate) -> StoreResult<UsageRecord> {
            self.inner.load(user_id, day)
        }

        fn save(&self, record: &UsageRecord) -> StoreResult<()> {
            std::thread::sleep(self.delay);
            self.inner.save(record)
        }
    }

    #[test]
    fn test_write_behind_save_does_not_block() {
        let dir = tempdir().unwrap();
        let slow = Arc::new(SlowStore {
            inner: FileUsageStore::new(dir.path()),
            delay: Duration::from_millis(300),
        });
        let store = WriteBehindStore::new(slow, Duration::from_secs(5)).unwrap();

        let mut record = UsageRecord::new("alice", day("2025-11-16"));
        record.seconds_used = 42;

        let started = Instant::now();
        store.save(&record).unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        store.flush().unwrap();
        let on_disk = FileUsageStore::new(dir.path())
            .load("alice", day("2025-11-16"))
            .unwrap();
        assert_eq!(on_disk.seconds_used, 42);
    }

    #[test]
    fn test_write_behind_flush_times_out() {
        let dir = tempdir().unwrap();
        let slow = Arc::new(SlowStore {
            inner: FileUsageStore::new(dir.path()),
            delay: Duration::from_millis(500),
        });
        let store = WriteBehindStore::new(slow, Duration::from_millis(20)).unwrap();

        store.save(&UsageRecord::new("alice", day("2025-11-16"))).unwrap();
        assert!(matches!(store.flush(), Err(StoreError::Timeout(_))));
    }

    #[test]
    fn test_write_behind_surfaces_writer_failure() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("state");
        std::fs::write(&blocker, "not a directory").unwrap();

        let store =
            WriteBehindStore::new(Arc::new(FileUsageStore::new(&blocker)), Duration::from_secs(5))
                .unwrap();

        // Queuing succeeds; the failure shows up once the writer has run
        store.save(&UsageRecord::new("alice", day("2025-11-16"))).unwrap();
        assert!(matches!(store.flush(), Err(StoreError::Unavailable { .. })));
    }
}
