use std::path::PathBuf;
use std::time::Duration;

/// Failures of the usage store. Every variant is treated as "store
/// unavailable" by the accountant, which fails closed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("usage store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("usage record at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("usage store did not persist within {0:?}")]
    Timeout(Duration),

    #[error("usage store writer has stopped")]
    WriterStopped,

    #[error("invalid user id {0:?}")]
    InvalidUser(String),
}

/// Audit log failures. Best-effort only: never propagated into enforcement.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to write event log {path}: {source}")]
    LogWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode session event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    #[error("failed to terminate session for {user} after {attempts} attempt(s): {reason}")]
    ActionFailed {
        user: String,
        attempts: u32,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{name} is {value}, at most {max} is allowed")]
    TooLarge {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("max_tick_credit_seconds ({credit}) must be at least tick_interval_seconds ({tick})")]
    CreditBelowTick { credit: u64, tick: u64 },

    #[error("warning thresholds must be in descending order, got: {0:?}")]
    WarningsOrder(Vec<u32>),

    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Errors that escape the session accountant.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enforcement(#[from] EnforcementError),

    #[error("session for {0} has not been started")]
    NotStarted(String),

    #[error("session for {0} was already started")]
    AlreadyStarted(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
