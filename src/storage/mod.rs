//! Persistence boundary.
//!
//! The camera loop never writes records itself. It hands a `PersistJob` to a
//! `PersistenceWorker`, which owns a `RecordSink` on its own thread and retries
//! transient failures there.

mod memory;
mod sqlite;
mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::frame::Frame;
use crate::fusion::UnifiedResult;
use crate::policy::PersistenceDecision;
use crate::rules::Violation;

pub use memory::{InMemoryRecordStore, StoredRecord};
pub use sqlite::{SqliteRecordStore, StoredSnapshot};
pub use worker::{
    PersistJob, PersistenceCounters, PersistenceTotals, PersistenceWorker, RetentionSchedule,
    RetryPolicy, WorkerConfig, DEFAULT_QUEUE_CAPACITY,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// The write was rejected. Retrying the same record will not help.
    #[error("persistence failed: {0}")]
    Failure(String),

    /// The store could not take the write right now (busy, locked, offline).
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl PersistError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for PersistError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Failure(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failure(format!("record encoding: {}", err))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record#{}", self.0)
    }
}

/// Where persisted frame records go. One sink per camera.
pub trait RecordSink: Send {
    fn persist(
        &mut self,
        result: &UnifiedResult,
        violations: &[Violation],
        decision: &PersistenceDecision,
        frame: Option<&Frame>,
    ) -> Result<RecordId, PersistError>;

    /// Delete records captured more than `max_age` ago. Returns how many went.
    fn enforce_retention(&mut self, _max_age: Duration) -> Result<usize, PersistError> {
        Ok(0)
    }
}

pub(crate) fn max_severity(violations: &[Violation]) -> f32 {
    violations.iter().map(|v| v.severity).fold(0.0, f32::max)
}
