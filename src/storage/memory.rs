use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{PersistError, RecordId, RecordSink};
use crate::frame::Frame;
use crate::fusion::UnifiedResult;
use crate::policy::{PersistenceDecision, ReasonCode};
use crate::rules::Violation;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub result: UnifiedResult,
    pub violations: Vec<Violation>,
    pub reason: Option<ReasonCode>,
    pub has_snapshot: bool,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<StoredRecord>,
    next_id: i64,
    /// Upcoming `persist` calls that fail with `Unavailable`.
    fail_next: usize,
}

/// Record sink kept in memory. Clones share the same records, so a test can
/// hand one clone to a worker and inspect through another.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.lock().records.clone()
    }

    pub fn persisted_sequences(&self) -> Vec<u64> {
        self.lock()
            .records
            .iter()
            .map(|r| r.result.sequence)
            .collect()
    }

    /// Make the next `n` writes fail as if the store were offline.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }
}

impl RecordSink for InMemoryRecordStore {
    fn persist(
        &mut self,
        result: &UnifiedResult,
        violations: &[Violation],
        decision: &PersistenceDecision,
        frame: Option<&Frame>,
    ) -> Result<RecordId, PersistError> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(PersistError::Unavailable("store offline".into()));
        }
        inner.next_id += 1;
        let id = RecordId(inner.next_id);
        inner.records.push(StoredRecord {
            id,
            result: result.clone(),
            violations: violations.to_vec(),
            reason: decision.reason,
            has_snapshot: decision.snapshot_requested && frame.is_some(),
        });
        Ok(id)
    }

    fn enforce_retention(&mut self, max_age: Duration) -> Result<usize, PersistError> {
        let cutoff = crate::now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut inner = self.lock();
        let before = inner.records.len();
        inner.records.retain(|r| r.result.captured_at_ms >= cutoff);
        Ok(before - inner.records.len())
    }
}
