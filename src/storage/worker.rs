use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{PersistError, RecordSink};
use crate::frame::Frame;
use crate::fusion::UnifiedResult;
use crate::policy::PersistenceDecision;
use crate::rules::Violation;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// One record waiting to be written.
#[derive(Clone, Debug)]
pub struct PersistJob {
    pub result: UnifiedResult,
    pub violations: Vec<Violation>,
    pub decision: PersistenceDecision,
    /// Present only when the decision asks for a snapshot.
    pub frame: Option<Frame>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per record, first try included.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Each delay is scaled by a random factor in `1 ± jitter`.
    pub jitter: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(anyhow!("retry jitter must be within [0, 1]"));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based): exponential, capped, jittered.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = 1u32 << retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f32(factor.max(0.0))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionSchedule {
    pub max_age: Duration,
    pub every: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub retention: Option<RetentionSchedule>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            retention: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PersistenceCounters {
    persisted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
}

impl PersistenceCounters {
    pub fn totals(&self) -> PersistenceTotals {
        PersistenceTotals {
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceTotals {
    pub persisted: u64,
    /// Records given up on after the last attempt.
    pub failed: u64,
    /// Records refused because the queue was full.
    pub dropped: u64,
    pub retried: u64,
}

/// Owns a camera's `RecordSink` on a dedicated thread.
pub struct PersistenceWorker {
    camera_id: String,
    jobs: Option<Sender<PersistJob>>,
    counters: Arc<PersistenceCounters>,
    join: Option<JoinHandle<()>>,
}

impl PersistenceWorker {
    pub fn spawn(
        camera_id: &str,
        sink: Box<dyn RecordSink>,
        config: WorkerConfig,
    ) -> Result<Self> {
        config.retry.validate()?;
        let (jobs, rx) = bounded(config.queue_capacity.max(1));
        let counters = Arc::new(PersistenceCounters::default());
        let thread_counters = counters.clone();
        let thread_camera = camera_id.to_string();
        let join = std::thread::Builder::new()
            .name(format!("persist-{}", camera_id))
            .spawn(move || run(thread_camera, sink, rx, config, thread_counters))?;
        Ok(Self {
            camera_id: camera_id.to_string(),
            jobs: Some(jobs),
            counters,
            join: Some(join),
        })
    }

    /// Queue a record without blocking. Returns false when it was dropped.
    pub fn submit(&self, job: PersistJob) -> bool {
        let Some(jobs) = self.jobs.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "camera {}: persistence queue full, dropped record for frame {}",
                    self.camera_id,
                    job.result.sequence
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("camera {}: persistence worker is gone", self.camera_id);
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.jobs.as_ref().map(|j| j.len()).unwrap_or(0)
    }

    pub fn totals(&self) -> PersistenceTotals {
        self.counters.totals()
    }

    pub fn counters(&self) -> Arc<PersistenceCounters> {
        self.counters.clone()
    }

    /// Write everything still queued, then stop the thread.
    pub fn flush_and_stop(mut self) -> PersistenceTotals {
        self.shutdown();
        self.counters.totals()
    }

    fn shutdown(&mut self) {
        self.jobs.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("camera {}: persistence worker panicked", self.camera_id);
            }
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    camera_id: String,
    mut sink: Box<dyn RecordSink>,
    rx: Receiver<PersistJob>,
    config: WorkerConfig,
    counters: Arc<PersistenceCounters>,
) {
    let mut next_retention = config.retention.map(|r| Instant::now() + r.every);
    loop {
        let received = match next_retention {
            Some(due) => rx.recv_deadline(due),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(job) => write_with_retry(&camera_id, sink.as_mut(), job, &config.retry, &counters),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let (Some(due), Some(schedule)) = (next_retention, config.retention) {
            if Instant::now() >= due {
                match sink.enforce_retention(schedule.max_age) {
                    Ok(0) => {}
                    Ok(n) => log::info!("camera {}: retention removed {} records", camera_id, n),
                    Err(e) => log::warn!("camera {}: retention failed: {}", camera_id, e),
                }
                next_retention = Some(Instant::now() + schedule.every);
            }
        }
    }
    log::debug!("camera {}: persistence worker drained", camera_id);
}

fn write_with_retry(
    camera_id: &str,
    sink: &mut dyn RecordSink,
    job: PersistJob,
    retry: &RetryPolicy,
    counters: &PersistenceCounters,
) {
    let mut attempt = 1;
    loop {
        let outcome: Result<_, PersistError> =
            sink.persist(&job.result, &job.violations, &job.decision, job.frame.as_ref());
        match outcome {
            Ok(id) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "camera {}: frame {} persisted as {}",
                    camera_id,
                    job.result.sequence,
                    id
                );
                return;
            }
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
                let delay = retry.delay_for(attempt);
                log::debug!(
                    "camera {}: frame {} attempt {} failed ({}), retrying in {:?}",
                    camera_id,
                    job.result.sequence,
                    attempt,
                    e,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "camera {}: dropping record for frame {} after {} attempt(s): {}",
                    camera_id,
                    job.result.sequence,
                    attempt,
                    e
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRecordStore;

    fn job(sequence: u64) -> PersistJob {
        PersistJob {
            result: UnifiedResult {
                sequence,
                ..UnifiedResult::default()
            },
            violations: vec![],
            decision: PersistenceDecision::forced(),
            frame: None,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn flush_writes_everything_queued() {
        let store = InMemoryRecordStore::new();
        let worker =
            PersistenceWorker::spawn("cam", Box::new(store.clone()), WorkerConfig::default())
                .unwrap();
        for seq in 1..=10 {
            assert!(worker.submit(job(seq)));
        }
        let totals = worker.flush_and_stop();
        assert_eq!(totals.persisted, 10);
        assert_eq!(store.persisted_sequences(), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn transient_failures_are_retried() {
        let store = InMemoryRecordStore::new();
        store.fail_next(2);
        let config = WorkerConfig {
            retry: fast_retry(3),
            ..WorkerConfig::default()
        };
        let worker = PersistenceWorker::spawn("cam", Box::new(store.clone()), config).unwrap();
        worker.submit(job(1));
        let totals = worker.flush_and_stop();
        assert_eq!(totals.persisted, 1);
        assert_eq!(totals.retried, 2);
        assert_eq!(totals.failed, 0);
    }

    #[test]
    fn exhausted_retries_count_as_failed() {
        let store = InMemoryRecordStore::new();
        store.fail_next(5);
        let config = WorkerConfig {
            retry: fast_retry(2),
            ..WorkerConfig::default()
        };
        let worker = PersistenceWorker::spawn("cam", Box::new(store.clone()), config).unwrap();
        worker.submit(job(1));
        let totals = worker.flush_and_stop();
        assert_eq!(totals.failed, 1);
        assert!(store.records().is_empty());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for(2), Duration::from_millis(20));
        assert_eq!(retry.delay_for(5), Duration::from_millis(50));

        let jittered = RetryPolicy {
            jitter: 0.5,
            ..retry
        };
        for _ in 0..50 {
            let d = jittered.delay_for(1);
            assert!(d >= Duration::from_millis(4) && d <= Duration::from_millis(16));
        }
    }
}
