//! Time-boxed provider execution.
//!
//! Each provider runs on its own worker thread. Callers submit a frame and wait
//! on a deadline; a provider that hangs costs that camera one timed-out answer
//! per frame instead of stalling the loop. While a hung request is still
//! running, new submissions are rejected as `Unavailable`.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::capability::{Capability, InputMode};
use super::provider::{CapabilityProvider, ProviderError};
use super::result::{BBox, Detection};
use crate::frame::Frame;

type DetectReply = Result<Vec<Detection>, ProviderError>;

enum Job {
    Detect {
        frame: Frame,
        regions: Vec<Option<BBox>>,
        reply: Sender<DetectReply>,
    },
    WarmUp {
        reply: Sender<Result<(), ProviderError>>,
    },
}

pub struct TimeBoxedProvider {
    name: String,
    capability: Capability,
    input_mode: InputMode,
    cacheable: bool,
    jobs: Option<Sender<Job>>,
    busy: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TimeBoxedProvider {
    pub fn spawn(mut provider: Box<dyn CapabilityProvider>) -> anyhow::Result<Self> {
        let name = provider.name().to_string();
        let capability = provider.capability();
        let input_mode = provider.input_mode();
        let cacheable = provider.cacheable();
        // The busy flag keeps at most one job in flight, so the queue stays short.
        let (jobs, job_rx) = unbounded::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = busy.clone();
        let worker_name = name.clone();

        let worker = std::thread::Builder::new()
            .name(format!("provider-{}", name))
            .spawn(move || {
                for job in job_rx.iter() {
                    match job {
                        Job::Detect {
                            frame,
                            regions,
                            reply,
                        } => {
                            let result =
                                run_regions(provider.as_mut(), &worker_name, &frame, &regions);
                            worker_busy.store(false, Ordering::SeqCst);
                            let _ = reply.send(result);
                        }
                        Job::WarmUp { reply } => {
                            let result = catch_unwind(AssertUnwindSafe(|| provider.warm_up()))
                                .unwrap_or_else(|_| {
                                    Err(ProviderError::unavailable(
                                        &worker_name,
                                        "panicked during warm-up",
                                    ))
                                });
                            worker_busy.store(false, Ordering::SeqCst);
                            let _ = reply.send(result);
                        }
                    }
                }
            })?;

        Ok(Self {
            name,
            capability,
            input_mode,
            cacheable,
            jobs: Some(jobs),
            busy,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn input_mode(&self) -> InputMode {
        self.input_mode
    }

    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// Hand a frame to the worker without waiting for the answer.
    ///
    /// `regions` holds one entry per provider call: `[None]` for a full-frame
    /// call, one box per subject for region-of-interest providers.
    pub fn submit(&self, frame: &Frame, regions: Vec<Option<BBox>>) -> PendingCall {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return PendingCall::rejected(&self.name, "still busy with an earlier frame");
        }
        let (reply, reply_rx) = bounded(1);
        let job = Job::Detect {
            frame: frame.clone(),
            regions,
            reply,
        };
        match self.jobs.as_ref().map(|jobs| jobs.send(job)) {
            Some(Ok(())) => PendingCall {
                provider: self.name.clone(),
                reply: Ok(reply_rx),
            },
            _ => {
                self.busy.store(false, Ordering::SeqCst);
                PendingCall::rejected(&self.name, "worker stopped")
            }
        }
    }

    /// Submit and wait in one step.
    pub fn call(
        &self,
        frame: &Frame,
        regions: Vec<Option<BBox>>,
        timeout: Duration,
    ) -> Result<Vec<Detection>, ProviderError> {
        self.submit(frame, regions)
            .wait_until(Instant::now() + timeout, timeout)
    }

    pub fn warm_up(&self, timeout: Duration) -> Result<(), ProviderError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProviderError::unavailable(&self.name, "busy"));
        }
        let (reply, reply_rx) = bounded(1);
        let sent = self
            .jobs
            .as_ref()
            .map(|jobs| jobs.send(Job::WarmUp { reply }).is_ok())
            .unwrap_or(false);
        if !sent {
            self.busy.store(false, Ordering::SeqCst);
            return Err(ProviderError::unavailable(&self.name, "worker stopped"));
        }
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ProviderError::Timeout {
                provider: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ProviderError::unavailable(&self.name, "worker exited"))
            }
        }
    }
}

impl Drop for TimeBoxedProvider {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if self.busy.load(Ordering::SeqCst) {
                // A hung provider cannot be joined; let the thread go.
                log::warn!("provider {} still busy at shutdown, detaching", self.name);
            } else if worker.join().is_err() {
                log::warn!("provider {} worker panicked", self.name);
            }
        }
    }
}

/// An in-flight provider call.
pub struct PendingCall {
    provider: String,
    reply: Result<Receiver<DetectReply>, ProviderError>,
}

impl PendingCall {
    fn rejected(provider: &str, reason: &str) -> Self {
        Self {
            provider: provider.to_string(),
            reply: Err(ProviderError::unavailable(provider, reason)),
        }
    }

    /// Block until the answer arrives or `deadline` passes.
    ///
    /// `budget` is only used to describe the timeout in the error.
    pub fn wait_until(self, deadline: Instant, budget: Duration) -> DetectReply {
        let reply = self.reply?;
        match reply.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ProviderError::Timeout {
                provider: self.provider,
                timeout_ms: budget.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ProviderError::unavailable(&self.provider, "worker exited"))
            }
        }
    }
}

fn run_regions(
    provider: &mut dyn CapabilityProvider,
    name: &str,
    frame: &Frame,
    regions: &[Option<BBox>],
) -> DetectReply {
    let mut out = Vec::new();
    for region in regions {
        let detections = catch_unwind(AssertUnwindSafe(|| provider.detect(frame, *region)))
            .unwrap_or_else(|_| Err(ProviderError::unavailable(name, "panicked during detect")))?;
        out.extend(detections);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_byte_len;

    struct SleepyProvider {
        delay: Duration,
    }

    impl CapabilityProvider for SleepyProvider {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn capability(&self) -> Capability {
            Capability::Presence
        }

        fn detect(
            &mut self,
            _frame: &Frame,
            region_hint: Option<BBox>,
        ) -> Result<Vec<Detection>, ProviderError> {
            std::thread::sleep(self.delay);
            let bbox = region_hint.unwrap_or(BBox::new(0.0, 0.0, 2.0, 2.0));
            Ok(vec![Detection::new(Capability::Presence, bbox, 0.9)])
        }
    }

    struct PanickyProvider;

    impl CapabilityProvider for PanickyProvider {
        fn name(&self) -> &str {
            "panicky"
        }

        fn capability(&self) -> Capability {
            Capability::Presence
        }

        fn detect(
            &mut self,
            _frame: &Frame,
            _region_hint: Option<BBox>,
        ) -> Result<Vec<Detection>, ProviderError> {
            panic!("model crashed")
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; frame_byte_len(4, 4)], 4, 4, 1).unwrap()
    }

    #[test]
    fn answers_within_budget() {
        let provider = TimeBoxedProvider::spawn(Box::new(SleepyProvider {
            delay: Duration::ZERO,
        }))
        .unwrap();
        let regions = vec![
            Some(BBox::new(0.0, 0.0, 1.0, 1.0)),
            Some(BBox::new(1.0, 1.0, 3.0, 3.0)),
        ];
        let detections = provider
            .call(&frame(), regions, Duration::from_secs(2))
            .unwrap();
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn hung_provider_times_out_then_reports_busy() {
        let provider = TimeBoxedProvider::spawn(Box::new(SleepyProvider {
            delay: Duration::from_millis(400),
        }))
        .unwrap();

        let first = provider.call(&frame(), vec![None], Duration::from_millis(20));
        assert!(matches!(first, Err(ProviderError::Timeout { .. })));

        let second = provider.call(&frame(), vec![None], Duration::from_millis(20));
        assert!(matches!(second, Err(ProviderError::Unavailable { .. })));

        std::thread::sleep(Duration::from_millis(500));
        let third = provider.call(&frame(), vec![None], Duration::from_secs(2));
        assert!(third.is_ok());
    }

    #[test]
    fn panicking_provider_is_unavailable_not_fatal() {
        let provider = TimeBoxedProvider::spawn(Box::new(PanickyProvider)).unwrap();
        let result = provider.call(&frame(), vec![None], Duration::from_secs(2));
        assert!(matches!(result, Err(ProviderError::Unavailable { .. })));
        // The worker survives and keeps answering.
        let again = provider.call(&frame(), vec![None], Duration::from_secs(2));
        assert!(matches!(again, Err(ProviderError::Unavailable { .. })));
    }
}
