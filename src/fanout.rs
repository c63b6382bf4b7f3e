//! One-to-many distribution of stream frames.
//!
//! Every viewer owns a bounded queue. Publishing never blocks: when a viewer's
//! queue is full its oldest frame is discarded to make room. A new viewer
//! starts from the latest frame, never from a backlog.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

pub const DEFAULT_VIEWER_QUEUE: usize = 8;

const CLOSED_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame {
    pub camera_id: String,
    pub sequence: u64,
    pub payload: Arc<[u8]>,
    pub has_overlay: bool,
}

impl StreamFrame {
    pub fn new(camera_id: &str, sequence: u64, payload: Vec<u8>, has_overlay: bool) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            sequence,
            payload: payload.into(),
            has_overlay,
        }
    }
}

/// Where a camera loop sends its frames.
pub trait StreamPublisher: Send + Sync {
    /// Hand over a frame without blocking. Returns false if it was not accepted.
    fn publish(&self, frame: StreamFrame) -> bool;
}

struct ViewerQueue {
    tx: Sender<StreamFrame>,
    rx: Receiver<StreamFrame>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ViewerQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue, evicting the oldest entries while the queue is full.
    fn push_drop_oldest(&self, mut frame: StreamFrame) -> u64 {
        let mut evicted = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }
}

#[derive(Default)]
struct CameraChannel {
    latest: Option<StreamFrame>,
    viewers: Vec<Arc<ViewerQueue>>,
    published: u64,
    evicted: u64,
}

/// Counts from one `publish` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub accepted: bool,
    pub viewers: usize,
    /// Older frames evicted from slow viewers to admit this one.
    pub evicted: u64,
}

pub struct FanOut {
    cameras: RwLock<HashMap<String, Arc<Mutex<CameraChannel>>>>,
    viewer_capacity: usize,
}

fn lock(channel: &Mutex<CameraChannel>) -> MutexGuard<'_, CameraChannel> {
    channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FanOut {
    pub fn new(viewer_capacity: usize) -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
            viewer_capacity: viewer_capacity.max(1),
        }
    }

    pub fn viewer_capacity(&self) -> usize {
        self.viewer_capacity
    }

    fn channel(&self, camera_id: &str) -> Arc<Mutex<CameraChannel>> {
        {
            let cameras = self
                .cameras
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(channel) = cameras.get(camera_id) {
                return channel.clone();
            }
        }
        let mut cameras = self
            .cameras
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cameras
            .entry(camera_id.to_string())
            .or_default()
            .clone()
    }

    /// Deliver `frame` to every viewer of its camera. Frames whose sequence does
    /// not advance past the last published one are rejected.
    pub fn publish_frame(&self, frame: StreamFrame) -> PublishReport {
        let channel = self.channel(&frame.camera_id);
        let mut channel = lock(&channel);
        if let Some(latest) = &channel.latest {
            if frame.sequence <= latest.sequence {
                log::debug!(
                    "camera {}: rejecting stream frame {} (latest {})",
                    frame.camera_id,
                    frame.sequence,
                    latest.sequence
                );
                return PublishReport::default();
            }
        }

        // A subscription holds the only other reference; once it is gone the
        // viewer is pruned.
        channel
            .viewers
            .retain(|v| !v.closed.load(Ordering::Relaxed) && Arc::strong_count(v) > 1);

        let mut evicted = 0;
        for viewer in &channel.viewers {
            evicted += viewer.push_drop_oldest(frame.clone());
        }
        let viewers = channel.viewers.len();
        channel.published += 1;
        channel.evicted += evicted;
        channel.latest = Some(frame);
        PublishReport {
            accepted: true,
            viewers,
            evicted,
        }
    }

    pub fn subscribe(&self, camera_id: &str) -> Subscription {
        let channel = self.channel(camera_id);
        let mut channel = lock(&channel);
        let queue = Arc::new(ViewerQueue::new(self.viewer_capacity));
        if let Some(latest) = &channel.latest {
            queue.push_drop_oldest(latest.clone());
        }
        channel.viewers.push(queue.clone());
        log::debug!(
            "camera {}: viewer subscribed ({} total)",
            camera_id,
            channel.viewers.len()
        );
        Subscription {
            camera_id: camera_id.to_string(),
            queue,
            last_sequence: None,
        }
    }

    /// Cameras that have published at least one frame, sorted.
    pub fn cameras(&self) -> Vec<String> {
        let cameras = self
            .cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<String> = cameras
            .iter()
            .filter(|(_, channel)| lock(channel).latest.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn latest(&self, camera_id: &str) -> Option<StreamFrame> {
        let cameras = self
            .cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cameras
            .get(camera_id)
            .and_then(|channel| lock(channel).latest.clone())
    }

    pub fn viewer_count(&self, camera_id: &str) -> usize {
        let cameras = self
            .cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cameras
            .get(camera_id)
            .map(|channel| {
                lock(channel)
                    .viewers
                    .iter()
                    .filter(|v| !v.closed.load(Ordering::Relaxed) && Arc::strong_count(v) > 1)
                    .count()
            })
            .unwrap_or(0)
    }

    /// End every subscription of a camera. Viewers drain what they have queued.
    pub fn close_camera(&self, camera_id: &str) {
        let removed = self
            .cameras
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(camera_id);
        if let Some(channel) = removed {
            for viewer in lock(&channel).viewers.drain(..) {
                viewer.closed.store(true, Ordering::Relaxed);
            }
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self
            .cameras
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.close_camera(&id);
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_QUEUE)
    }
}

impl StreamPublisher for FanOut {
    fn publish(&self, frame: StreamFrame) -> bool {
        self.publish_frame(frame).accepted
    }
}

impl<T: StreamPublisher + ?Sized> StreamPublisher for Arc<T> {
    fn publish(&self, frame: StreamFrame) -> bool {
        (**self).publish(frame)
    }
}

/// One viewer's view of a camera.
pub struct Subscription {
    camera_id: String,
    queue: Arc<ViewerQueue>,
    last_sequence: Option<u64>,
}

impl Subscription {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Frames evicted from this viewer's queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Relaxed) && self.queue.rx.is_empty()
    }

    fn accept(&mut self, frame: StreamFrame) -> Option<StreamFrame> {
        if self.last_sequence.is_some_and(|last| frame.sequence <= last) {
            return None;
        }
        self.last_sequence = Some(frame.sequence);
        Some(frame)
    }

    pub fn try_recv(&mut self) -> Option<StreamFrame> {
        while let Ok(frame) = self.queue.rx.try_recv() {
            if let Some(frame) = self.accept(frame) {
                return Some(frame);
            }
        }
        None
    }

    /// Wait up to `timeout` for the next frame.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<StreamFrame> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.queue.rx.recv_deadline(deadline) {
                Ok(frame) => {
                    if let Some(frame) = self.accept(frame) {
                        return Some(frame);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }
}

impl Iterator for Subscription {
    type Item = StreamFrame;

    /// Blocks until a frame arrives; ends once the camera is closed and drained.
    fn next(&mut self) -> Option<StreamFrame> {
        loop {
            if let Some(frame) = self.recv_timeout(CLOSED_POLL) {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Relaxed);
    }
}
