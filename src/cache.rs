//! Per-camera memo of fusion output for perceptually identical frames.
//!
//! The key is the frame downsampled to 4x4 pixel blocks: the summed integer
//! luma of every block at full precision, plus the frame dimensions. Repeated
//! frames collide. A change anywhere in the frame moves at least one block sum,
//! so even a small local change (a mask coming off) gets a fresh key.
//!
//! Recency is tracked with a lazy-deletion queue: every touch pushes a fresh
//! stamp and stale stamps are skipped on eviction, which keeps insert and
//! lookup O(1) amortised.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;

use crate::frame::Frame;
use crate::fusion::UnifiedResult;

pub const DEFAULT_CACHE_CAPACITY: usize = 64;

const BLOCK: usize = 4;

pub fn perceptual_key(frame: &Frame) -> u64 {
    let width = frame.width as usize;
    let blocks_x = width.div_ceil(BLOCK);
    let mut hasher = DefaultHasher::new();
    hasher.write_u32(frame.width);
    hasher.write_u32(frame.height);
    let mut sums = vec![0u32; blocks_x];
    for (y, row) in frame.pixels().chunks_exact(width * 3).enumerate() {
        for (x, px) in row.chunks_exact(3).enumerate() {
            sums[x / BLOCK] += luma(px[0], px[1], px[2]);
        }
        if (y + 1) % BLOCK == 0 || y + 1 == frame.height as usize {
            for sum in sums.iter_mut() {
                hasher.write_u32(*sum);
                *sum = 0;
            }
        }
    }
    hasher.finish()
}

/// Same weights as `Frame::luma_at`.
fn luma(r: u8, g: u8, b: u8) -> u32 {
    (77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8
}

struct Entry {
    result: UnifiedResult,
    stamp: u64,
}

pub struct FrameResultCache {
    capacity: usize,
    entries: HashMap<u64, Entry>,
    recency: VecDeque<(u64, u64)>,
    next_stamp: u64,
    hits: u64,
    misses: u64,
}

impl FrameResultCache {
    /// A capacity of zero disables the cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
            next_stamp: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// The memoized result, stamped with this frame's sequence and capture time.
    pub fn lookup(&mut self, frame: &Frame) -> Option<UnifiedResult> {
        if self.capacity == 0 {
            self.misses += 1;
            return None;
        }
        let key = perceptual_key(frame);
        let stamp = self.bump();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.stamp = stamp;
                let result = entry.result.rebind(frame);
                self.recency.push_back((key, stamp));
                self.compact_if_needed();
                self.hits += 1;
                Some(result)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn store(&mut self, frame: &Frame, result: &UnifiedResult) {
        if self.capacity == 0 {
            return;
        }
        let key = perceptual_key(frame);
        let stamp = self.bump();
        self.entries.insert(
            key,
            Entry {
                result: result.clone(),
                stamp,
            },
        );
        self.recency.push_back((key, stamp));
        self.evict_to(self.capacity);
        self.compact_if_needed();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict_to(capacity);
        self.compact_if_needed();
    }

    fn bump(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((key, stamp)) = self.recency.pop_front() else {
                break;
            };
            if self.entries.get(&key).map(|e| e.stamp) == Some(stamp) {
                self.entries.remove(&key);
            }
        }
    }

    /// Drop stale stamps once they outnumber live entries.
    fn compact_if_needed(&mut self) {
        if self.recency.len() <= 2 * self.entries.len() + 16 {
            return;
        }
        let entries = &self.entries;
        self.recency
            .retain(|(key, stamp)| entries.get(key).map(|e| e.stamp) == Some(*stamp));
    }
}
