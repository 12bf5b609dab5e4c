//! Bounded Frame Buffer
//!
//! Holds the most recent processed frames plus a single "latest frame"
//! slot used by live view.
//!
//! # Eviction
//!
//! The buffer never grows past `capacity`. When a push overflows it, the
//! oldest `drop_ratio` fraction of the capacity is evicted in one step
//! (not one frame at a time) and the evicted count is added to the drop
//! counter:
//!
//! ```text
//! capacity 100, drop_ratio 0.1
//!
//!   push #101 ──> [f1 .. f101]  (101 > 100)
//!                  └─ evict f1..f10 ──> [f11 .. f101]  (91 frames, dropped += 10)
//! ```
//!
//! # Locking
//!
//! All mutation happens under one mutex scoped to the buffer. The latest
//! slot is an [`ArcSwapOption`], so [`FrameBuffer::latest`] never waits on a
//! push in progress.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::frame::Frame;

/// Frame buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBufferConfig {
    /// Maximum number of frames held
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Fraction of capacity evicted when the buffer overflows (0.0, 1.0]
    #[serde(default = "default_drop_ratio")]
    pub drop_ratio: f64,
}

fn default_capacity() -> usize {
    150
}
fn default_drop_ratio() -> f64 {
    0.1
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            drop_ratio: default_drop_ratio(),
        }
    }
}

impl FrameBufferConfig {
    /// Number of frames evicted per overflow, at least one
    pub fn eviction_batch(&self) -> usize {
        let batch = (self.capacity as f64 * self.drop_ratio).round() as usize;
        batch.clamp(1, self.capacity.max(1))
    }
}

/// Buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferStats {
    /// Frames currently held
    pub len: usize,
    /// Configured capacity
    pub capacity: usize,
    /// Frames ever pushed
    pub pushed: u64,
    /// Frames evicted on overflow
    pub dropped: u64,
}

impl BufferStats {
    /// Evicted share of everything pushed
    pub fn drop_rate(&self) -> f64 {
        if self.pushed == 0 {
            0.0
        } else {
            self.dropped as f64 / self.pushed as f64
        }
    }

    /// Fill level in 0.0..=1.0
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }
}

/// Capacity-bounded ring of recent frames
pub struct FrameBuffer {
    config: FrameBufferConfig,
    frames: Mutex<VecDeque<Arc<Frame>>>,
    latest: ArcSwapOption<Frame>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new(config: FrameBufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            config: FrameBufferConfig { capacity, ..config },
            latest: ArcSwapOption::const_empty(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame, returning how many old frames were evicted
    pub fn push(&self, frame: Arc<Frame>) -> usize {
        let evicted = {
            let mut frames = self.frames.lock();
            frames.push_back(Arc::clone(&frame));

            let mut evicted = 0;
            while frames.len() > self.config.capacity {
                let batch = self.config.eviction_batch().min(frames.len());
                frames.drain(..batch);
                evicted += batch;
            }

            // Swap under the lock so the slot never goes backwards across
            // two concurrent pushes.
            self.latest.store(Some(frame));
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.dropped.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(
                "Frame buffer overflow: evicted {} oldest frames (capacity {})",
                evicted, self.config.capacity
            );
        }
        evicted
    }

    /// Most recent frame, without taking the buffer lock
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    /// Up to `n` most recent frames, oldest first
    pub fn snapshot(&self, n: usize) -> Vec<Arc<Frame>> {
        let frames = self.frames.lock();
        let skip = frames.len().saturating_sub(n);
        frames.iter().skip(skip).cloned().collect()
    }

    /// Maintenance reset: drop all held frames and the latest slot
    pub fn clear(&self) {
        let cleared = {
            let mut frames = self.frames.lock();
            let n = frames.len();
            frames.clear();
            self.latest.store(None);
            n
        };
        trace!("Frame buffer cleared ({} frames)", cleared);
    }

    /// Frames currently held
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when no frames are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Fill level in 0.0..=1.0
    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.config.capacity as f64
    }

    /// Frames evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Counter snapshot
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.len(),
            capacity: self.config.capacity,
            pushed: self.pushed.load(Ordering::Relaxed),
            dropped: self.dropped(),
        }
    }
}
