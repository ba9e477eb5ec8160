use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::frame::Frame;

/// Single-slot, latest-frame-wins buffer shared between one capture thread and
/// any number of readers.
///
/// There is no queue and no backpressure: a publish overwrites whatever is in the
/// slot, so a slow reader simply misses frames. Frames older than the one
/// currently held are dropped so readers only ever see non-decreasing capture
/// timestamps.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Frame>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Returns false if the frame was older than the
    /// one already held and was discarded.
    pub fn publish(&self, frame: Frame) -> bool {
        // a poisoned slot still holds a whole frame, the swap below never panics halfway
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref() {
            if frame.captured_at < current.captured_at {
                trace!(
                    sequence = frame.sequence,
                    "discard frame older than the published one"
                );
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        *slot = Some(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The most recently published frame, or `None` before the first publish.
    pub fn latest(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Enforces a maximum capture rate by sleeping until the minimum interval since
/// the last accepted capture has elapsed.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Option<Duration>,
    last: Option<Instant>,
}

impl RateLimiter {
    /// A rate of zero (or anything non-finite or negative) means unlimited.
    pub fn new(max_fps: f64) -> Self {
        let min_interval = if max_fps.is_finite() && max_fps > 0. {
            Some(Duration::from_secs_f64(1. / max_fps))
        } else {
            None
        };
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Block until the next capture is allowed.
    pub fn wait(&self) {
        if let Some(delay) = self.remaining(Instant::now()) {
            thread::sleep(delay);
        }
    }

    /// Time left before the next capture may start, if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let (interval, last) = (self.min_interval?, self.last?);
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= interval {
            None
        } else {
            Some(interval - elapsed)
        }
    }

    /// Record an accepted capture.
    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
