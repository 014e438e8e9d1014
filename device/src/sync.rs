//! Timeline synchronization primitives.
//!
//! Every stream owns a monotonic timeline. Recording an event on a stream
//! enqueues "advance the timeline to `n`"; waiting on that event from another
//! stream enqueues "do not proceed until the timeline reaches `n`". This maps to
//! CUDA/HIP events on real hardware and to plain counters on the host device.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter marking how far a stream has progressed.
///
/// All implementations must be `Send + Sync` for cross-thread use.
pub trait TimelineSignal: Send + Sync + std::fmt::Debug {
    /// Current value.
    fn value(&self) -> u64;

    /// Advance to `value`. Lower values than the current one are ignored.
    fn advance(&self, value: u64);

    /// Check if the signal has reached `value` without blocking.
    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// Atomic timeline for host-side streams.
#[derive(Debug, Default)]
pub struct HostTimeline {
    value: AtomicU64,
}

impl HostTimeline {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimelineSignal for HostTimeline {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn advance(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }
}
