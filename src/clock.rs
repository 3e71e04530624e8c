//! Millisecond clock shared by the capture worker and the render loop
//!
//! Spectrum timestamps, staleness checks and beat predictions all compare
//! values from the same clock, so the engine and its consumers must agree on
//! one. `SystemClock` measures from a process-wide epoch; `ManualClock` is
//! advanced explicitly (tests, synthetic capture).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Source of monotonic millisecond timestamps
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic clock measured from the first time any `SystemClock` is read
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::Release);
    }

    /// Advance by `ms` and return the new time
    pub fn advance(&self, ms: u64) -> u64 {
        self.now.fetch_add(ms, Ordering::AcqRel) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
