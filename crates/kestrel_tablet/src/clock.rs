//! Hybrid-time clock sources.
//!
//! The tablet consumes a monotonic hybrid clock; the system clock variant
//! derives the physical component from wall time and bumps the logical
//! counter when wall time stalls or regresses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kestrel_common::types::HybridTime;

/// Monotonic hybrid timestamp source.
pub trait Clock: Send + Sync {
    /// Current hybrid time. Strictly increasing across calls.
    fn now(&self) -> HybridTime;

    /// Fold an externally observed timestamp into the clock so that
    /// subsequent `now()` values sort after it. Advance-only.
    fn update(&self, observed: HybridTime);

    /// Maximum clock error bound. Safe time for externally-consistent
    /// (commit-wait) writes is backdated by this much during replay.
    fn max_error(&self) -> Duration;
}

/// System-time backed hybrid clock.
pub struct HybridClock {
    last: AtomicU64,
    max_error: Duration,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::with_max_error(Duration::from_millis(500))
    }

    pub fn with_max_error(max_error: Duration) -> Self {
        Self {
            last: AtomicU64::new(0),
            max_error,
        }
    }

    fn wall_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for HybridClock {
    fn now(&self) -> HybridTime {
        let physical = HybridTime::from_micros(Self::wall_micros());
        loop {
            let last = self.last.load(Ordering::SeqCst);
            // Wall time moved past the last issued value: take it.
            // Otherwise bump the logical counter off the last value.
            let next = if physical.0 > last {
                physical.0
            } else {
                last + 1
            };
            if self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return HybridTime(next);
            }
        }
    }

    fn update(&self, observed: HybridTime) {
        self.last.fetch_max(observed.0, Ordering::SeqCst);
    }

    fn max_error(&self) -> Duration {
        self.max_error
    }
}

/// Manually stepped clock for deterministic tests and replay scenarios.
pub struct ManualClock {
    now: AtomicU64,
    max_error: Duration,
}

impl ManualClock {
    pub fn new(start: HybridTime) -> Self {
        Self {
            now: AtomicU64::new(start.0),
            max_error: Duration::ZERO,
        }
    }

    pub fn with_max_error(start: HybridTime, max_error: Duration) -> Self {
        Self {
            now: AtomicU64::new(start.0),
            max_error,
        }
    }

    pub fn set(&self, ht: HybridTime) {
        self.now.fetch_max(ht.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HybridTime {
        // Each read is a distinct instant.
        HybridTime(self.now.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update(&self, observed: HybridTime) {
        self.now.fetch_max(observed.0, Ordering::SeqCst);
    }

    fn max_error(&self) -> Duration {
        self.max_error
    }
}

/// Shared clock handle used throughout the tablet.
pub type ClockRef = Arc<dyn Clock>;
