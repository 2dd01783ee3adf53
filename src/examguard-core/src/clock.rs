//! Time sources for the engine.
//!
//! Two readings are needed: the local wall clock, which the user controls and
//! which is therefore untrusted, and a monotonic counter used to measure
//! elapsed time between checks within one session.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Clock abstraction injected into every component.
pub trait Clock: Send + Sync {
    /// Local wall-clock time (Unix milliseconds). Untrusted.
    fn now_ms(&self) -> i64;

    /// Monotonic milliseconds since an arbitrary per-process origin.
    fn monotonic_ms(&self) -> u64;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a system clock whose monotonic origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Deterministic clock for tests and simulations.
///
/// Tracks a "true" time that only moves forward through [`advance`], plus a
/// skew that models the user changing the device clock.
///
/// [`advance`]: ManualClock::advance
#[derive(Debug)]
pub struct ManualClock {
    true_ms: AtomicI64,
    skew_ms: AtomicI64,
    monotonic_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock at `start_ms` with no skew.
    pub fn new(start_ms: i64) -> Self {
        Self {
            true_ms: AtomicI64::new(start_ms),
            skew_ms: AtomicI64::new(0),
            monotonic_ms: AtomicU64::new(0),
        }
    }

    /// Move true time, the wall clock and the monotonic counter forward.
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.true_ms
            .fetch_add(i64::try_from(ms).unwrap_or(i64::MAX), Ordering::SeqCst);
        self.monotonic_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set the wall clock's offset from true time (positive = ahead).
    pub fn set_skew_ms(&self, skew_ms: i64) {
        self.skew_ms.store(skew_ms, Ordering::SeqCst);
    }

    /// Current wall-clock skew.
    pub fn skew_ms(&self) -> i64 {
        self.skew_ms.load(Ordering::SeqCst)
    }

    /// True time, as a trusted oracle would report it.
    pub fn true_now_ms(&self) -> i64 {
        self.true_ms.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.true_now_ms() + self.skew_ms()
    }

    fn monotonic_ms(&self) -> u64 {
        self.monotonic_ms.load(Ordering::SeqCst)
    }
}

/// Convert a duration to signed milliseconds, saturating.
pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
