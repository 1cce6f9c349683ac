//! Time abstraction so every timer-driven subsystem (rotation, reassembly
//! sweep, cache sweep, privacy shaper) can be driven deterministically in
//! tests instead of sleeping on the wall clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic instants and wall-clock milliseconds.
///
/// The mesh engine never calls `Instant::now()` or `SystemTime::now()`
/// directly; every suspension point in §5 of the design (timers, sweeps,
/// handshake deadlines) is scheduled and checked through this trait.
pub trait TimeProvider: Send + Sync {
    fn now_instant(&self) -> Instant;
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually advanced clock for deterministic tests: rotation timers,
/// reassembly timeouts, and cache sweeps can all be exercised without
/// depending on real elapsed time.
pub struct ManualTimeProvider {
    base_instant: Instant,
    offset_millis: AtomicI64,
    base_millis: i64,
}

impl ManualTimeProvider {
    pub fn new(base_millis: u64) -> Self {
        Self {
            base_instant: Instant::now(),
            offset_millis: AtomicI64::new(0),
            base_millis: base_millis as i64,
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.offset_millis
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        self.base_instant + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst) as u64)
    }

    fn now_millis(&self) -> u64 {
        (self.base_millis + self.offset_millis.load(Ordering::SeqCst)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_both_axes() {
        let clock = ManualTimeProvider::new(1_000);
        let t0 = clock.now_instant();
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now_millis(), 6_000);
        assert_eq!(clock.now_instant() - t0, Duration::from_secs(5));
    }
}
