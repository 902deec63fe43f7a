//! Monotonic-seconds clock abstraction.
//!
//! The registries only ever need "seconds since an arbitrary epoch" to
//! compute elapsed times and expiries; routing it through a trait
//! keeps DAD/eviction timing deterministic in tests instead of reaching
//! for `std::time::Instant::now()` directly from registry code.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall-clock seconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_secs() as i64
    }
}

/// A clock a test can advance explicitly.
#[derive(Debug)]
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(10);
        assert_eq!(clock.now(), 110);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }
}
