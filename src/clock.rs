//! Time sources for recording and playback.
//!
//! The recorder measures note timing against a [`Clock`] so that wall-clock
//! deltas can be replayed deterministically in tests.
//!
//! # Thread Safety
//! Clocks are read from the MIDI packet callback thread and from the
//! application thread; both implementations are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Source of "now", in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Seconds since the Unix epoch, from the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1_000_000_000.0
    }
}

/// Manually advanced clock (for testing).
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.micros
            .store((seconds * 1_000_000.0).round() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.micros
            .fetch_add((seconds * 1_000_000.0).round() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.set(1.0);
        other.advance(0.5);
        assert_eq!(clock.now(), 1.5);
    }

    #[test]
    fn test_wall_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(WallClock.now() > 1_577_836_800.0);
    }
}
