//! Clock sources
//!
//! The scheduling core never reads the host clock directly; it is handed a
//! [`Clock`] at construction. Realtime code uses [`SystemClock`], tests and
//! offline rendering use [`ManualClock`].

use std::cell::Cell;
use std::time::Instant;

/// A monotonic clock reporting seconds as floating point.
pub trait Clock {
    fn now(&self) -> f64;
}

/// Wall clock: monotonic seconds since construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
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
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually stepped clock for offline execution and tests.
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0.0) }
    }

    /// Set the current time. Never steps backwards.
    pub fn set(&self, time: f64) {
        if time > self.now.get() {
            self.now.set(time);
        }
    }

    /// Advance the current time by `dt` seconds.
    pub fn advance(&self, dt: f64) {
        if dt.is_finite() && dt > 0.0 {
            self.now.set(self.now.get() + dt);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_steps() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0.0);

        clock.advance(0.5);
        assert!((clock.now() - 0.5).abs() < 1e-12);

        clock.set(2.0);
        assert_eq!(clock.now(), 2.0);

        // Backwards set is ignored
        clock.set(1.0);
        assert_eq!(clock.now(), 2.0);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
