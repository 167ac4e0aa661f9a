//! Driver loops
//!
//! [`Runner`] turns a [`Scheduler`] into a realtime loop using a
//! spin-assisted sleeper for drift-free waits. [`OfflineRunner`] steps a
//! [`ManualClock`] in period-sized slices instead, so tests and offline
//! rendering see the same lookahead batching as realtime playback.

use std::rc::Rc;
use std::time::{Duration, Instant};

use spin_sleep::SpinSleeper;

use crate::clock::{Clock, ManualClock};
use crate::scheduler::Scheduler;

/// Realtime driver: tick, sleep until the next wake, repeat.
pub struct Runner {
    scheduler: Scheduler,
    sleeper: SpinSleeper,
}

impl Runner {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            sleeper: SpinSleeper::default(),
        }
    }

    /// Drive the scheduler until `done` reports true. `done` is polled
    /// once per wake, so it is checked at least once per period while
    /// idle.
    pub fn run_until(&self, done: impl Fn() -> bool) {
        while !done() {
            self.scheduler.tick();
            let delay = self
                .scheduler
                .next_wake_delay()
                .unwrap_or_else(|| self.scheduler.period());
            self.sleeper.sleep(Duration::from_secs_f64(delay.max(0.0)));
        }
    }

    pub fn run_for(&self, seconds: f64) {
        let start = Instant::now();
        self.run_until(|| start.elapsed().as_secs_f64() >= seconds);
    }
}

/// Offline driver: a manually stepped clock plus a scheduler bound to it.
pub struct OfflineRunner {
    clock: Rc<ManualClock>,
    scheduler: Scheduler,
}

/// Slice count at which a single step is assumed to have run away.
const MAX_SLICES_PER_STEP: u64 = 10_000_000;

impl OfflineRunner {
    pub fn new() -> Self {
        let clock = Rc::new(ManualClock::new());
        let scheduler = Scheduler::new(clock.clone() as Rc<dyn Clock>);
        Self { clock, scheduler }
    }

    pub fn clock(&self) -> Rc<ManualClock> {
        self.clock.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Advance the clock to `time` in period-sized slices, ticking after
    /// each slice.
    pub fn step_to(&self, time: f64) {
        let period = self.scheduler.period();
        let mut slices = 0u64;
        while self.clock.now() + period < time {
            self.clock.advance(period);
            self.scheduler.tick();
            slices += 1;
            if slices > MAX_SLICES_PER_STEP {
                panic!("offline step past {} exceeded {} slices", time, MAX_SLICES_PER_STEP);
            }
        }
        self.clock.set(time);
        self.scheduler.tick();
    }

    pub fn step_sec(&self, dt: f64) {
        if dt > 0.0 {
            self.step_to(self.clock.now() + dt);
        }
    }
}

impl Default for OfflineRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Advance, EngineHandle, Scheduled};
    use std::cell::RefCell;

    struct Metro {
        period: f64,
        ticks: Rc<RefCell<Vec<f64>>>,
    }

    impl Scheduled for Metro {
        fn advance_time(&mut self, time: f64) -> Advance {
            self.ticks.borrow_mut().push(time);
            Advance::At(time + self.period)
        }
    }

    #[test]
    fn test_offline_stepping_matches_schedule() {
        let runner = OfflineRunner::new();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
            period: 0.5,
            ticks: ticks.clone(),
        })));
        runner.scheduler().add(&engine, 0.5).unwrap();

        runner.step_to(2.0);
        // Everything due within now + lookahead has run
        let seen = ticks.borrow();
        assert_eq!(*seen, vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_step_sec_accumulates() {
        let runner = OfflineRunner::new();
        runner.step_sec(0.3);
        runner.step_sec(0.3);
        assert!((runner.now() - 0.6).abs() < 1e-9);
    }
}
