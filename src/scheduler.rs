//! Lookahead schedulers
//!
//! A [`Scheduler`] polls a clock and runs every registered engine whose
//! time falls within the lookahead horizon, invoking each at its exact
//! scheduled time. [`SimpleScheduler`] is the cheaper variant that invokes
//! due engines with a single conservative time per tick.
//!
//! Neither owns a timer loop; a driver (see [`runner`](crate::runner))
//! calls [`tick`](Scheduler::tick) and sleeps according to
//! [`next_wake_delay`](Scheduler::next_wake_delay).

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::clock::Clock;
use crate::engine::{Engine, EngineError};
use crate::scheduling::SchedulingQueue;

/// Poll period in seconds between driver ticks.
pub const DEFAULT_PERIOD: f64 = 0.025;
/// How far past the clock a tick looks for due engines, in seconds.
pub const DEFAULT_LOOKAHEAD: f64 = 0.1;

struct SchedulerInner {
    clock: Rc<dyn Clock>,
    queue: SchedulingQueue,
    period: f64,
    lookahead: f64,
    /// Head time the driver is armed for, `INFINITY` when idle.
    next_time: f64,
    /// Set to the head time being processed while inside a tick.
    advancing: Option<f64>,
}

impl SchedulerInner {
    fn reset_time(&mut self, time: f64) {
        if time == self.next_time {
            return;
        }
        if time.is_finite() {
            debug!("scheduler armed for {}", time);
        } else if self.next_time.is_finite() {
            debug!("scheduler idle");
        }
        self.next_time = time;
    }
}

/// Lookahead scheduler: engines run at their exact scheduled times, up to
/// `lookahead` seconds ahead of the clock.
#[derive(Clone)]
pub struct Scheduler(Rc<RefCell<SchedulerInner>>);

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self(Rc::new(RefCell::new(SchedulerInner {
            clock,
            queue: SchedulingQueue::new(),
            period: DEFAULT_PERIOD,
            lookahead: DEFAULT_LOOKAHEAD,
            next_time: f64::INFINITY,
            advancing: None,
        })))
    }

    pub fn period(&self) -> f64 {
        self.0.borrow().period
    }

    /// Set the poll period; ignored unless `0 < period < lookahead`.
    pub fn set_period(&self, period: f64) {
        let mut inner = self.0.borrow_mut();
        if period.is_finite() && period > 0.0 && period < inner.lookahead {
            inner.period = period;
        }
    }

    pub fn lookahead(&self) -> f64 {
        self.0.borrow().lookahead
    }

    /// Set the lookahead horizon; ignored unless it exceeds the period.
    pub fn set_lookahead(&self, lookahead: f64) {
        let mut inner = self.0.borrow_mut();
        if lookahead.is_finite() && lookahead > inner.period {
            inner.lookahead = lookahead;
        }
    }

    /// The time scheduling decisions should be made against: the head time
    /// being processed while inside a tick, the lookahead horizon otherwise.
    pub fn current_time(&self) -> f64 {
        let inner = self.0.borrow();
        match inner.advancing {
            Some(time) => time,
            None => inner.clock.now() + inner.lookahead,
        }
    }

    /// Register `engine` to run at absolute `time`.
    pub fn add(&self, engine: &Engine, time: f64) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.add(engine, time)?;
        inner.reset_time(head);
        Ok(())
    }

    pub fn remove(&self, engine: &Engine) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.remove(engine)?;
        inner.reset_time(head);
        Ok(())
    }

    /// Move a registered engine to a new time; `INFINITY` parks it dormant.
    pub fn reset_engine_time(&self, engine: &Engine, time: f64) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.reset_engine_time(engine, time)?;
        inner.reset_time(head);
        Ok(())
    }

    pub fn clear(&self) {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.clear();
        inner.reset_time(head);
    }

    /// Run every engine scheduled within the lookahead horizon, each at its
    /// own scheduled time.
    ///
    /// Engine callbacks run with no borrow held, so they are free to call
    /// back into `add`/`remove`/`reset_engine_time` on this scheduler.
    pub fn tick(&self) {
        loop {
            let popped = {
                let mut inner = self.0.borrow_mut();
                let horizon = inner.clock.now() + inner.lookahead;
                let head = inner.queue.next_time();
                if head > horizon {
                    inner.advancing = None;
                    inner.reset_time(head);
                    return;
                }
                inner.advancing = Some(head);
                inner.queue.pop_due(head)
            };
            let Some((engine, due)) = popped else {
                // Head entry vanished between the peek and the pop.
                continue;
            };
            let result = engine.advance_scheduled(due);
            self.0.borrow_mut().queue.apply_advance(&engine, result, due);
        }
    }

    /// How long the driver should sleep before the next [`tick`](Self::tick):
    /// enough to reach `next_time - lookahead`, never less than a period.
    /// `None` when nothing is scheduled.
    pub fn next_wake_delay(&self) -> Option<f64> {
        let inner = self.0.borrow();
        if inner.next_time.is_finite() {
            let now = inner.clock.now();
            Some((inner.next_time - inner.lookahead - now).max(inner.period))
        } else {
            None
        }
    }
}

/// Lookahead scheduler without exact-time invocation: every engine due
/// within the horizon runs with the same conservative tick time.
#[derive(Clone)]
pub struct SimpleScheduler(Rc<RefCell<SchedulerInner>>);

impl SimpleScheduler {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self(Rc::new(RefCell::new(SchedulerInner {
            clock,
            queue: SchedulingQueue::new(),
            period: DEFAULT_PERIOD,
            lookahead: DEFAULT_LOOKAHEAD,
            next_time: f64::INFINITY,
            advancing: None,
        })))
    }

    pub fn period(&self) -> f64 {
        self.0.borrow().period
    }

    pub fn lookahead(&self) -> f64 {
        self.0.borrow().lookahead
    }

    pub fn current_time(&self) -> f64 {
        let inner = self.0.borrow();
        match inner.advancing {
            Some(time) => time,
            None => inner.clock.now() + inner.lookahead,
        }
    }

    pub fn add(&self, engine: &Engine, time: f64) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.add(engine, time)?;
        inner.reset_time(head);
        Ok(())
    }

    pub fn remove(&self, engine: &Engine) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.remove(engine)?;
        inner.reset_time(head);
        Ok(())
    }

    pub fn reset_engine_time(&self, engine: &Engine, time: f64) -> Result<(), EngineError> {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.reset_engine_time(engine, time)?;
        inner.reset_time(head);
        Ok(())
    }

    pub fn clear(&self) {
        let mut inner = self.0.borrow_mut();
        let head = inner.queue.clear();
        inner.reset_time(head);
    }

    /// Run every engine due within the horizon, all with the horizon as
    /// their time.
    pub fn tick(&self) {
        loop {
            let popped = {
                let mut inner = self.0.borrow_mut();
                let horizon = inner.clock.now() + inner.lookahead;
                if inner.queue.next_time() > horizon {
                    inner.advancing = None;
                    let head = inner.queue.next_time();
                    inner.reset_time(head);
                    return;
                }
                inner.advancing = Some(horizon);
                inner.queue.pop_due(horizon)
            };
            let Some((engine, _due)) = popped else {
                continue;
            };
            let time = match self.0.borrow().advancing {
                Some(t) => t,
                None => continue,
            };
            let result = engine.advance_scheduled(time);
            self.0.borrow_mut().queue.apply_advance(&engine, result, time);
        }
    }

    pub fn next_wake_delay(&self) -> Option<f64> {
        let inner = self.0.borrow();
        if inner.next_time.is_finite() {
            let now = inner.clock.now();
            Some((inner.next_time - inner.lookahead - now).max(inner.period))
        } else {
            None
        }
    }
}

thread_local! {
    static SCHEDULERS: RefCell<Vec<(*const (), Scheduler)>> = RefCell::new(Vec::new());
    static SIMPLE_SCHEDULERS: RefCell<Vec<(*const (), SimpleScheduler)>> =
        RefCell::new(Vec::new());
}

fn clock_key(clock: &Rc<dyn Clock>) -> *const () {
    Rc::as_ptr(clock) as *const ()
}

/// The shared [`Scheduler`] for a clock; one driver loop per clock.
pub fn get_scheduler(clock: &Rc<dyn Clock>) -> Scheduler {
    SCHEDULERS.with(|cache| {
        let mut cache = cache.borrow_mut();
        let key = clock_key(clock);
        if let Some((_, scheduler)) = cache.iter().find(|(k, _)| *k == key) {
            return scheduler.clone();
        }
        let scheduler = Scheduler::new(clock.clone());
        cache.push((key, scheduler.clone()));
        scheduler
    })
}

/// The shared [`SimpleScheduler`] for a clock.
pub fn get_simple_scheduler(clock: &Rc<dyn Clock>) -> SimpleScheduler {
    SIMPLE_SCHEDULERS.with(|cache| {
        let mut cache = cache.borrow_mut();
        let key = clock_key(clock);
        if let Some((_, scheduler)) = cache.iter().find(|(k, _)| *k == key) {
            return scheduler.clone();
        }
        let scheduler = SimpleScheduler::new(clock.clone());
        cache.push((key, scheduler.clone()));
        scheduler
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{Advance, EngineHandle, Scheduled};

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

    fn fixture() -> (Rc<ManualClock>, Scheduler) {
        let clock = Rc::new(ManualClock::new());
        let scheduler = Scheduler::new(clock.clone() as Rc<dyn Clock>);
        (clock, scheduler)
    }

    #[test]
    fn test_exact_time_invocation() {
        let (clock, scheduler) = fixture();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
            period: 0.05,
            ticks: ticks.clone(),
        })));
        scheduler.add(&engine, 0.0).unwrap();

        clock.set(0.02);
        scheduler.tick();
        // Everything within now + lookahead ran, each at its exact time
        assert_eq!(*ticks.borrow(), vec![0.0, 0.05, 0.1]);
    }

    #[test]
    fn test_current_time_outside_tick() {
        let (clock, scheduler) = fixture();
        clock.set(1.0);
        let expected = 1.0 + scheduler.lookahead();
        assert!((scheduler.current_time() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_current_time_during_tick() {
        struct Probe {
            scheduler: Scheduler,
            seen: Rc<RefCell<Vec<f64>>>,
        }
        impl Scheduled for Probe {
            fn advance_time(&mut self, time: f64) -> Advance {
                assert_eq!(self.scheduler.current_time(), time);
                self.seen.borrow_mut().push(time);
                Advance::Dormant
            }
        }

        let (clock, scheduler) = fixture();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Probe {
            scheduler: scheduler.clone(),
            seen: seen.clone(),
        })));
        scheduler.add(&engine, 0.05).unwrap();
        clock.set(0.01);
        scheduler.tick();
        assert_eq!(*seen.borrow(), vec![0.05]);
    }

    #[test]
    fn test_reentrant_add_from_callback() {
        struct Spawner {
            scheduler: Scheduler,
            child_ticks: Rc<RefCell<Vec<f64>>>,
        }
        impl Scheduled for Spawner {
            fn advance_time(&mut self, time: f64) -> Advance {
                let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
                    period: 10.0,
                    ticks: self.child_ticks.clone(),
                })));
                self.scheduler.add(&engine, time + 0.01).unwrap();
                Advance::Terminated
            }
        }

        let (clock, scheduler) = fixture();
        let child_ticks = Rc::new(RefCell::new(Vec::new()));
        let spawner = EngineHandle::scheduled(Rc::new(RefCell::new(Spawner {
            scheduler: scheduler.clone(),
            child_ticks: child_ticks.clone(),
        })));
        scheduler.add(&spawner, 0.0).unwrap();
        clock.set(0.0);
        scheduler.tick();
        // The child landed inside the same horizon and ran in the same tick
        assert_eq!(*child_ticks.borrow(), vec![0.01]);
    }

    #[test]
    fn test_wake_delay_tracks_head() {
        let (clock, scheduler) = fixture();
        assert!(scheduler.next_wake_delay().is_none());

        let ticks = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
            period: 1.0,
            ticks,
        })));
        scheduler.add(&engine, 5.0).unwrap();
        let delay = scheduler.next_wake_delay().unwrap();
        assert!((delay - (5.0 - scheduler.lookahead() - clock.now())).abs() < 1e-12);

        // Imminent head clamps to the period
        scheduler.reset_engine_time(&engine, 0.01).unwrap();
        assert_eq!(scheduler.next_wake_delay().unwrap(), scheduler.period());

        scheduler.remove(&engine).unwrap();
        assert!(scheduler.next_wake_delay().is_none());
    }

    #[test]
    fn test_config_validation() {
        let (_clock, scheduler) = fixture();
        scheduler.set_period(0.5); // >= lookahead, rejected
        assert_eq!(scheduler.period(), DEFAULT_PERIOD);
        scheduler.set_lookahead(0.01); // <= period, rejected
        assert_eq!(scheduler.lookahead(), DEFAULT_LOOKAHEAD);

        scheduler.set_lookahead(0.2);
        scheduler.set_period(0.05);
        assert_eq!(scheduler.lookahead(), 0.2);
        assert_eq!(scheduler.period(), 0.05);
    }

    #[test]
    fn test_simple_scheduler_uses_horizon_time() {
        let clock = Rc::new(ManualClock::new());
        let scheduler = SimpleScheduler::new(clock.clone() as Rc<dyn Clock>);
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
            period: 1.0,
            ticks: ticks.clone(),
        })));
        scheduler.add(&engine, 0.05).unwrap();
        clock.set(0.0);
        scheduler.tick();
        // Invoked with the tick horizon, not the scheduled 0.05
        assert_eq!(*ticks.borrow(), vec![scheduler.lookahead()]);
    }

    #[test]
    fn test_factory_caches_per_clock() {
        let a: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let b: Rc<dyn Clock> = Rc::new(ManualClock::new());
        let s1 = get_scheduler(&a);
        let s2 = get_scheduler(&a);
        let s3 = get_scheduler(&b);
        assert!(Rc::ptr_eq(&s1.0, &s2.0));
        assert!(!Rc::ptr_eq(&s1.0, &s3.0));
    }
}
