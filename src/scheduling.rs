//! Time-ordered engine registry
//!
//! A [`SchedulingQueue`] keeps a set of [`Scheduled`] engines ordered by
//! the absolute time of their next invocation. Sweeping it with
//! [`advance_time`](SchedulingQueue::advance_time) invokes every engine
//! whose time has come and reinserts those that asked to run again.
//!
//! The queue itself implements [`Scheduled`], so it can sit inside a
//! [`Scheduler`](crate::Scheduler) or another queue as a single entry.

use std::collections::HashMap;

use log::warn;

use crate::engine::{next_id, Advance, Engine, EngineError, Scheduled};
use crate::pq::PriorityQueue;

/// Ordered collection of scheduled engines, itself schedulable.
pub struct SchedulingQueue {
    master_id: u64,
    queue: PriorityQueue,
    engines: HashMap<u64, Engine>,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::with_master(next_id())
    }

    /// A queue claiming its engines under an existing master identity,
    /// for masters that embed a queue rather than register with one.
    pub(crate) fn with_master(master_id: u64) -> Self {
        Self {
            master_id,
            queue: PriorityQueue::new(),
            engines: HashMap::new(),
        }
    }

    pub(crate) fn master_id(&self) -> u64 {
        self.master_id
    }

    /// Register `engine` to be invoked at absolute `time`.
    ///
    /// Returns the queue's new head time. A non-finite `time` registers
    /// the engine dormant: owned, but not queued until
    /// [`reset_engine_time`](Self::reset_engine_time) wakes it.
    pub fn add(&mut self, engine: &Engine, time: f64) -> Result<f64, EngineError> {
        if !engine.is_scheduled() {
            return Err(EngineError::MissingCapability("scheduled"));
        }
        engine.claim(self.master_id)?;
        self.engines.insert(engine.id(), engine.clone());
        Ok(self.queue.insert(engine.id(), time))
    }

    /// Unregister `engine`. Returns the queue's new head time.
    pub fn remove(&mut self, engine: &Engine) -> Result<f64, EngineError> {
        if self.engines.remove(&engine.id()).is_none() {
            return Err(EngineError::NotRegistered);
        }
        engine.release();
        Ok(self.queue.remove(engine.id()))
    }

    /// Move a registered engine to a new invocation time; a non-finite
    /// `time` parks it dormant. Returns the queue's new head time.
    pub fn reset_engine_time(&mut self, engine: &Engine, time: f64) -> Result<f64, EngineError> {
        if !self.engines.contains_key(&engine.id()) {
            return Err(EngineError::NotRegistered);
        }
        Ok(self.queue.move_key(engine.id(), time))
    }

    /// Drop every engine and release their claims.
    pub fn clear(&mut self) -> f64 {
        for engine in self.engines.values() {
            engine.release();
        }
        self.engines.clear();
        self.queue.clear()
    }

    /// Absolute time of the next invocation, `f64::INFINITY` when idle.
    pub fn next_time(&mut self) -> f64 {
        self.queue.time()
    }

    pub fn contains(&self, engine: &Engine) -> bool {
        self.engines.contains_key(&engine.id())
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Pop the head entry if it is due at or before `time`.
    ///
    /// Split from [`apply_advance`](Self::apply_advance) so callers can
    /// invoke the engine without holding any borrow of the queue.
    pub(crate) fn pop_due(&mut self, time: f64) -> Option<(Engine, f64)> {
        let head_time = self.queue.time();
        if head_time > time {
            return None;
        }
        let (id, due) = self.queue.pop_head()?;
        match self.engines.get(&id) {
            Some(engine) => Some((engine.clone(), due)),
            None => None,
        }
    }

    /// Apply an engine's advance result after a [`pop_due`](Self::pop_due).
    ///
    /// The engine is requeued only for a finite time strictly after the
    /// sweep time `time`; an equal or earlier request would spin the sweep,
    /// so it parks the engine dormant instead. [`Advance::Terminated`]
    /// unregisters the engine for good.
    pub(crate) fn apply_advance(&mut self, engine: &Engine, result: Advance, time: f64) {
        if !self.engines.contains_key(&engine.id()) {
            // The engine removed itself (or was removed) during its own
            // invocation; honor that over the returned value.
            return;
        }
        match result {
            Advance::At(next) if next.is_finite() && next > time => {
                self.queue.insert(engine.id(), next);
            }
            Advance::At(next) => {
                if next.is_finite() {
                    warn!(
                        "engine {} requested non-advancing time {} at {}, parking it",
                        engine.id(),
                        next,
                        time
                    );
                }
                self.queue.remove(engine.id());
            }
            Advance::Dormant => {
                self.queue.remove(engine.id());
            }
            Advance::Terminated => {
                self.queue.remove(engine.id());
                self.engines.remove(&engine.id());
                engine.release();
            }
        }
    }

    /// Invoke every engine due at or before `time`, in time order, and
    /// return the next pending time (`f64::INFINITY` when none remain).
    pub fn advance_time(&mut self, time: f64) -> f64 {
        while let Some((engine, _due)) = self.pop_due(time) {
            let result = engine.advance_scheduled(time);
            self.apply_advance(&engine, result, time);
        }
        self.queue.time()
    }
}

impl Default for SchedulingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduled for SchedulingQueue {
    fn advance_time(&mut self, time: f64) -> Advance {
        let next = SchedulingQueue::advance_time(self, time);
        if next.is_finite() {
            Advance::At(next)
        } else {
            Advance::Dormant
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHandle;
    use std::cell::RefCell;
    use std::rc::Rc;

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

    struct OneShot {
        fired: Rc<RefCell<Vec<f64>>>,
    }

    impl Scheduled for OneShot {
        fn advance_time(&mut self, time: f64) -> Advance {
            self.fired.borrow_mut().push(time);
            Advance::Terminated
        }
    }

    fn metro(period: f64) -> (Engine, Rc<RefCell<Vec<f64>>>) {
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Metro {
            period,
            ticks: ticks.clone(),
        })));
        (engine, ticks)
    }

    #[test]
    fn test_add_rejects_wrong_capability() {
        struct Silent;
        impl crate::engine::SpeedControlled for Silent {
            fn sync_speed(&mut self, _: f64, _: f64, _: f64, _: bool) {}
        }
        let mut queue = SchedulingQueue::new();
        let engine = EngineHandle::speed_controlled(Rc::new(RefCell::new(Silent)));
        assert!(matches!(
            queue.add(&engine, 0.0),
            Err(EngineError::MissingCapability("scheduled"))
        ));
    }

    #[test]
    fn test_single_master() {
        let mut a = SchedulingQueue::new();
        let mut b = SchedulingQueue::new();
        let (engine, _) = metro(1.0);
        a.add(&engine, 0.0).unwrap();
        assert!(matches!(b.add(&engine, 0.0), Err(EngineError::AlreadyOwned)));
        a.remove(&engine).unwrap();
        b.add(&engine, 0.0).unwrap();
    }

    #[test]
    fn test_sweep_invokes_in_time_order() {
        let mut queue = SchedulingQueue::new();
        let ticks = Rc::new(RefCell::new(Vec::new()));

        let b = EngineHandle::scheduled(Rc::new(RefCell::new(OneShot {
            fired: ticks.clone(),
        })));
        let a = EngineHandle::scheduled(Rc::new(RefCell::new(OneShot {
            fired: ticks.clone(),
        })));
        queue.add(&b, 1.5).unwrap();
        queue.add(&a, 1.0).unwrap();

        let next = queue.advance_time(2.0);
        // Both invoked with the sweep time, earliest first
        assert_eq!(ticks.borrow().len(), 2);
        assert_eq!(next, f64::INFINITY);
    }

    #[test]
    fn test_sweep_stops_at_horizon() {
        let mut queue = SchedulingQueue::new();
        let (a, a_ticks) = metro(1.0);
        let (b, b_ticks) = metro(1.0);
        let (c, c_ticks) = metro(1.0);
        queue.add(&a, 1.0).unwrap();
        queue.add(&b, 1.5).unwrap();
        queue.add(&c, 3.0).unwrap();

        let next = queue.advance_time(2.0);
        assert_eq!(a_ticks.borrow().len(), 1);
        assert_eq!(b_ticks.borrow().len(), 1);
        assert!(c_ticks.borrow().is_empty());
        // a asked for 2.0 + 1.0 but c at 3.0 is equally near; both beyond
        // the current sweep.
        assert_eq!(next, 3.0);
    }

    #[test]
    fn test_terminated_engine_is_released() {
        let mut queue = SchedulingQueue::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(OneShot {
            fired: fired.clone(),
        })));
        queue.add(&engine, 1.0).unwrap();
        queue.advance_time(1.0);

        assert_eq!(fired.borrow().len(), 1);
        assert!(!queue.contains(&engine));
        assert!(engine.master().is_none());
        // Free to register elsewhere
        let mut other = SchedulingQueue::new();
        other.add(&engine, 0.0).unwrap();
    }

    #[test]
    fn test_dormant_engine_stays_registered() {
        struct Sleeper;
        impl Scheduled for Sleeper {
            fn advance_time(&mut self, _time: f64) -> Advance {
                Advance::Dormant
            }
        }
        let mut queue = SchedulingQueue::new();
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Sleeper)));
        queue.add(&engine, 1.0).unwrap();
        assert_eq!(queue.advance_time(1.0), f64::INFINITY);

        assert!(queue.contains(&engine));
        assert!(engine.master().is_some());
        // Re-armable without re-adding
        assert_eq!(queue.reset_engine_time(&engine, 5.0).unwrap(), 5.0);
        assert_eq!(queue.next_time(), 5.0);
    }

    #[test]
    fn test_add_with_infinite_time_is_dormant() {
        let mut queue = SchedulingQueue::new();
        let (engine, ticks) = metro(1.0);
        queue.add(&engine, f64::INFINITY).unwrap();
        assert!(queue.contains(&engine));
        assert_eq!(queue.advance_time(100.0), f64::INFINITY);
        assert!(ticks.borrow().is_empty());

        queue.reset_engine_time(&engine, 1.0).unwrap();
        queue.advance_time(1.0);
        assert_eq!(*ticks.borrow(), vec![1.0]);
    }

    #[test]
    fn test_remove_unregistered_errors() {
        let mut queue = SchedulingQueue::new();
        let (engine, _) = metro(1.0);
        assert!(matches!(
            queue.remove(&engine),
            Err(EngineError::NotRegistered)
        ));
        assert!(matches!(
            queue.reset_engine_time(&engine, 1.0),
            Err(EngineError::NotRegistered)
        ));
    }

    #[test]
    fn test_metro_reschedules_itself() {
        let mut queue = SchedulingQueue::new();
        let (engine, ticks) = metro(0.5);
        queue.add(&engine, 0.0).unwrap();

        let next = queue.advance_time(0.0);
        assert_eq!(next, 0.5);
        // The tick due at 0.5 runs as-of the sweep time, and its requested
        // follow-up (sweep + period) lands beyond this sweep.
        let next = queue.advance_time(1.6);
        assert_eq!(*ticks.borrow(), vec![0.0, 1.6]);
        assert!((next - 2.1).abs() < 1e-9);
    }

    #[test]
    fn test_non_advancing_request_parks() {
        struct Stuck;
        impl Scheduled for Stuck {
            fn advance_time(&mut self, time: f64) -> Advance {
                Advance::At(time) // never makes progress
            }
        }
        let mut queue = SchedulingQueue::new();
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Stuck)));
        queue.add(&engine, 1.0).unwrap();
        assert_eq!(queue.advance_time(1.0), f64::INFINITY);
        assert!(queue.contains(&engine));
    }

    #[test]
    fn test_queue_nests_as_scheduled_engine() {
        let mut outer = SchedulingQueue::new();

        let inner = Rc::new(RefCell::new(SchedulingQueue::new()));
        let (leaf, leaf_ticks) = metro(1.0);
        inner.borrow_mut().add(&leaf, 2.0).unwrap();

        let inner_engine = EngineHandle::scheduled(inner.clone());
        outer.add(&inner_engine, inner.borrow_mut().next_time()).unwrap();

        assert_eq!(outer.next_time(), 2.0);
        let next = outer.advance_time(2.0);
        assert_eq!(*leaf_ticks.borrow(), vec![2.0]);
        assert_eq!(next, 3.0);
    }
}
