//! Position timeline
//!
//! A [`Transport`] maintains a logical position timeline, defined by the
//! synchronized triple `(time, position, speed)`, and drives a set of
//! child engines through it. Children may be [`Transported`] (position
//! aware), [`SpeedControlled`] (rate aware), or [`Scheduled`] (time only);
//! each is wrapped in an adapter that confines it to a position window
//! `[start, end]` with a local offset.
//!
//! A Transport is itself a [`Transported`] engine (see
//! [`as_engine`](Transport::as_engine)), so transports nest: a child
//! transport is repositioned by its parent and routes its own wake-up
//! requests back up through the owning adapter. A standalone transport is
//! driven by a `Scheduled` hook registered with the root [`Scheduler`].

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::engine::{
    Advance, Engine, EngineError, EngineHandle, EngineKind, MasterLink, Scheduled, SpeedControlled,
    Transported,
};
use crate::engine::next_id;
use crate::loop_control::{LoopControl, Loopable};
use crate::pq::PriorityQueue;
use crate::play_control;
use crate::scheduler::Scheduler;
use crate::scheduling::SchedulingQueue;

/// Bound on child advances per sweep; a child that keeps re-queueing the
/// same position would otherwise spin the tick forever.
const MAX_ADVANCES_PER_TICK: usize = 10_000;

/// Shared state behind a [`Transport`] handle.
pub(crate) struct TransportInner {
    id: u64,
    time: f64,
    position: f64,
    speed: f64,
    scheduler: Scheduler,
    slots: Vec<AdapterSlot>,
    /// Adapter id -> global position of its next event.
    queue: PriorityQueue,
    /// Scheduled children, time-driven independently of position.
    sched_queue: Rc<RefCell<SchedulingQueue>>,
    /// Drives position advancement from the root scheduler when unowned.
    hook: Engine,
    /// Sweeps `sched_queue` from the root scheduler.
    queue_hook: Engine,
    /// This transport's own Transported surface, for nesting.
    self_engine: Engine,
    loop_start: f64,
    loop_end: f64,
    looping: bool,
    loop_engine: Option<Engine>,
}

impl TransportInner {
    fn position_at_time(&self, time: f64) -> f64 {
        self.position + (time - self.time) * self.speed
    }

    fn time_at_position(&self, position: f64) -> f64 {
        if self.speed == 0.0 {
            f64::INFINITY
        } else {
            self.time + (position - self.position) / self.speed
        }
    }

    fn loop_wake(&self) -> f64 {
        if !self.looping {
            f64::INFINITY
        } else if self.speed > 0.0 {
            self.time_at_position(self.loop_end)
        } else if self.speed < 0.0 {
            self.time_at_position(self.loop_start)
        } else {
            f64::INFINITY
        }
    }

    fn slot_index(&self, engine_id: u64) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == engine_id)
    }
}

/// Per-child registration record. Window parameters are fixed at `add`
/// time, so they are readable here without touching the adapter cell.
struct AdapterSlot {
    id: u64,
    engine: Engine,
    adapter: Rc<RefCell<TransportedAdapter>>,
    start: f64,
    end: f64,
    offset: f64,
}

enum AdapterKind {
    Transported(Rc<RefCell<dyn Transported>>),
    SpeedControlled(Rc<RefCell<dyn SpeedControlled>>),
    Scheduled {
        engine: Engine,
        queue: Rc<RefCell<SchedulingQueue>>,
        scheduler: Scheduler,
        hook: Engine,
    },
}

/// Gating state of one adapter.
enum Gate {
    /// The child is running inside its window.
    Active,
    /// Waiting at the near boundary; holds the position to report once
    /// the queued entry event fires (the far boundary).
    Pending(f64),
    /// Beyond the window in the travel direction, or torn down.
    Out,
}

/// Confines one child to a position window on the transport's timeline.
pub(crate) struct TransportedAdapter {
    start: f64,
    end: f64,
    offset: f64,
    gate: Gate,
    kind: AdapterKind,
}

impl TransportedAdapter {
    fn is_active(&self) -> bool {
        matches!(self.gate, Gate::Active)
    }

    fn local(&self, global: f64) -> f64 {
        global - self.offset
    }

    fn out_key(speed: f64) -> f64 {
        if speed < 0.0 {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }
    }

    fn clamp(&self, next: f64, speed: f64) -> f64 {
        if speed < 0.0 {
            next.max(self.start)
        } else {
            next.min(self.end)
        }
    }

    /// Child enters its window: start it and return the next queue key.
    fn enter(&mut self, time: f64, global: f64, speed: f64) -> f64 {
        self.gate = Gate::Active;
        match &self.kind {
            AdapterKind::Transported(child) => {
                let next =
                    child.borrow_mut().sync_position(time, self.local(global), speed) + self.offset;
                self.clamp(next, speed)
            }
            AdapterKind::SpeedControlled(child) => {
                child.borrow_mut().sync_speed(time, self.local(global), speed, true);
                if speed < 0.0 {
                    self.start
                } else {
                    self.end
                }
            }
            AdapterKind::Scheduled {
                engine,
                queue,
                scheduler,
                hook,
            } => {
                if let Ok(head) = queue.borrow_mut().reset_engine_time(engine, time) {
                    let _ = scheduler.reset_engine_time(hook, head);
                }
                if speed < 0.0 {
                    self.start
                } else {
                    self.end
                }
            }
        }
    }

    fn stop(&mut self, time: f64, global: f64) {
        match &self.kind {
            AdapterKind::Transported(child) => {
                child.borrow_mut().sync_speed(time, self.local(global), 0.0, false);
            }
            AdapterKind::SpeedControlled(child) => {
                child.borrow_mut().sync_speed(time, self.local(global), 0.0, false);
            }
            AdapterKind::Scheduled {
                engine,
                queue,
                scheduler,
                hook,
            } => {
                if let Ok(head) = queue.borrow_mut().reset_engine_time(engine, f64::INFINITY) {
                    let _ = scheduler.reset_engine_time(hook, head);
                }
            }
        }
    }

    /// Full repositioning: window gating around the child.
    fn sync_position(&mut self, time: f64, global: f64, speed: f64) -> f64 {
        if speed > 0.0 {
            if global < self.start {
                if self.is_active() {
                    self.stop(time, global);
                }
                self.gate = Gate::Pending(self.end);
                return self.start;
            }
            if global <= self.end {
                return self.enter(time, global, speed);
            }
        } else if speed < 0.0 {
            if global > self.end {
                if self.is_active() {
                    self.stop(time, global);
                }
                self.gate = Gate::Pending(self.start);
                return self.end;
            }
            if global >= self.start {
                return self.enter(time, global, speed);
            }
        }
        // Beyond the window in the travel direction (or stopped).
        if self.is_active() {
            self.stop(time, global);
        }
        self.gate = Gate::Out;
        Self::out_key(speed)
    }

    /// The timeline reached this adapter's queued position.
    fn advance_position(&mut self, time: f64, global: f64, speed: f64) -> f64 {
        match self.gate {
            Gate::Out => return Self::out_key(speed),
            Gate::Pending(report) => {
                // Window entry: start the child now. Transported children
                // reschedule through their own sync result instead.
                let entered = self.enter(time, global, speed);
                return match self.kind {
                    AdapterKind::Transported(_) => entered,
                    _ => report,
                };
            }
            Gate::Active => {}
        }
        // Reached the window exit boundary with the child running.
        let exiting = if speed < 0.0 {
            global <= self.start
        } else {
            global >= self.end
        };
        if exiting {
            self.stop(time, global);
            self.gate = Gate::Out;
            return Self::out_key(speed);
        }
        match &self.kind {
            AdapterKind::Transported(child) => {
                let next =
                    child.borrow_mut().advance_position(time, self.local(global), speed) + self.offset;
                self.clamp(next, speed)
            }
            // Non-transported children only queue boundary events, which the
            // exit branch above consumed.
            _ => {
                self.gate = Gate::Out;
                Self::out_key(speed)
            }
        }
    }

    /// Global speed broadcast; window gating is unaffected.
    fn sync_speed(&mut self, time: f64, global: f64, speed: f64, seek: bool) {
        match &self.kind {
            AdapterKind::Transported(child) => {
                child.borrow_mut().sync_speed(time, self.local(global), speed, seek);
            }
            AdapterKind::SpeedControlled(child) => {
                // Dormant children have no position tracking to correct.
                if self.is_active() {
                    child.borrow_mut().sync_speed(time, self.local(global), speed, seek);
                }
            }
            AdapterKind::Scheduled { .. } => {}
        }
    }

    /// Final teardown; speed-controlled children always get a closing stop.
    fn destroy(&mut self, time: f64, global: f64) {
        match &self.kind {
            AdapterKind::Transported(child) => {
                if self.is_active() {
                    child.borrow_mut().sync_speed(time, self.local(global), 0.0, false);
                }
            }
            AdapterKind::SpeedControlled(child) => {
                child.borrow_mut().sync_speed(time, self.local(global), 0.0, false);
            }
            AdapterKind::Scheduled {
                engine,
                queue,
                scheduler,
                hook,
            } => {
                if let Ok(head) = queue.borrow_mut().remove(engine) {
                    let _ = scheduler.reset_engine_time(hook, head);
                }
            }
        }
        self.gate = Gate::Out;
    }
}

/// Scheduled shim driving a standalone transport from the root scheduler.
struct TransportHook {
    inner: Weak<RefCell<TransportInner>>,
}

impl Scheduled for TransportHook {
    fn advance_time(&mut self, time: f64) -> Advance {
        let Some(inner) = self.inner.upgrade() else {
            return Advance::Terminated;
        };
        let next_time = advance_transport(&inner, time);
        if next_time.is_finite() {
            Advance::At(next_time)
        } else {
            Advance::Dormant
        }
    }
}

/// Scheduled shim sweeping the transport's internal queue of Scheduled
/// children by wall-clock time.
struct TransportQueueHook {
    queue: Rc<RefCell<SchedulingQueue>>,
}

impl Scheduled for TransportQueueHook {
    fn advance_time(&mut self, time: f64) -> Advance {
        loop {
            let popped = self.queue.borrow_mut().pop_due(time);
            let Some((engine, _due)) = popped else {
                break;
            };
            let result = engine.advance_scheduled(time);
            self.queue.borrow_mut().apply_advance(&engine, result, time);
        }
        let next = self.queue.borrow_mut().next_time();
        if next.is_finite() {
            Advance::At(next)
        } else {
            Advance::Dormant
        }
    }
}

/// The transport's own Transported surface, handed to a parent master.
struct TransportFacade {
    inner: Weak<RefCell<TransportInner>>,
}

impl Transported for TransportFacade {
    fn sync_position(&mut self, time: f64, position: f64, speed: f64) -> f64 {
        let Some(inner) = self.inner.upgrade() else {
            return TransportedAdapter::out_key(speed);
        };
        let (scheduler, hook) = {
            let mut b = inner.borrow_mut();
            b.time = time;
            b.position = position;
            b.speed = speed;
            (b.scheduler.clone(), b.hook.clone())
        };
        // The parent drives us now; the standalone hook stays parked.
        let _ = scheduler.reset_engine_time(&hook, f64::INFINITY);
        resync_children(&inner, time, position, speed);
        rearm_loop(&inner);
        let mut b = inner.borrow_mut();
        b.queue.time()
    }

    fn advance_position(&mut self, time: f64, position: f64, speed: f64) -> f64 {
        let Some(inner) = self.inner.upgrade() else {
            return TransportedAdapter::out_key(speed);
        };
        advance_one(&inner, time, position, speed)
    }

    fn sync_speed(&mut self, time: f64, position: f64, speed: f64, seek: bool) {
        if let Some(inner) = self.inner.upgrade() {
            transport_sync_speed(&inner, time, position, speed, seek);
        }
    }
}

/// Exposes the transport's loop state to [`LoopControl`].
struct TransportLoopTarget {
    inner: Weak<RefCell<TransportInner>>,
}

impl Loopable for TransportLoopTarget {
    fn speed(&self) -> f64 {
        self.inner.upgrade().map_or(0.0, |rc| rc.borrow().speed)
    }

    fn loop_start(&self) -> f64 {
        self.inner.upgrade().map_or(0.0, |rc| rc.borrow().loop_start)
    }

    fn loop_end(&self) -> f64 {
        self.inner.upgrade().map_or(0.0, |rc| rc.borrow().loop_end)
    }

    fn time_at_position(&self, position: f64) -> f64 {
        self.inner
            .upgrade()
            .map_or(f64::INFINITY, |rc| rc.borrow().time_at_position(position))
    }

    fn loop_seek(&mut self, time: f64, position: f64) {
        if let Some(rc) = self.inner.upgrade() {
            let speed = rc.borrow().speed;
            transport_sync_speed(&rc, time, position, speed, true);
        }
    }
}

/// Multi-child position timeline handle.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<RefCell<TransportInner>>,
}

impl Transport {
    pub fn new(scheduler: &Scheduler) -> Self {
        let id = next_id();
        let sched_queue = Rc::new(RefCell::new(SchedulingQueue::with_master(id)));
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<TransportInner>>| {
            let hook = EngineHandle::scheduled(Rc::new(RefCell::new(TransportHook {
                inner: weak.clone(),
            })));
            let queue_hook = EngineHandle::scheduled(Rc::new(RefCell::new(TransportQueueHook {
                queue: sched_queue.clone(),
            })));
            let self_engine = EngineHandle::transported(Rc::new(RefCell::new(TransportFacade {
                inner: weak.clone(),
            })));
            RefCell::new(TransportInner {
                id,
                time: 0.0,
                position: 0.0,
                speed: 0.0,
                scheduler: scheduler.clone(),
                slots: Vec::new(),
                queue: PriorityQueue::new(),
                sched_queue: sched_queue.clone(),
                hook,
                queue_hook,
                self_engine,
                loop_start: f64::NEG_INFINITY,
                loop_end: f64::INFINITY,
                looping: false,
                loop_engine: None,
            })
        });
        {
            let b = inner.borrow();
            // Fresh unclaimed Scheduled shims, registration cannot fail.
            scheduler.add(&b.hook, f64::INFINITY).unwrap();
            scheduler.add(&b.queue_hook, f64::INFINITY).unwrap();
        }
        Self { inner }
    }

    /// This transport as a Transported engine, for nesting under another
    /// Transport or a PlayControl.
    pub fn as_engine(&self) -> Engine {
        self.inner.borrow().self_engine.clone()
    }

    pub fn current_time(&self) -> f64 {
        self.inner.borrow().scheduler.current_time()
    }

    pub fn current_position(&self) -> f64 {
        let time = self.current_time();
        self.inner.borrow().position_at_time(time)
    }

    pub fn speed(&self) -> f64 {
        self.inner.borrow().speed
    }

    /// Register a child over the whole timeline with no offset.
    pub fn add(&self, engine: &Engine) -> Result<(), EngineError> {
        self.add_clipped(engine, f64::NEG_INFINITY, f64::INFINITY, 0.0)
    }

    /// Register a child confined to `[start, end]`, its local origin at
    /// global position `offset`.
    pub fn add_clipped(
        &self,
        engine: &Engine,
        start: f64,
        end: f64,
        offset: f64,
    ) -> Result<(), EngineError> {
        let adapter = {
            let b = self.inner.borrow();
            let kind = match engine.kind() {
                EngineKind::Transported(child) => {
                    engine.claim(b.id)?;
                    AdapterKind::Transported(child.clone())
                }
                EngineKind::SpeedControlled(child) => {
                    engine.claim(b.id)?;
                    AdapterKind::SpeedControlled(child.clone())
                }
                EngineKind::Scheduled(_) => {
                    // Claims under this transport's id, dormant until the
                    // window opens.
                    b.sched_queue.borrow_mut().add(engine, f64::INFINITY)?;
                    AdapterKind::Scheduled {
                        engine: engine.clone(),
                        queue: b.sched_queue.clone(),
                        scheduler: b.scheduler.clone(),
                        hook: b.queue_hook.clone(),
                    }
                }
            };
            Rc::new(RefCell::new(TransportedAdapter {
                start,
                end,
                offset,
                gate: Gate::Out,
                kind,
            }))
        };
        if engine.is_transported() {
            engine.set_link(MasterLink::Transport {
                inner: Rc::downgrade(&self.inner),
                adapter: engine.id(),
            });
        }
        let speed = {
            let mut b = self.inner.borrow_mut();
            b.slots.push(AdapterSlot {
                id: engine.id(),
                engine: engine.clone(),
                adapter: adapter.clone(),
                start,
                end,
                offset,
            });
            b.speed
        };
        if speed != 0.0 {
            let time = self.current_time();
            let position = self.inner.borrow().position_at_time(time);
            let next = adapter.borrow_mut().sync_position(time, position, speed);
            self.inner.borrow_mut().queue.insert(engine.id(), next);
            reschedule_upstream(&self.inner);
        }
        Ok(())
    }

    pub fn remove(&self, engine: &Engine) -> Result<(), EngineError> {
        let slot = {
            let mut b = self.inner.borrow_mut();
            let Some(idx) = b.slot_index(engine.id()) else {
                return Err(EngineError::NotRegistered);
            };
            b.queue.remove(engine.id());
            b.slots.remove(idx)
        };
        let time = self.current_time();
        let position = self.inner.borrow().position_at_time(time);
        slot.adapter.borrow_mut().destroy(time, position);
        slot.engine.release();
        reschedule_upstream(&self.inner);
        Ok(())
    }

    pub fn clear(&self) {
        let slots = {
            let mut b = self.inner.borrow_mut();
            b.queue.clear();
            std::mem::take(&mut b.slots)
        };
        let time = self.current_time();
        let position = self.inner.borrow().position_at_time(time);
        for slot in slots {
            slot.adapter.borrow_mut().destroy(time, position);
            slot.engine.release();
        }
        reschedule_upstream(&self.inner);
    }

    /// Re-anchor the timeline at `position` without changing speed.
    pub fn reset_position(&self, position: f64) {
        let time = self.current_time();
        let speed = {
            let mut b = self.inner.borrow_mut();
            b.time = time;
            b.position = position;
            b.speed
        };
        if speed != 0.0 {
            resync_children(&self.inner, time, position, speed);
        }
        rearm_loop(&self.inner);
        reschedule_upstream(&self.inner);
    }

    /// Move one child's pending event to an explicit global position.
    pub fn reset_engine_position(&self, engine: &Engine, position: f64) -> Result<(), EngineError> {
        {
            let mut b = self.inner.borrow_mut();
            if b.slot_index(engine.id()).is_none() {
                return Err(EngineError::NotRegistered);
            }
            b.queue.move_key(engine.id(), position);
        }
        reschedule_upstream(&self.inner);
        Ok(())
    }

    pub fn loop_start(&self) -> f64 {
        self.inner.borrow().loop_start
    }

    pub fn loop_end(&self) -> f64 {
        self.inner.borrow().loop_end
    }

    pub fn set_loop_start(&self, position: f64) {
        self.inner.borrow_mut().loop_start = position;
        rearm_loop(&self.inner);
    }

    pub fn set_loop_end(&self, position: f64) {
        self.inner.borrow_mut().loop_end = position;
        rearm_loop(&self.inner);
    }

    pub fn is_looping(&self) -> bool {
        self.inner.borrow().looping
    }

    /// Enable or disable looping; enabling requires finite, ordered
    /// boundaries and is otherwise ignored.
    pub fn set_loop(&self, looping: bool) {
        if looping {
            {
                let b = self.inner.borrow();
                if b.looping
                    || !b.loop_start.is_finite()
                    || !b.loop_end.is_finite()
                    || b.loop_start >= b.loop_end
                {
                    return;
                }
            }
            let engine = EngineHandle::scheduled(Rc::new(RefCell::new(LoopControl::new(
                Box::new(TransportLoopTarget {
                    inner: Rc::downgrade(&self.inner),
                }),
            ))));
            let scheduler = self.inner.borrow().scheduler.clone();
            // Registered dormant; armed once the loop state is in place,
            // so enabling mid-playback wakes at the boundary ahead.
            scheduler.add(&engine, f64::INFINITY).unwrap();
            {
                let mut b = self.inner.borrow_mut();
                b.looping = true;
                b.loop_engine = Some(engine);
            }
            rearm_loop(&self.inner);
        } else {
            let mut b = self.inner.borrow_mut();
            b.looping = false;
            if let Some(engine) = b.loop_engine.take() {
                let scheduler = b.scheduler.clone();
                drop(b);
                let _ = scheduler.remove(&engine);
            }
        }
    }
}

/// Re-anchor the triple and rebuild the position queue from every child's
/// own `sync_position`. Entry point for masters and tests driving the
/// timeline directly.
pub(crate) fn transport_sync_speed(
    rc: &Rc<RefCell<TransportInner>>,
    time: f64,
    position: f64,
    speed: f64,
    seek: bool,
) {
    let last = {
        let mut b = rc.borrow_mut();
        let last = b.speed;
        if speed == last && !(seek && speed != 0.0) {
            return;
        }
        b.time = time;
        b.position = position;
        b.speed = speed;
        last
    };
    if seek || speed * last < 0.0 || (last == 0.0 && speed != 0.0) {
        debug!(
            "transport resync: time {} position {} speed {}",
            time, position, speed
        );
        resync_children(rc, time, position, speed);
    } else {
        // Stop (speed 0) or a same-direction rate change: broadcast only,
        // queue ordering is unaffected.
        broadcast_speed(rc, time, position, speed, seek);
    }
    rearm_loop(rc);
    reschedule_upstream(rc);
}

fn resync_children(rc: &Rc<RefCell<TransportInner>>, time: f64, position: f64, speed: f64) {
    let slots: Vec<(u64, Rc<RefCell<TransportedAdapter>>)> = {
        let mut b = rc.borrow_mut();
        b.queue.clear();
        b.queue.reverse(speed < 0.0);
        b.slots
            .iter()
            .map(|slot| (slot.id, slot.adapter.clone()))
            .collect()
    };
    for (id, adapter) in slots {
        let next = adapter.borrow_mut().sync_position(time, position, speed);
        rc.borrow_mut().queue.insert(id, next);
    }
}

fn broadcast_speed(rc: &Rc<RefCell<TransportInner>>, time: f64, position: f64, speed: f64, seek: bool) {
    let adapters: Vec<Rc<RefCell<TransportedAdapter>>> = {
        let b = rc.borrow();
        b.slots.iter().map(|slot| slot.adapter.clone()).collect()
    };
    for adapter in adapters {
        adapter.borrow_mut().sync_speed(time, position, speed, seek);
    }
}

fn rearm_loop(rc: &Rc<RefCell<TransportInner>>) {
    let armed = {
        let b = rc.borrow();
        b.loop_engine
            .as_ref()
            .map(|engine| (engine.clone(), b.loop_wake(), b.scheduler.clone()))
    };
    if let Some((engine, wake, scheduler)) = armed {
        let _ = scheduler.reset_engine_time(&engine, wake);
    }
}

/// Route the transport's next wake to whoever drives it: the parent
/// adapter when nested, the root-scheduler hook otherwise.
pub(crate) fn reschedule_upstream(rc: &Rc<RefCell<TransportInner>>) {
    let (link, scheduler, hook, next_pos, next_time) = {
        let mut b = rc.borrow_mut();
        let next_pos = b.queue.time();
        let next_time = b.time_at_position(next_pos);
        (
            b.self_engine.link(),
            b.scheduler.clone(),
            b.hook.clone(),
            next_pos,
            next_time,
        )
    };
    match link {
        Some(MasterLink::Transport { inner: parent, adapter }) => {
            let _ = scheduler.reset_engine_time(&hook, f64::INFINITY);
            if let Some(parent) = parent.upgrade() {
                reset_adapter_position(&parent, adapter, next_pos);
            }
        }
        Some(MasterLink::PlayControl { inner: parent }) => {
            let _ = scheduler.reset_engine_time(&hook, f64::INFINITY);
            if let Some(parent) = parent.upgrade() {
                play_control::reset_child_position(&parent, next_pos);
            }
        }
        None => {
            let _ = scheduler.reset_engine_time(&hook, next_time);
        }
    }
}

/// A nested child changed its own schedule; re-key its adapter entry.
pub(crate) fn reset_adapter_position(rc: &Rc<RefCell<TransportInner>>, adapter_id: u64, local: f64) {
    let found = {
        let b = rc.borrow();
        b.slot_index(adapter_id).map(|idx| {
            let slot = &b.slots[idx];
            (slot.adapter.clone(), slot.start, slot.end, slot.offset)
        })
    };
    let Some((adapter, start, end, offset)) = found else {
        return;
    };
    // Skip while the adapter is mid-callback (its in-flight return value
    // re-keys it) or parked outside its window (the boundary entry stands).
    let active = matches!(adapter.try_borrow(), Ok(a) if a.is_active());
    if active {
        let global = (local + offset).max(start).min(end);
        rc.borrow_mut().queue.move_key(adapter_id, global);
    }
    reschedule_upstream(rc);
}

/// Advance one due adapter at `position`; returns the new head position.
fn advance_one(rc: &Rc<RefCell<TransportInner>>, time: f64, position: f64, speed: f64) -> f64 {
    let head = {
        let mut b = rc.borrow_mut();
        b.queue.head().and_then(|id| {
            b.slot_index(id)
                .map(|idx| (id, b.slots[idx].adapter.clone()))
        })
    };
    let Some((id, adapter)) = head else {
        let mut b = rc.borrow_mut();
        // Stale head with no slot: drop it.
        if let Some(id) = b.queue.head() {
            b.queue.remove(id);
        }
        return b.queue.time();
    };
    let next = adapter.borrow_mut().advance_position(time, position, speed);
    let mut b = rc.borrow_mut();
    b.queue.move_key(id, next);
    b.queue.time()
}

/// Run every adapter whose mapped time is due, in position order; returns
/// the next pending absolute time.
fn advance_transport(rc: &Rc<RefCell<TransportInner>>, time: f64) -> f64 {
    for _ in 0..MAX_ADVANCES_PER_TICK {
        let (position, speed, next_time) = {
            let mut b = rc.borrow_mut();
            if b.speed == 0.0 || b.queue.head().is_none() {
                return f64::INFINITY;
            }
            let position = b.queue.time();
            (position, b.speed, b.time_at_position(position))
        };
        if next_time > time {
            return next_time;
        }
        advance_one(rc, time, position, speed);
    }
    warn!("transport stuck advancing children at time {}, parking it", time);
    f64::INFINITY
}
