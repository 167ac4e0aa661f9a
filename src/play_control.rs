//! Single-child playback control
//!
//! [`PlayControl`] covers the common case of one main timeline with
//! play / pause / seek / loop / variable speed, without the multi-child
//! machinery of [`Transport`](crate::Transport). The child may have any
//! of the three engine capabilities; a Transport registered through
//! [`as_engine`](crate::Transport::as_engine) is the typical child.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, warn};

use crate::engine::next_id;
use crate::engine::{
    Advance, Engine, EngineError, EngineHandle, EngineKind, MasterLink, Scheduled, SpeedControlled,
    Transported,
};
use crate::loop_control::{LoopControl, Loopable};
use crate::scheduler::Scheduler;

/// Bound on child advances per sweep, matching the transport's cap.
const MAX_ADVANCES_PER_TICK: usize = 10_000;

#[derive(Clone)]
enum ControlledKind {
    Transported(Rc<RefCell<dyn Transported>>),
    SpeedControlled(Rc<RefCell<dyn SpeedControlled>>),
    /// The raw engine lives in the root scheduler, armed while playing.
    Scheduled,
}

#[derive(Clone)]
struct ControlledChild {
    engine: Engine,
    kind: ControlledKind,
}

pub(crate) struct PlayControlInner {
    id: u64,
    time: f64,
    position: f64,
    speed: f64,
    /// The user-selected rate applied by `start`, default 1.
    playing_speed: f64,
    scheduler: Scheduler,
    hook: Engine,
    child: Option<ControlledChild>,
    /// Pending position of a Transported child's next event.
    next_position: f64,
    loop_start: f64,
    loop_end: f64,
    looping: bool,
    loop_engine: Option<Engine>,
}

impl PlayControlInner {
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

    fn apply_loop(&self, position: f64) -> f64 {
        if self.looping
            && self.loop_start.is_finite()
            && self.loop_end.is_finite()
            && self.loop_end > self.loop_start
        {
            self.loop_start + (position - self.loop_start).rem_euclid(self.loop_end - self.loop_start)
        } else {
            position
        }
    }
}

/// Drives a Transported child's `advance_position` from the root
/// scheduler.
struct PlayControlHook {
    inner: Weak<RefCell<PlayControlInner>>,
}

impl Scheduled for PlayControlHook {
    fn advance_time(&mut self, time: f64) -> Advance {
        let Some(rc) = self.inner.upgrade() else {
            return Advance::Terminated;
        };
        for _ in 0..MAX_ADVANCES_PER_TICK {
            let step = {
                let b = rc.borrow();
                if b.speed == 0.0 {
                    return Advance::Dormant;
                }
                let next_time = b.time_at_position(b.next_position);
                if next_time > time {
                    return if next_time.is_finite() {
                        Advance::At(next_time)
                    } else {
                        Advance::Dormant
                    };
                }
                match &b.child {
                    Some(ControlledChild {
                        kind: ControlledKind::Transported(child),
                        ..
                    }) => (child.clone(), b.next_position, b.speed),
                    _ => return Advance::Dormant,
                }
            };
            let (child, position, speed) = step;
            let next = child.borrow_mut().advance_position(time, position, speed);
            rc.borrow_mut().next_position = next;
        }
        warn!("controlled child stuck advancing at time {}, parking it", time);
        rc.borrow_mut().next_position = f64::INFINITY;
        Advance::Dormant
    }
}

struct PlayControlLoopTarget {
    inner: Weak<RefCell<PlayControlInner>>,
}

impl Loopable for PlayControlLoopTarget {
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
            sync_speed(&rc, time, position, speed, true);
        }
    }
}

/// Playback handle over a single child engine.
#[derive(Clone)]
pub struct PlayControl {
    inner: Rc<RefCell<PlayControlInner>>,
}

impl PlayControl {
    pub fn new(scheduler: &Scheduler) -> Self {
        let id = next_id();
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<PlayControlInner>>| {
            let hook = EngineHandle::scheduled(Rc::new(RefCell::new(PlayControlHook {
                inner: weak.clone(),
            })));
            RefCell::new(PlayControlInner {
                id,
                time: 0.0,
                position: 0.0,
                speed: 0.0,
                playing_speed: 1.0,
                scheduler: scheduler.clone(),
                hook,
                child: None,
                next_position: f64::INFINITY,
                loop_start: 0.0,
                loop_end: f64::INFINITY,
                looping: false,
                loop_engine: None,
            })
        });
        scheduler.add(&inner.borrow().hook, f64::INFINITY).unwrap();
        Self { inner }
    }

    /// Install (or clear, with `None`) the controlled child. A previous
    /// child is stopped and released first; the new child keeps the
    /// current playback state.
    pub fn set(&self, engine: Option<&Engine>) -> Result<(), EngineError> {
        if let (Some(engine), Some(current)) = (engine, self.inner.borrow().child.as_ref()) {
            if engine.id() == current.engine.id() {
                return Ok(());
            }
        }
        let old = self.inner.borrow_mut().child.take();
        if let Some(old) = old {
            let time = self.current_time();
            let position = self.inner.borrow().position_at_time(time);
            match &old.kind {
                ControlledKind::Transported(child) => {
                    child.borrow_mut().sync_speed(time, position, 0.0, false);
                    old.engine.release();
                }
                ControlledKind::SpeedControlled(child) => {
                    child.borrow_mut().sync_speed(time, position, 0.0, false);
                    old.engine.release();
                }
                ControlledKind::Scheduled => {
                    let scheduler = self.inner.borrow().scheduler.clone();
                    let _ = scheduler.remove(&old.engine);
                }
            }
        }
        let Some(engine) = engine else {
            rearm_hook(&self.inner);
            return Ok(());
        };
        let kind = match engine.kind() {
            EngineKind::Transported(child) => {
                engine.claim(self.inner.borrow().id)?;
                engine.set_link(MasterLink::PlayControl {
                    inner: Rc::downgrade(&self.inner),
                });
                ControlledKind::Transported(child.clone())
            }
            EngineKind::SpeedControlled(child) => {
                engine.claim(self.inner.borrow().id)?;
                ControlledKind::SpeedControlled(child.clone())
            }
            EngineKind::Scheduled(_) => {
                let scheduler = self.inner.borrow().scheduler.clone();
                scheduler.add(engine, f64::INFINITY)?;
                ControlledKind::Scheduled
            }
        };
        self.inner.borrow_mut().child = Some(ControlledChild {
            engine: engine.clone(),
            kind,
        });
        let speed = self.inner.borrow().speed;
        if speed != 0.0 {
            // Playing: bring the new child in as a seek at the current spot.
            let time = self.current_time();
            let position = self.inner.borrow().position_at_time(time);
            sync_speed(&self.inner, time, position, speed, true);
        } else {
            rearm_hook(&self.inner);
        }
        Ok(())
    }

    pub fn current_time(&self) -> f64 {
        self.inner.borrow().scheduler.current_time()
    }

    pub fn current_position(&self) -> f64 {
        let time = self.current_time();
        self.inner.borrow().position_at_time(time)
    }

    /// The user playing speed; the timeline may still be paused.
    pub fn speed(&self) -> f64 {
        self.inner.borrow().playing_speed
    }

    pub fn running(&self) -> bool {
        self.inner.borrow().speed != 0.0
    }

    pub fn start(&self) {
        let time = self.current_time();
        let (position, speed) = {
            let b = self.inner.borrow();
            (b.position_at_time(time), b.playing_speed)
        };
        debug!("playback start at position {}", position);
        sync_speed(&self.inner, time, position, speed, false);
    }

    pub fn pause(&self) {
        let time = self.current_time();
        let position = self.inner.borrow().position_at_time(time);
        sync_speed(&self.inner, time, position, 0.0, false);
    }

    /// Pause and rewind to position 0. The rewind does not go through the
    /// loop wrap; `stop` always lands on 0 even when a loop region
    /// excludes it.
    pub fn stop(&self) {
        self.pause();
        let time = self.current_time();
        sync_speed(&self.inner, time, 0.0, 0.0, true);
    }

    /// Reposition, wrapping through the loop when enabled. Works while
    /// paused as well, without starting playback.
    pub fn seek(&self, position: f64) {
        let time = self.current_time();
        let (wrapped, speed) = {
            let b = self.inner.borrow();
            (b.apply_loop(position), b.speed)
        };
        sync_speed(&self.inner, time, wrapped, speed, true);
    }

    /// Set the playing speed, clamped into `[0.01, 100]` in magnitude with
    /// the sign preserved; applied immediately when playing.
    pub fn set_speed(&self, speed: f64) {
        let magnitude = speed.abs().clamp(0.01, 100.0);
        let clamped = if speed < 0.0 { -magnitude } else { magnitude };
        let running = {
            let mut b = self.inner.borrow_mut();
            b.playing_speed = clamped;
            b.speed != 0.0
        };
        if running {
            let time = self.current_time();
            let position = self.inner.borrow().position_at_time(time);
            sync_speed(&self.inner, time, position, clamped, false);
        }
    }

    pub fn loop_start(&self) -> f64 {
        self.inner.borrow().loop_start
    }

    pub fn loop_end(&self) -> f64 {
        self.inner.borrow().loop_end
    }

    pub fn set_loop_boundaries(&self, start: f64, end: f64) {
        {
            let mut b = self.inner.borrow_mut();
            b.loop_start = start;
            b.loop_end = end;
        }
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
                Box::new(PlayControlLoopTarget {
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
            let (engine, scheduler) = {
                let mut b = self.inner.borrow_mut();
                b.looping = false;
                (b.loop_engine.take(), b.scheduler.clone())
            };
            if let Some(engine) = engine {
                let _ = scheduler.remove(&engine);
            }
        }
    }

    /// Wrap a position into `[loop_start, loop_end)` when looping.
    pub fn apply_loop_boundaries(&self, position: f64) -> f64 {
        self.inner.borrow().apply_loop(position)
    }
}

/// Re-anchor the triple and propagate the change to the child. No-op when
/// nothing changed and `seek` is false.
pub(crate) fn sync_speed(
    rc: &Rc<RefCell<PlayControlInner>>,
    time: f64,
    position: f64,
    speed: f64,
    seek: bool,
) {
    let (last, child) = {
        let mut b = rc.borrow_mut();
        let last = b.speed;
        if speed == last && !seek {
            return;
        }
        b.time = time;
        b.position = position;
        b.speed = speed;
        (last, b.child.clone())
    };
    if let Some(child) = child {
        match &child.kind {
            ControlledKind::Transported(c) => {
                if speed == 0.0 {
                    c.borrow_mut().sync_speed(time, position, 0.0, seek);
                } else if seek || speed * last < 0.0 || last == 0.0 {
                    let next = c.borrow_mut().sync_position(time, position, speed);
                    rc.borrow_mut().next_position = next;
                } else {
                    c.borrow_mut().sync_speed(time, position, speed, false);
                }
            }
            ControlledKind::SpeedControlled(c) => {
                c.borrow_mut().sync_speed(time, position, speed, seek);
            }
            ControlledKind::Scheduled => {
                let scheduler = rc.borrow().scheduler.clone();
                if speed != 0.0 && (last == 0.0 || seek) {
                    let _ = scheduler.reset_engine_time(&child.engine, time);
                } else if speed == 0.0 && last != 0.0 {
                    let _ = scheduler.reset_engine_time(&child.engine, f64::INFINITY);
                }
            }
        }
    }
    rearm_loop(rc);
    rearm_hook(rc);
}

/// A nested child changed its own schedule; re-key the driving hook.
pub(crate) fn reset_child_position(rc: &Rc<RefCell<PlayControlInner>>, position: f64) {
    {
        let mut b = rc.borrow_mut();
        b.next_position = position;
    }
    rearm_hook(rc);
}

fn rearm_hook(rc: &Rc<RefCell<PlayControlInner>>) {
    let (scheduler, hook, wake) = {
        let b = rc.borrow();
        let transported = matches!(
            &b.child,
            Some(ControlledChild {
                kind: ControlledKind::Transported(_),
                ..
            })
        );
        let wake = if transported && b.speed != 0.0 {
            b.time_at_position(b.next_position)
        } else {
            f64::INFINITY
        };
        (b.scheduler.clone(), b.hook.clone(), wake)
    };
    let _ = scheduler.reset_engine_time(&hook, wake);
}

fn rearm_loop(rc: &Rc<RefCell<PlayControlInner>>) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    struct RateLog {
        calls: Rc<RefCell<Vec<(f64, f64, f64, bool)>>>,
    }

    impl SpeedControlled for RateLog {
        fn sync_speed(&mut self, time: f64, position: f64, speed: f64, seek: bool) {
            self.calls.borrow_mut().push((time, position, speed, seek));
        }
    }

    fn fixture() -> (Rc<ManualClock>, Scheduler, PlayControl) {
        let clock = Rc::new(ManualClock::new());
        let scheduler = Scheduler::new(clock.clone() as Rc<dyn Clock>);
        let control = PlayControl::new(&scheduler);
        (clock, scheduler, control)
    }

    fn rate_log() -> (Engine, Rc<RefCell<Vec<(f64, f64, f64, bool)>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let engine = EngineHandle::speed_controlled(Rc::new(RefCell::new(RateLog {
            calls: calls.clone(),
        })));
        (engine, calls)
    }

    #[test]
    fn test_start_and_pause_forward_speed() {
        let (_clock, _scheduler, control) = fixture();
        let (engine, calls) = rate_log();
        control.set(Some(&engine)).unwrap();

        control.start();
        assert!(control.running());
        control.pause();
        assert!(!control.running());

        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2, 1.0);
        assert_eq!(calls[1].2, 0.0);
    }

    #[test]
    fn test_set_swaps_and_stops_previous_child() {
        let (_clock, _scheduler, control) = fixture();
        let (first, first_calls) = rate_log();
        let (second, _) = rate_log();
        control.set(Some(&first)).unwrap();
        control.start();

        control.set(Some(&second)).unwrap();
        // Old child got a final stop and was released
        assert_eq!(first_calls.borrow().last().map(|c| c.2), Some(0.0));
        assert!(first.master().is_none());
        assert!(second.master().is_some());
    }

    #[test]
    fn test_one_master_invariant() {
        let (_clock, scheduler, control) = fixture();
        let other = PlayControl::new(&scheduler);
        let (engine, _) = rate_log();
        control.set(Some(&engine)).unwrap();
        assert!(matches!(
            other.set(Some(&engine)),
            Err(EngineError::AlreadyOwned)
        ));
        control.set(None).unwrap();
        other.set(Some(&engine)).unwrap();
    }

    #[test]
    fn test_speed_clamping() {
        let (_clock, _scheduler, control) = fixture();
        control.set_speed(0.0001);
        assert_eq!(control.speed(), 0.01);
        control.set_speed(1000.0);
        assert_eq!(control.speed(), 100.0);
        control.set_speed(-0.5);
        assert_eq!(control.speed(), -0.5);
        control.set_speed(-1e9);
        assert_eq!(control.speed(), -100.0);
    }

    #[test]
    fn test_seek_while_paused_repositions_without_starting() {
        let (_clock, _scheduler, control) = fixture();
        let (engine, calls) = rate_log();
        control.set(Some(&engine)).unwrap();

        control.seek(12.5);
        assert!(!control.running());
        assert_eq!(control.current_position(), 12.5);
        // The paused child saw the seek at speed 0
        assert_eq!(calls.borrow().last().map(|c| (c.2, c.3)), Some((0.0, true)));
    }

    #[test]
    fn test_stop_rewinds_to_zero() {
        let (clock, _scheduler, control) = fixture();
        let (engine, _) = rate_log();
        control.set(Some(&engine)).unwrap();
        control.start();
        clock.advance(2.0);
        assert!(control.current_position() > 0.0);
        control.stop();
        assert!(!control.running());
        assert_eq!(control.current_position(), 0.0);
    }

    #[test]
    fn test_stop_ignores_loop_region() {
        let (clock, _scheduler, control) = fixture();
        let (engine, _) = rate_log();
        control.set(Some(&engine)).unwrap();
        control.set_loop_boundaries(2.0, 4.0);
        control.set_loop(true);

        control.start();
        clock.advance(1.0);
        control.stop();
        assert!(!control.running());
        // Rewinds to 0 even though the loop region excludes it
        assert_eq!(control.current_position(), 0.0);

        // Plain seeks still wrap through the region
        control.seek(5.0);
        assert_eq!(control.current_position(), 3.0);
    }

    #[test]
    fn test_apply_loop_boundaries_wraps_half_open() {
        let (_clock, _scheduler, control) = fixture();
        control.set_loop_boundaries(0.0, 4.0);
        control.set_loop(true);
        assert!(control.is_looping());

        assert_eq!(control.apply_loop_boundaries(3.5), 3.5);
        // The end boundary maps to the start, not to itself
        assert_eq!(control.apply_loop_boundaries(4.0), 0.0);
        assert_eq!(control.apply_loop_boundaries(5.0), 1.0);
        assert_eq!(control.apply_loop_boundaries(-1.0), 3.0);

        control.set_loop(false);
        assert_eq!(control.apply_loop_boundaries(5.0), 5.0);
    }

    #[test]
    fn test_loop_requires_finite_boundaries() {
        let (_clock, _scheduler, control) = fixture();
        control.set_loop(true);
        assert!(!control.is_looping());
        control.set_loop_boundaries(2.0, 1.0);
        control.set_loop(true);
        assert!(!control.is_looping());
    }
}
