//! Loop wrap shim
//!
//! [`LoopControl`] is a small [`Scheduled`] engine registered with the root
//! scheduler on behalf of a looping timeline. It wakes at the mapped time
//! of the loop boundary ahead in the travel direction and seeks the
//! timeline back to the opposite boundary.

use crate::engine::{Advance, Scheduled};

/// A timeline that can loop: Transport and PlayControl both qualify.
pub(crate) trait Loopable {
    fn speed(&self) -> f64;
    fn loop_start(&self) -> f64;
    fn loop_end(&self) -> f64;
    fn time_at_position(&self, position: f64) -> f64;
    /// Re-enter at the wrapped boundary, as a seek.
    fn loop_seek(&mut self, time: f64, position: f64);
}

pub(crate) struct LoopControl {
    target: Box<dyn Loopable>,
}

impl LoopControl {
    pub(crate) fn new(target: Box<dyn Loopable>) -> Self {
        Self { target }
    }

    /// Absolute time of the next wrap, `INFINITY` while the target is
    /// stopped.
    pub(crate) fn wake_time(target: &dyn Loopable) -> f64 {
        let speed = target.speed();
        if speed > 0.0 {
            target.time_at_position(target.loop_end())
        } else if speed < 0.0 {
            target.time_at_position(target.loop_start())
        } else {
            f64::INFINITY
        }
    }
}

impl Scheduled for LoopControl {
    fn advance_time(&mut self, time: f64) -> Advance {
        let speed = self.target.speed();
        if speed > 0.0 {
            self.target.loop_seek(time, self.target.loop_start());
        } else if speed < 0.0 {
            self.target.loop_seek(time, self.target.loop_end());
        } else {
            return Advance::Dormant;
        }
        let next = Self::wake_time(self.target.as_ref());
        if next.is_finite() && next > time {
            Advance::At(next)
        } else {
            Advance::Dormant
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Timeline {
        time: f64,
        position: f64,
        speed: f64,
        start: f64,
        end: f64,
        seeks: Vec<(f64, f64)>,
    }

    impl Loopable for Rc<RefCell<Timeline>> {
        fn speed(&self) -> f64 {
            self.borrow().speed
        }
        fn loop_start(&self) -> f64 {
            self.borrow().start
        }
        fn loop_end(&self) -> f64 {
            self.borrow().end
        }
        fn time_at_position(&self, position: f64) -> f64 {
            let t = self.borrow();
            if t.speed == 0.0 {
                f64::INFINITY
            } else {
                t.time + (position - t.position) / t.speed
            }
        }
        fn loop_seek(&mut self, time: f64, position: f64) {
            let mut t = self.borrow_mut();
            t.time = time;
            t.position = position;
            t.seeks.push((time, position));
        }
    }

    #[test]
    fn test_forward_wrap_seeks_to_start() {
        let timeline = Rc::new(RefCell::new(Timeline {
            time: 0.0,
            position: 3.0,
            speed: 1.0,
            start: 0.0,
            end: 4.0,
            seeks: Vec::new(),
        }));
        let mut control = LoopControl::new(Box::new(timeline.clone()));

        assert_eq!(LoopControl::wake_time(&timeline), 1.0);
        let result = control.advance_time(1.0);
        assert_eq!(timeline.borrow().seeks, vec![(1.0, 0.0)]);
        // Next wrap one full loop later
        assert!(matches!(result, Advance::At(t) if (t - 5.0).abs() < 1e-12));
    }

    #[test]
    fn test_reverse_wrap_seeks_to_end() {
        let timeline = Rc::new(RefCell::new(Timeline {
            time: 0.0,
            position: 1.0,
            speed: -1.0,
            start: 0.0,
            end: 4.0,
            seeks: Vec::new(),
        }));
        let mut control = LoopControl::new(Box::new(timeline.clone()));

        assert_eq!(LoopControl::wake_time(&timeline), 1.0);
        let result = control.advance_time(1.0);
        assert_eq!(timeline.borrow().seeks, vec![(1.0, 4.0)]);
        assert!(matches!(result, Advance::At(t) if (t - 5.0).abs() < 1e-12));
    }

    #[test]
    fn test_stopped_target_goes_dormant() {
        let timeline = Rc::new(RefCell::new(Timeline {
            time: 0.0,
            position: 0.0,
            speed: 0.0,
            start: 0.0,
            end: 4.0,
            seeks: Vec::new(),
        }));
        assert_eq!(LoopControl::wake_time(&timeline), f64::INFINITY);
        let mut control = LoopControl::new(Box::new(timeline.clone()));
        assert!(matches!(control.advance_time(1.0), Advance::Dormant));
        assert!(timeline.borrow().seeks.is_empty());
    }
}
