//! Time engine capability interfaces
//!
//! An engine participates in scheduling through exactly one of three
//! capability traits:
//! - [`Scheduled`]: periodic self-advancing against absolute time
//! - [`Transported`]: addressable by logical position on a timeline
//! - [`SpeedControlled`]: driven by continuous playback-rate changes
//!
//! User engines are wrapped in an [`EngineHandle`] before registration,
//! which carries identity and the single-master ownership claim.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::play_control::PlayControlInner;
use crate::transport::TransportInner;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a process-unique id for engines and masters.
pub(crate) fn next_id() -> u64 {
    ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Errors raised by the mutating registration APIs.
///
/// These are precondition violations (integration bugs), surfaced
/// synchronously at the call site. Degenerate numeric states such as
/// time/position conversion at speed 0 are signalled with `f64::INFINITY`
/// sentinels instead, never through this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine is already registered with a master.
    #[error("engine already has a master")]
    AlreadyOwned,
    /// The engine does not implement the capability required by the master.
    #[error("engine does not implement the {0} interface")]
    MissingCapability(&'static str),
    /// The engine was never registered with this master.
    #[error("engine is not registered with this master")]
    NotRegistered,
}

/// Result of a [`Scheduled`] advance step.
///
/// Replaces the overloaded "falsy vs. Infinity" return protocol with an
/// explicit tagged value: dormant engines stay registered and can be
/// re-armed with `reset_engine_time`, terminated engines lose their master.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    /// Invoke me again at this absolute time.
    At(f64),
    /// Keep me registered but unscheduled.
    Dormant,
    /// Deregister me permanently.
    Terminated,
}

/// Periodic self-advancing engine.
pub trait Scheduled {
    /// Called with the master's current time; performs the deferred
    /// action(s) and reports when to be invoked next.
    fn advance_time(&mut self, time: f64) -> Advance;
}

/// Position-addressable engine.
///
/// Both methods return the next position (global to the caller's timeline)
/// at which the engine needs to act; ± infinity in the direction of travel
/// deschedules it.
pub trait Transported {
    /// Called on (re)synchronization events: start, seek, direction
    /// reversal. Must reposition the engine to align with the given
    /// position and speed.
    fn sync_position(&mut self, time: f64, position: f64, speed: f64) -> f64;

    /// Called when the timeline reaches the previously returned position;
    /// performs the engine's action.
    fn advance_position(&mut self, time: f64, position: f64, speed: f64) -> f64;

    /// Optional speed awareness; transported engines that also react to
    /// rate changes (nested transports do) override this.
    fn sync_speed(&mut self, _time: f64, _position: f64, _speed: f64, _seek: bool) {}
}

/// Continuous-rate driven engine.
pub trait SpeedControlled {
    /// Called whenever playback speed changes, including the 0 transitions
    /// that represent stop and start, and on seeks (`seek == true`).
    fn sync_speed(&mut self, time: f64, position: f64, speed: f64, seek: bool);
}

/// The capability a handle was constructed with.
pub(crate) enum EngineKind {
    Scheduled(Rc<RefCell<dyn Scheduled>>),
    Transported(Rc<RefCell<dyn Transported>>),
    SpeedControlled(Rc<RefCell<dyn SpeedControlled>>),
}

/// Upward route from an engine to the master that owns it, used by nested
/// transports to request repositioning through their parent adapter.
#[derive(Clone)]
pub(crate) enum MasterLink {
    Transport {
        inner: Weak<RefCell<TransportInner>>,
        adapter: u64,
    },
    PlayControl {
        inner: Weak<RefCell<PlayControlInner>>,
    },
}

/// Registration unit: identity plus the single-master ownership claim.
pub struct EngineHandle {
    id: u64,
    kind: EngineKind,
    master: Cell<Option<u64>>,
    link: RefCell<Option<MasterLink>>,
}

/// Shared handle to a registered (or registrable) engine.
pub type Engine = Rc<EngineHandle>;

impl EngineHandle {
    fn with_kind(kind: EngineKind) -> Engine {
        Rc::new(EngineHandle {
            id: next_id(),
            kind,
            master: Cell::new(None),
            link: RefCell::new(None),
        })
    }

    /// Wrap a scheduled engine.
    pub fn scheduled(engine: Rc<RefCell<dyn Scheduled>>) -> Engine {
        Self::with_kind(EngineKind::Scheduled(engine))
    }

    /// Wrap a transported engine.
    pub fn transported(engine: Rc<RefCell<dyn Transported>>) -> Engine {
        Self::with_kind(EngineKind::Transported(engine))
    }

    /// Wrap a speed-controlled engine.
    pub fn speed_controlled(engine: Rc<RefCell<dyn SpeedControlled>>) -> Engine {
        Self::with_kind(EngineKind::SpeedControlled(engine))
    }

    /// Unique id of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the owning master, if any.
    pub fn master(&self) -> Option<u64> {
        self.master.get()
    }

    /// Whether this handle wraps a [`Scheduled`] engine.
    pub fn is_scheduled(&self) -> bool {
        matches!(self.kind, EngineKind::Scheduled(_))
    }

    /// Whether this handle wraps a [`Transported`] engine.
    pub fn is_transported(&self) -> bool {
        matches!(self.kind, EngineKind::Transported(_))
    }

    /// Whether this handle wraps a [`SpeedControlled`] engine.
    pub fn is_speed_controlled(&self) -> bool {
        matches!(self.kind, EngineKind::SpeedControlled(_))
    }

    pub(crate) fn kind(&self) -> &EngineKind {
        &self.kind
    }

    /// Claim this engine for the given master.
    pub(crate) fn claim(&self, master: u64) -> Result<(), EngineError> {
        if self.master.get().is_some() {
            return Err(EngineError::AlreadyOwned);
        }
        self.master.set(Some(master));
        Ok(())
    }

    /// Release the master claim. Idempotent.
    pub(crate) fn release(&self) {
        self.master.set(None);
        self.link.borrow_mut().take();
    }

    pub(crate) fn set_link(&self, link: MasterLink) {
        *self.link.borrow_mut() = Some(link);
    }

    pub(crate) fn link(&self) -> Option<MasterLink> {
        self.link.borrow().clone()
    }

    /// Invoke the wrapped engine's scheduled advance step.
    /// Must only be called on handles validated as scheduled.
    pub(crate) fn advance_scheduled(&self, time: f64) -> Advance {
        match &self.kind {
            EngineKind::Scheduled(engine) => engine.borrow_mut().advance_time(time),
            _ => {
                debug_assert!(false, "advance_scheduled on a non-scheduled engine");
                Advance::Dormant
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Scheduled for Nop {
        fn advance_time(&mut self, _time: f64) -> Advance {
            Advance::Dormant
        }
    }

    #[test]
    fn test_claim_release() {
        let engine = EngineHandle::scheduled(Rc::new(RefCell::new(Nop)));
        assert_eq!(engine.master(), None);

        assert!(engine.claim(7).is_ok());
        assert_eq!(engine.master(), Some(7));

        // Second claim fails, even for the same master
        assert_eq!(engine.claim(7), Err(EngineError::AlreadyOwned));
        assert_eq!(engine.claim(8), Err(EngineError::AlreadyOwned));

        engine.release();
        assert_eq!(engine.master(), None);
        assert!(engine.claim(8).is_ok());
    }

    #[test]
    fn test_unique_ids() {
        let a = EngineHandle::scheduled(Rc::new(RefCell::new(Nop)));
        let b = EngineHandle::scheduled(Rc::new(RefCell::new(Nop)));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_capability_flags() {
        let e = EngineHandle::scheduled(Rc::new(RefCell::new(Nop)));
        assert!(e.is_scheduled());
        assert!(!e.is_transported());
        assert!(!e.is_speed_controlled());
    }
}
