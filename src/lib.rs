//! Playhead Timing Engine
//!
//! A transport and lookahead-scheduling toolkit for interactive audio
//! timelines:
//! - Lookahead scheduling (engines run at exact logical times, computed
//!   ahead of a polled clock)
//! - A position timeline (`Transport`) driving position-, rate-, and
//!   time-capability children, with nesting, windows, and looping
//! - Single-child playback control (`PlayControl`): play / pause / seek /
//!   loop / variable speed
//! - Dual execution modes: realtime (spin_sleep driver) and offline
//!   (stepping API)

pub mod clock;
pub mod engine;
pub mod play_control;
pub mod pq;
pub mod runner;
pub mod scheduler;
pub mod scheduling;
pub mod transport;

mod loop_control;


pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Advance, Engine, EngineError, EngineHandle, Scheduled, SpeedControlled, Transported};
pub use play_control::PlayControl;
pub use pq::PriorityQueue;
pub use runner::{OfflineRunner, Runner};
pub use scheduler::{get_scheduler, get_simple_scheduler, Scheduler, SimpleScheduler};
pub use scheduling::SchedulingQueue;
pub use transport::Transport;
