//! Scheduler engine: durable tasks, interchangeable timer drivers, and
//! per-task dispatch to handlers.
//!
//! The task store is the source of truth; timers are a rebuildable cache
//! reconstructed from it on startup.

pub mod dispatch;
pub mod engine;
pub mod timer;

pub use engine::SchedulerEngine;
pub use timer::{PollingTimerDriver, TimerDriver, TokioTimerDriver};
