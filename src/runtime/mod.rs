//! Runtime Module - plan execution
//!
//! Contains the runtime execution components:
//! - `executor`: Walks plan nodes (agent, conditional, parallel, loop, handlers)
//! - `runner`: Run lifecycle, state machine and terminal events
//! - `scheduler`: Cron-driven repeated runs
//!
//! This module represents the "how" - runtime execution.
//! For static structure, see the `ast` and `plan` modules.

mod executor;
mod runner;
mod scheduler;

pub use executor::{Fault, StepExecutor};
pub use runner::{RunHandle, RunOutcome, RunState, Runner};
pub use scheduler::{ScheduleSummary, Scheduler, StopReason};
