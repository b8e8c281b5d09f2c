//! Event Module - audit trail and live projection of a run
//!
//! - `EventLog`: append-only audit log (every decision the executor makes)
//! - `Projector`: caller-facing `StreamRecord`s and the `FinalResponse`

mod log;
mod stream;

pub use log::{Event, EventKind, EventLog};
pub use stream::{FinalResponse, Projector, StreamEvent, StreamRecord};
