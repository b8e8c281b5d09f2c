//! Store Module - per-run state
//!
//! Append-only record of one run: step results in execution order,
//! the current value cursor and cumulative token usage.
//!
//! Key types:
//! - `ExecutionContext`: Ordered step results + cursor + usage counters
//! - `StepResult`: Output of one agent step
//! - `TokenUsage`: Prompt/response/total token counters

mod context;
mod result;

// Re-export all public types
pub use context::{ContextScope, ExecutionContext};
pub use result::{value_text, StepResult, TokenUsage};
