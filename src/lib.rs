//! Maestro - declarative multi-agent workflow engine
//!
//! A workflow document describes how a set of externally supplied agents
//! cooperate: sequential chains, conditionals, parallel branches, bounded
//! loops and exception handlers. Maestro compiles the document once into an
//! immutable plan, then executes it any number of times.
//!
//! ```text
//! YAML ──► ast::WorkflowSpec ──► plan::compile ──► ExecutablePlan
//!                                                      │
//!              AgentRegistry ──► runtime::Runner ◄─────┘
//!                                     │
//!                 event::StreamRecord ◄┴► runtime::RunOutcome
//! ```
//!
//! Module layout:
//! - `ast`: YAML documents (`WorkflowSpec`, `StepSpec`, `AgentDoc`)
//! - `plan`: plan compiler, predicate expressions, Mermaid rendering
//! - `store`: per-run `ExecutionContext` and `StepResult`
//! - `agent`: `Agent` trait, `AgentRegistry`, `MockAgent`
//! - `runtime`: `StepExecutor`, `Runner`, `Scheduler`
//! - `event`: `EventLog` audit trail and the streaming projector

pub mod agent;
pub mod ast;
pub mod config;
pub mod error;
pub mod event;
pub mod plan;
pub mod runtime;
pub mod store;
pub mod util;

pub use agent::{Agent, AgentOutput, AgentRegistry, AgentRequest, MockAgent};
pub use ast::WorkflowSpec;
pub use config::EngineConfig;
pub use error::{FixSuggestion, MaestroError, Result};
pub use event::{EventLog, FinalResponse, StreamEvent, StreamRecord};
pub use plan::{compile, ExecutablePlan};
pub use runtime::{RunHandle, RunOutcome, RunState, Runner, Scheduler};
pub use store::{ExecutionContext, StepResult, TokenUsage};
