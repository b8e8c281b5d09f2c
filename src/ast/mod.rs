//! AST Module - Abstract Syntax Tree for YAML workflow documents
//!
//! Contains parsed Rust types from declarative documents:
//! - `workflow`: WorkflowDoc, WorkflowSpec, ExceptionSpec, EventSpec
//! - `step`: StepSpec, StepKind, CaseArm, BranchSpec, LoopSpec
//! - `agent`: AgentDoc (agent definitions, used by dry runs)
//!
//! These types represent the "what" - static structure parsed from YAML.
//! Control-flow keys stay loosely typed here; the `plan` module resolves
//! them once into a closed `PlanNode` tree.

mod agent;
mod step;
mod workflow;

// Re-export all public types
pub use agent::{parse_agent_docs, AgentDoc, AgentDocSpec};
pub use step::{BranchSpec, CaseArm, LoopSpec, StepKind, StepSpec};
pub use workflow::{EventSpec, ExceptionSpec, Metadata, WorkflowDoc, WorkflowSpec};
