//! Plan Module - compiled workflow representation
//!
//! - `compile`: `WorkflowSpec` → `ExecutablePlan` (all static validation)
//! - `node`: the closed `PlanNode` tree the executor walks
//! - `expr`: predicate language for `if`, `case`, `until` and `event.exit`
//! - `mermaid`: diagram rendering of a compiled plan
//!
//! A plan is immutable after compilation.

mod compile;
mod expr;
mod mermaid;
mod node;

pub use compile::compile;
pub use expr::{diagram_label, truthy, CmpOp, Expr, ExprScope, Predicate};
pub use mermaid::{render, DiagramKind, Orientation};
pub use node::{AgentNode, Branch, CondArm, ExecutablePlan, InputRef, NodeKind, PlanNode, Trigger};
pub(crate) use node::count_all;
