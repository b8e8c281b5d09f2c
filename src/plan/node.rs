//! Plan Nodes - the compiled, executable workflow tree
//!
//! Every declared step becomes exactly one `PlanNode`. Control-flow keys are
//! resolved once into `NodeKind`; the executor never looks at YAML again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::expr::Predicate;

/// One entry of an agent step's `from:` list, resolved at compile time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    /// Latest output of a step guaranteed to have run earlier
    Step(String),
    /// The run's initial prompt
    Prompt,
    /// Documented instructions of the agent behind `step`
    Instructions { step: String, agent: String },
    /// Passed through verbatim
    Literal(String),
}

#[derive(Debug, Clone)]
pub struct AgentNode {
    pub agent: String,
    pub from: Vec<InputRef>,
    pub context: Vec<String>,
    /// Steps re-emitted after this step's own output
    pub outputs: Vec<String>,
    /// Per-call timeout override
    pub timeout: Option<Duration>,
}

/// One guarded arm of a conditional (`if`/`then` or `case`/`when`)
#[derive(Debug, Clone)]
pub struct CondArm {
    pub predicate: Predicate,
    pub nodes: Vec<PlanNode>,
}

/// One concurrently executed subplan of a parallel node
///
/// Subplans are shared (`Arc`) so branch tasks can own them.
#[derive(Debug, Clone)]
pub struct Branch {
    pub name: String,
    pub nodes: Arc<[PlanNode]>,
    /// Absorbs this branch's failure without touching siblings
    pub handler: Option<Arc<[PlanNode]>>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Agent(AgentNode),
    /// First arm whose predicate holds runs; otherwise `fallback` (if any)
    Conditional {
        arms: Vec<CondArm>,
        fallback: Option<Vec<PlanNode>>,
    },
    Parallel {
        branches: Vec<Branch>,
    },
    Loop {
        body: Vec<PlanNode>,
        until: Predicate,
        max_iterations: u32,
    },
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub name: String,
    pub kind: NodeKind,
    /// Handler scoped to this node and everything nested in it
    pub handler: Option<Vec<PlanNode>>,
}

impl PlanNode {
    pub fn is_agent(&self) -> bool {
        matches!(self.kind, NodeKind::Agent(_))
    }

    /// Short label for logs and events
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Agent(_) => "agent",
            NodeKind::Conditional { .. } => "conditional",
            NodeKind::Parallel { .. } => "parallel",
            NodeKind::Loop { .. } => "loop",
        }
    }

    /// Number of nodes in this subtree, handlers included
    pub fn count(&self) -> usize {
        let children = match &self.kind {
            NodeKind::Agent(_) => 0,
            NodeKind::Conditional { arms, fallback } => {
                arms.iter().map(|a| count_all(&a.nodes)).sum::<usize>()
                    + fallback.as_deref().map_or(0, count_all)
            }
            NodeKind::Parallel { branches } => branches
                .iter()
                .map(|b| count_all(&b.nodes) + b.handler.as_deref().map_or(0, count_all))
                .sum(),
            NodeKind::Loop { body, .. } => count_all(body),
        };
        1 + children + self.handler.as_deref().map_or(0, count_all)
    }

    /// Depth-first visit of this node and all of its descendants
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a PlanNode)) {
        visit(self);
        match &self.kind {
            NodeKind::Agent(_) => {}
            NodeKind::Conditional { arms, fallback } => {
                for arm in arms {
                    walk_all(&arm.nodes, visit);
                }
                if let Some(nodes) = fallback {
                    walk_all(nodes, visit);
                }
            }
            NodeKind::Parallel { branches } => {
                for branch in branches {
                    walk_all(&branch.nodes, visit);
                    if let Some(nodes) = &branch.handler {
                        walk_all(nodes, visit);
                    }
                }
            }
            NodeKind::Loop { body, .. } => walk_all(body, visit),
        }
        if let Some(nodes) = &self.handler {
            walk_all(nodes, visit);
        }
    }
}

pub(crate) fn count_all(nodes: &[PlanNode]) -> usize {
    nodes.iter().map(PlanNode::count).sum()
}

pub(crate) fn walk_all<'a>(nodes: &'a [PlanNode], visit: &mut dyn FnMut(&'a PlanNode)) {
    for node in nodes {
        node.walk(visit);
    }
}

/// Recurrence attached to a compiled plan
#[derive(Debug, Clone)]
pub struct Trigger {
    pub cron: String,
    pub prompt: Option<String>,
    /// Stop firing once this holds on a run's final value
    pub exit: Option<Predicate>,
    pub max_runs: Option<u32>,
    /// Subplan run by later firings on the previous final value
    pub target: Option<Vec<PlanNode>>,
}

/// Compiled workflow, ready for the executor
#[derive(Debug, Clone)]
pub struct ExecutablePlan {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub agents: Vec<String>,
    pub prompt: String,
    pub nodes: Vec<PlanNode>,
    /// Workflow-scoped handler
    pub handler: Option<Vec<PlanNode>>,
    pub trigger: Option<Trigger>,
    /// xxh3 of the source workflow
    pub hash: String,
}

impl ExecutablePlan {
    /// Total number of plan nodes, handlers included
    pub fn node_count(&self) -> usize {
        count_all(&self.nodes) + self.handler.as_deref().map_or(0, count_all)
    }

    /// Find a node anywhere in the tree
    pub fn find(&self, name: &str) -> Option<&PlanNode> {
        let mut found = None;
        self.walk(&mut |node| {
            if found.is_none() && node.name == name {
                found = Some(node);
            }
        });
        found
    }

    /// Depth-first visit of every node, the workflow handler last
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a PlanNode)) {
        walk_all(&self.nodes, visit);
        if let Some(nodes) = &self.handler {
            walk_all(nodes, visit);
        }
    }
}
