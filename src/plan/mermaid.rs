//! Mermaid rendering of a compiled plan
//!
//! Two flavours, both plain text for an external renderer:
//! - `flowchart TD|LR`: one box per agent step, diamonds for conditionals
//!   and loop checks, dashed edges into exception handlers
//! - `sequenceDiagram`: the engine talking to each agent, with `alt`, `par`,
//!   `loop` and `break` blocks

use std::fmt::Write as _;
use std::str::FromStr;

use crate::error::MaestroError;

use super::expr::diagram_label;
use super::node::{ExecutablePlan, NodeKind, PlanNode};

/// Flowchart direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    TopDown,
    LeftRight,
}

impl Orientation {
    fn code(self) -> &'static str {
        match self {
            Self::TopDown => "TD",
            Self::LeftRight => "LR",
        }
    }
}

impl FromStr for Orientation {
    type Err = MaestroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TD" | "TB" => Ok(Self::TopDown),
            "LR" => Ok(Self::LeftRight),
            other => Err(MaestroError::Config {
                reason: format!("unknown diagram orientation '{}' (TD, LR)", other),
            }),
        }
    }
}

/// Which Mermaid diagram to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramKind {
    Flowchart(Orientation),
    Sequence,
}

impl Default for DiagramKind {
    fn default() -> Self {
        Self::Flowchart(Orientation::default())
    }
}

/// Render a plan as Mermaid source
pub fn render(plan: &ExecutablePlan, kind: DiagramKind) -> String {
    match kind {
        DiagramKind::Flowchart(orientation) => Flowchart::render(plan, orientation),
        DiagramKind::Sequence => render_sequence(plan),
    }
}

// ═══════════════════════════════════════════════════════════════
// Flowchart
// ═══════════════════════════════════════════════════════════════

/// A dangling edge waiting for the next node: (source id, edge label)
type Exit = (String, Option<String>);

struct Flowchart {
    out: String,
    next_id: usize,
}

impl Flowchart {
    fn render(plan: &ExecutablePlan, orientation: Orientation) -> String {
        let mut chart = Self {
            out: format!("flowchart {}\n", orientation.code()),
            next_id: 0,
        };
        chart.line("start([prompt])");

        let (_, exits) = chart.nodes(&plan.nodes, vec![("start".to_string(), None)]);
        chart.line("finish([response])");
        chart.connect(&exits, "finish");

        if let Some(handler) = &plan.handler {
            let exits = chart.handler("start", handler);
            chart.connect(&exits, "finish");
        }
        chart.out
    }

    fn id(&mut self) -> String {
        let id = format!("n{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "    {}", text);
    }

    fn connect(&mut self, from: &[Exit], to: &str) {
        for (source, label) in from {
            let edge = match label {
                Some(label) => format!("{} -->|{}| {}", source, escape(label), to),
                None => format!("{} --> {}", source, to),
            };
            self.line(&edge);
        }
    }

    /// Render a node list; returns the id of its first node and its exits
    fn nodes(&mut self, nodes: &[PlanNode], mut exits: Vec<Exit>) -> (Option<String>, Vec<Exit>) {
        let mut head = None;
        for node in nodes {
            let (id, next) = self.node(node, exits);
            head.get_or_insert(id);
            exits = next;
        }
        (head, exits)
    }

    fn node(&mut self, node: &PlanNode, entry: Vec<Exit>) -> (String, Vec<Exit>) {
        let (head, mut exits) = match &node.kind {
            NodeKind::Agent(agent) => {
                let id = self.id();
                self.line(&format!(
                    "{}[\"{}: {}\"]",
                    id,
                    escape(&node.name),
                    escape(&agent.agent)
                ));
                self.connect(&entry, &id);
                (id.clone(), vec![(id, None)])
            }
            NodeKind::Conditional { arms, fallback } => {
                let id = self.id();
                self.line(&format!("{}{{\"{}\"}}", id, escape(&node.name)));
                self.connect(&entry, &id);
                let mut exits = Vec::new();
                for arm in arms {
                    let label = diagram_label(&arm.predicate).into_owned();
                    exits.extend(self.nodes(&arm.nodes, vec![(id.clone(), Some(label))]).1);
                }
                let otherwise = Some("otherwise".to_string());
                match fallback {
                    Some(nodes) => exits.extend(self.nodes(nodes, vec![(id.clone(), otherwise)]).1),
                    None => exits.push((id.clone(), otherwise)),
                }
                (id, exits)
            }
            NodeKind::Parallel { branches } => {
                let fork = self.id();
                let join = self.id();
                self.line(&format!("{}[/\"{}\"\\]", fork, escape(&node.name)));
                self.connect(&entry, &fork);
                for branch in branches {
                    let group = self.id();
                    self.line(&format!("subgraph {} [\"{}\"]", group, escape(&branch.name)));
                    let (_, mut branch_exits) =
                        self.nodes(&branch.nodes, vec![(fork.clone(), None)]);
                    self.line("end");
                    if let Some(handler) = &branch.handler {
                        branch_exits.extend(self.handler(&group, handler));
                    }
                    self.connect(&branch_exits, &join);
                }
                self.line(&format!("{}[\\\"join\"/]", join));
                (fork, vec![(join, None)])
            }
            NodeKind::Loop {
                body,
                until,
                max_iterations,
            } => {
                let (first, body_exits) = self.nodes(body, entry);
                let check = self.id();
                self.line(&format!(
                    "{}{{\"{} (max {})\"}}",
                    check,
                    escape(&diagram_label(until)),
                    max_iterations
                ));
                self.connect(&body_exits, &check);
                let first = first.unwrap_or_else(|| check.clone());
                self.line(&format!("{} -->|no| {}", check, first));
                (first, vec![(check, Some("yes".to_string()))])
            }
        };

        if let Some(handler) = &node.handler {
            exits.extend(self.handler(&head, handler));
        }
        (head, exits)
    }

    /// Dashed error edge from `owner` into a handler subplan
    fn handler(&mut self, owner: &str, nodes: &[PlanNode]) -> Vec<Exit> {
        let entry = self.id();
        self.line(&format!("{}((exception))", entry));
        self.line(&format!("{} -.->|error| {}", owner, entry));
        self.nodes(nodes, vec![(entry, None)]).1
    }
}

fn escape(text: &str) -> String {
    text.replace('"', "'").replace('|', "/")
}

// ═══════════════════════════════════════════════════════════════
// Sequence diagram
// ═══════════════════════════════════════════════════════════════

fn render_sequence(plan: &ExecutablePlan) -> String {
    let mut out = String::from("sequenceDiagram\n");
    let _ = writeln!(out, "    participant Engine");
    for agent in &plan.agents {
        let _ = writeln!(out, "    participant {}", agent);
    }
    sequence_nodes(&mut out, &plan.nodes, 1);
    if let Some(handler) = &plan.handler {
        let _ = writeln!(out, "    break on error");
        sequence_nodes(&mut out, handler, 2);
        let _ = writeln!(out, "    end");
    }
    out
}

fn sequence_nodes(out: &mut String, nodes: &[PlanNode], depth: usize) {
    for node in nodes {
        sequence_node(out, node, depth);
    }
}

fn sequence_node(out: &mut String, node: &PlanNode, depth: usize) {
    let pad = "    ".repeat(depth);
    match &node.kind {
        NodeKind::Agent(agent) => {
            let _ = writeln!(out, "{}Engine->>{}: {}", pad, agent.agent, node.name);
            let _ = writeln!(out, "{}{}-->>Engine: output", pad, agent.agent);
        }
        NodeKind::Conditional { arms, fallback } => {
            for (i, arm) in arms.iter().enumerate() {
                let keyword = if i == 0 { "alt" } else { "else" };
                let _ = writeln!(out, "{}{} {}", pad, keyword, diagram_label(&arm.predicate));
                sequence_nodes(out, &arm.nodes, depth + 1);
            }
            if let Some(nodes) = fallback {
                let _ = writeln!(out, "{}else otherwise", pad);
                sequence_nodes(out, nodes, depth + 1);
            }
            let _ = writeln!(out, "{}end", pad);
        }
        NodeKind::Parallel { branches } => {
            for (i, branch) in branches.iter().enumerate() {
                let keyword = if i == 0 { "par" } else { "and" };
                let _ = writeln!(out, "{}{} {}", pad, keyword, branch.name);
                sequence_nodes(out, &branch.nodes, depth + 1);
            }
            let _ = writeln!(out, "{}end", pad);
        }
        NodeKind::Loop {
            body,
            until,
            max_iterations,
        } => {
            let _ = writeln!(
                out,
                "{}loop until {} (max {})",
                pad,
                diagram_label(until),
                max_iterations
            );
            sequence_nodes(out, body, depth + 1);
            let _ = writeln!(out, "{}end", pad);
        }
    }
    if let Some(handler) = &node.handler {
        let _ = writeln!(out, "{}break on error in {}", pad, node.name);
        sequence_nodes(out, handler, depth + 1);
        let _ = writeln!(out, "{}end", pad);
    }
}
