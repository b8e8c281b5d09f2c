//! Plan Compiler - `WorkflowSpec` → `ExecutablePlan`
//!
//! Pure transformation, no I/O. Either the whole tree compiles or no plan is
//! produced. Checks, in order:
//! - structural: exactly one control-flow kind per step, non-empty subplans
//! - names: unique across the whole tree (handlers and shorthands included)
//! - agents: every referenced agent is declared in `agents`
//! - expressions: predicates parse, `matches` patterns compile
//! - routing: `from`, `outputs` and `steps.NAME` only read steps that ran
//!   earlier on every path
//!
//! "Ran earlier on every path" is tracked as a set of guaranteed step names
//! threaded through the walk:
//! - a sequential agent step adds itself
//! - a conditional adds nothing (no arm is certain to run)
//! - a loop adds its body (the body runs at least once)
//! - a parallel node adds every branch, except branches owning a handler
//! - a node owning a handler adds nothing (it may have stopped half way)
//! - branches start from the fan-out scope and never see their siblings
//! - the workflow handler starts from an empty scope

use std::borrow::Cow;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::ast::{BranchSpec, EventSpec, LoopSpec, StepKind, StepSpec, WorkflowSpec};
use crate::config::EngineConfig;
use crate::error::{MaestroError, Result};
use crate::util::{INSTRUCTIONS_PREFIX, PROMPT_KEYWORD};

use super::expr::Predicate;
use super::node::{
    AgentNode, Branch, CondArm, ExecutablePlan, InputRef, NodeKind, PlanNode, Trigger,
};

/// Pseudo step name used in errors about the `event:` block
const EVENT_SCOPE: &str = "event";

/// Pseudo step name used in errors about the workflow `exception:` block
const EXCEPTION_SCOPE: &str = "exception";

type Scope = FxHashSet<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Declared {
    /// Agent step, with the agent it calls
    Agent(String),
    Control,
}

/// Compile a workflow into an executable plan
pub fn compile(spec: &WorkflowSpec, config: &EngineConfig) -> Result<ExecutablePlan> {
    if spec.steps.is_empty() {
        return Err(MaestroError::EmptyWorkflow);
    }

    let handler_steps = match &spec.exception {
        Some(exception) => {
            let steps = exception.handler_steps();
            if steps.is_empty() {
                return Err(invalid(EXCEPTION_SCOPE, "handler has no steps"));
            }
            Some(steps)
        }
        None => None,
    };

    let mut compiler = Compiler {
        agents: spec.agents.iter().map(String::as_str).collect(),
        declared: FxHashMap::default(),
        max_iterations: config.max_iterations,
        ceiling: config.max_iterations_ceiling,
    };

    // Declaration pass: the whole tree, so routing can tell a forward
    // reference apart from a literal string.
    compiler.declare_all(&spec.steps)?;
    if let Some(steps) = &handler_steps {
        compiler.declare_all(steps)?;
    }
    let target_steps = match &spec.event {
        Some(event) if event.has_target() => firing_target(event, &spec.steps)?,
        _ => Vec::new(),
    };
    // Only the `agent` shorthand is new; named steps are declared already
    if spec.event.as_ref().is_some_and(|e| e.agent.is_some()) {
        compiler.declare_all(&target_steps[..1])?;
    }

    let mut scope = Scope::default();
    let nodes = compiler.compile_steps(&spec.steps, &mut scope)?;

    let handler = match &handler_steps {
        Some(steps) => Some(compiler.compile_steps(steps, &mut Scope::default())?),
        None => None,
    };

    let trigger = match &spec.event {
        Some(event) => {
            if event.cron.trim().is_empty() {
                return Err(invalid(EVENT_SCOPE, "cron expression is empty"));
            }
            if event.max_runs == Some(0) {
                return Err(invalid(EVENT_SCOPE, "max_runs must be at least 1"));
            }
            let exit = match &event.exit {
                Some(source) => Some(compiler.predicate(EVENT_SCOPE, source, &scope)?),
                None => None,
            };
            // A firing target starts from nothing but the previous final value
            let target = if target_steps.is_empty() {
                None
            } else {
                Some(compiler.compile_steps(&target_steps, &mut Scope::default())?)
            };
            Some(Trigger {
                cron: event.cron.clone(),
                prompt: event.prompt.clone(),
                exit,
                max_runs: event.max_runs,
                target,
            })
        }
        None => None,
    };

    let plan = ExecutablePlan {
        name: spec.name.clone(),
        labels: spec.labels.clone(),
        agents: spec.agents.clone(),
        prompt: spec.prompt.clone(),
        nodes,
        handler,
        trigger,
        hash: spec.compute_hash(),
    };
    debug!(
        workflow = %plan.name,
        nodes = plan.node_count(),
        hash = %plan.hash,
        "plan compiled"
    );
    Ok(plan)
}

struct Compiler<'a> {
    agents: FxHashSet<&'a str>,
    declared: FxHashMap<String, Declared>,
    max_iterations: u32,
    ceiling: u32,
}

impl Compiler<'_> {
    // ─────────────────────────────────────────────────────────────
    // Declaration pass
    // ─────────────────────────────────────────────────────────────

    fn declare_all(&mut self, steps: &[StepSpec]) -> Result<()> {
        steps.iter().try_for_each(|step| self.declare(step))
    }

    fn declare(&mut self, step: &StepSpec) -> Result<()> {
        let kind = step.kind()?;
        self.declare_name(
            &step.name,
            match kind {
                StepKind::Agent(agent) => Declared::Agent(agent.to_string()),
                _ => Declared::Control,
            },
        )?;

        match kind {
            StepKind::Agent(_) => {}
            StepKind::If {
                then, otherwise, ..
            } => {
                self.declare_all(then)?;
                if let Some(steps) = otherwise {
                    self.declare_all(steps)?;
                }
            }
            StepKind::Case { arms, default } => {
                for arm in arms {
                    self.declare_all(&arm.steps)?;
                }
                if let Some(steps) = default {
                    self.declare_all(steps)?;
                }
            }
            StepKind::Parallel(branches) => {
                for index in 0..branches.len() {
                    let expanded = expand_branch(&step.name, index, branches);
                    self.declare_all(&expanded.steps)?;
                    if let Some(steps) = expanded.handler {
                        self.declare_all(steps)?;
                    }
                }
            }
            StepKind::Loop(spec) => {
                let body = loop_body(step, spec)?;
                self.declare_all(&body)?;
            }
        }

        if let Some(steps) = &step.exception {
            self.declare_all(steps)?;
        }
        Ok(())
    }

    fn declare_name(&mut self, name: &str, declared: Declared) -> Result<()> {
        if name.trim().is_empty() {
            return Err(invalid(name, "step name is empty"));
        }
        if name == PROMPT_KEYWORD {
            return Err(invalid(
                name,
                "'prompt' is reserved for the initial prompt in from:",
            ));
        }
        if self.declared.insert(name.to_string(), declared).is_some() {
            return Err(MaestroError::DuplicateStep {
                step: name.to_string(),
            });
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Compile pass
    // ─────────────────────────────────────────────────────────────

    fn compile_steps(&self, steps: &[StepSpec], scope: &mut Scope) -> Result<Vec<PlanNode>> {
        steps
            .iter()
            .map(|step| self.compile_step(step, scope))
            .collect()
    }

    /// Compile one step; on return `scope` holds what is guaranteed after it
    fn compile_step(&self, step: &StepSpec, scope: &mut Scope) -> Result<PlanNode> {
        let name = step.name.as_str();
        let mut after = scope.clone();

        let kind = match step.kind()? {
            StepKind::Agent(agent) => {
                let node = self.agent_node(step, agent, scope)?;
                after.insert(name.to_string());
                NodeKind::Agent(node)
            }
            StepKind::If {
                predicate,
                then,
                otherwise,
            } => {
                let arms = vec![CondArm {
                    predicate: self.predicate(name, predicate, scope)?,
                    nodes: self.compile_steps(then, &mut scope.clone())?,
                }];
                let fallback = match otherwise {
                    Some(steps) => Some(self.compile_steps(steps, &mut scope.clone())?),
                    None => None,
                };
                NodeKind::Conditional { arms, fallback }
            }
            StepKind::Case { arms, default } => {
                if arms.is_empty() {
                    return Err(invalid(name, "case has no arms"));
                }
                let arms = arms
                    .iter()
                    .map(|arm| {
                        Ok(CondArm {
                            predicate: self.predicate(name, &arm.when, scope)?,
                            nodes: self.compile_steps(&arm.steps, &mut scope.clone())?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let fallback = match default {
                    Some(steps) => Some(self.compile_steps(steps, &mut scope.clone())?),
                    None => None,
                };
                NodeKind::Conditional { arms, fallback }
            }
            StepKind::Parallel(specs) => {
                if specs.is_empty() {
                    return Err(invalid(name, "parallel has no branches"));
                }
                let mut branches = Vec::with_capacity(specs.len());
                for index in 0..specs.len() {
                    let expanded = expand_branch(name, index, specs);
                    if expanded.steps.is_empty() {
                        return Err(invalid(
                            name,
                            format!("branch '{}' has no steps", expanded.name),
                        ));
                    }
                    // Every branch sees the fan-out snapshot only
                    let mut branch_scope = scope.clone();
                    let nodes = self.compile_steps(&expanded.steps, &mut branch_scope)?;
                    let handler = match expanded.handler {
                        Some(steps) => Some(self.handler(name, steps, scope)?),
                        None => {
                            after.extend(branch_scope);
                            None
                        }
                    };
                    branches.push(Branch {
                        name: expanded.name,
                        nodes: nodes.into(),
                        handler: handler.map(Into::into),
                    });
                }
                NodeKind::Parallel { branches }
            }
            StepKind::Loop(spec) => {
                let steps = loop_body(step, spec)?;
                let mut body_scope = scope.clone();
                let body = self.compile_steps(&steps, &mut body_scope)?;
                // `until` runs after an iteration, so the body is visible to it
                let until = self.predicate(name, &spec.until, &body_scope)?;
                let max_iterations = self.loop_cap(name, spec.max_iterations)?;
                after = body_scope;
                NodeKind::Loop {
                    body,
                    until,
                    max_iterations,
                }
            }
        };

        let handler = match &step.exception {
            Some(steps) => Some(self.handler(name, steps, scope)?),
            None => None,
        };
        if handler.is_none() {
            *scope = after;
        }

        Ok(PlanNode {
            name: step.name.clone(),
            kind,
            handler,
        })
    }

    /// A handler may fire at any point inside its owner, so it only sees
    /// what was guaranteed before the owner started
    fn handler(&self, owner: &str, steps: &[StepSpec], entry: &Scope) -> Result<Vec<PlanNode>> {
        if steps.is_empty() {
            return Err(invalid(owner, "exception handler has no steps"));
        }
        self.compile_steps(steps, &mut entry.clone())
    }

    fn agent_node(&self, step: &StepSpec, agent: &str, scope: &Scope) -> Result<AgentNode> {
        let name = step.name.as_str();
        if !self.agents.contains(agent) {
            return Err(MaestroError::UnknownAgent {
                step: name.to_string(),
                agent: agent.to_string(),
            });
        }

        let from = step
            .from
            .iter()
            .map(|reference| self.input_ref(name, reference, scope))
            .collect::<Result<Vec<_>>>()?;

        for reference in &step.outputs {
            match self.declared.get(reference.as_str()) {
                None => {
                    return Err(invalid(
                        name,
                        format!("outputs names unknown step '{}'", reference),
                    ))
                }
                Some(_) => self.check_visible(name, reference, scope)?,
            }
        }

        let timeout = match step.timeout_ms {
            Some(0) => return Err(invalid(name, "timeout_ms must be positive")),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        Ok(AgentNode {
            agent: agent.to_string(),
            from,
            context: step.context.clone(),
            outputs: step.outputs.clone(),
            timeout,
        })
    }

    fn input_ref(&self, step: &str, reference: &str, scope: &Scope) -> Result<InputRef> {
        if self.declared.contains_key(reference) {
            self.check_visible(step, reference, scope)?;
            return Ok(InputRef::Step(reference.to_string()));
        }
        if reference == PROMPT_KEYWORD {
            return Ok(InputRef::Prompt);
        }
        if let Some(target) = reference.strip_prefix(INSTRUCTIONS_PREFIX) {
            return match self.declared.get(target) {
                Some(Declared::Agent(agent)) => Ok(InputRef::Instructions {
                    step: target.to_string(),
                    agent: agent.clone(),
                }),
                Some(Declared::Control) => Err(invalid(
                    step,
                    format!("'{}' is a control-flow step and has no instructions", target),
                )),
                None => Err(invalid(
                    step,
                    format!("'{}' reads instructions of unknown step '{}'", reference, target),
                )),
            };
        }
        Ok(InputRef::Literal(reference.to_string()))
    }

    /// A declared `reference` must be an agent step guaranteed in `scope`
    fn check_visible(&self, step: &str, reference: &str, scope: &Scope) -> Result<()> {
        if self.declared.get(reference) == Some(&Declared::Control) {
            return Err(invalid(
                step,
                format!(
                    "'{}' is a control-flow step and produces no output",
                    reference
                ),
            ));
        }
        if !scope.contains(reference) {
            return Err(MaestroError::ForwardReference {
                step: step.to_string(),
                reference: reference.to_string(),
            });
        }
        Ok(())
    }

    fn predicate(&self, step: &str, source: &str, scope: &Scope) -> Result<Predicate> {
        let predicate = Predicate::parse(source).map_err(|reason| {
            MaestroError::InvalidExpression {
                step: step.to_string(),
                expr: source.to_string(),
                reason,
            }
        })?;
        for reference in predicate.step_refs() {
            if !self.declared.contains_key(reference) {
                return Err(MaestroError::InvalidExpression {
                    step: step.to_string(),
                    expr: source.to_string(),
                    reason: format!("unknown step '{}'", reference),
                });
            }
            self.check_visible(step, reference, scope)?;
        }
        Ok(predicate)
    }

    fn loop_cap(&self, step: &str, declared: Option<u32>) -> Result<u32> {
        match declared {
            None => Ok(self.max_iterations),
            Some(0) => Err(invalid(step, "max_iterations must be at least 1")),
            Some(n) if n > self.ceiling => Err(invalid(
                step,
                format!("max_iterations {} exceeds the ceiling of {}", n, self.ceiling),
            )),
            Some(n) => Ok(n),
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Shorthand expansion
// ─────────────────────────────────────────────────────────────

struct ExpandedBranch<'a> {
    name: String,
    steps: Cow<'a, [StepSpec]>,
    handler: Option<&'a [StepSpec]>,
}

/// `- agent_x` becomes a branch named `agent_x` holding one step `<parent>.agent_x`
///
/// An agent listed more than once gets its 1-based occurrence appended
/// (`agent_x#1`, `agent_x#2`), branch and step name alike.
fn expand_branch<'a>(parent: &str, index: usize, branches: &'a [BranchSpec]) -> ExpandedBranch<'a> {
    match &branches[index] {
        BranchSpec::Agent(agent) => {
            let is_same = |b: &BranchSpec| matches!(b, BranchSpec::Agent(a) if a == agent);
            let name = if branches.iter().filter(|b| is_same(b)).count() > 1 {
                let occurrence = branches[..index].iter().filter(|b| is_same(b)).count() + 1;
                format!("{}#{}", agent, occurrence)
            } else {
                agent.clone()
            };
            ExpandedBranch {
                steps: Cow::Owned(vec![StepSpec::agent_step(
                    format!("{}.{}", parent, name),
                    agent.as_str(),
                )]),
                name,
                handler: None,
            }
        }
        BranchSpec::Block {
            name,
            steps,
            exception,
        } => ExpandedBranch {
            name: name
                .clone()
                .unwrap_or_else(|| format!("{}#{}", parent, index + 1)),
            steps: Cow::Borrowed(steps),
            handler: exception.as_deref(),
        },
    }
}

/// Steps a firing target runs: the `agent` shorthand `event.<agent>`, then
/// the named top-level steps in declared order
fn firing_target(event: &EventSpec, top_level: &[StepSpec]) -> Result<Vec<StepSpec>> {
    let mut steps = Vec::new();
    if let Some(agent) = &event.agent {
        steps.push(StepSpec::agent_step(
            format!("{}.{}", EVENT_SCOPE, agent),
            agent.as_str(),
        ));
    }
    for name in &event.steps {
        if !top_level.iter().any(|s| &s.name == name) {
            return Err(invalid(
                EVENT_SCOPE,
                format!("steps names '{}', which is not a top-level step", name),
            ));
        }
    }
    steps.extend(
        top_level
            .iter()
            .filter(|s| event.steps.contains(&s.name))
            .cloned(),
    );
    Ok(steps)
}

/// Loop body: explicit `steps`, or the `agent` shorthand named `<loop>.<agent>`
fn loop_body<'a>(step: &StepSpec, spec: &'a LoopSpec) -> Result<Cow<'a, [StepSpec]>> {
    match (&spec.agent, spec.steps.is_empty()) {
        (Some(_), false) => Err(invalid(&step.name, "loop takes either steps or agent, not both")),
        (None, true) => Err(invalid(&step.name, "loop body has no steps")),
        (Some(agent), true) => Ok(Cow::Owned(vec![StepSpec::agent_step(
            format!("{}.{}", step.name, agent),
            agent.as_str(),
        )])),
        (None, false) => Ok(Cow::Borrowed(&spec.steps)),
    }
}

fn invalid(step: &str, reason: impl Into<String>) -> MaestroError {
    MaestroError::InvalidStep {
        step: step.to_string(),
        reason: reason.into(),
    }
}
