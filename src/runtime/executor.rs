//! Step Executor - walks a compiled plan against one `ExecutionContext`
//!
//! Depth-first, declared order. Agent nodes are the only suspension points.
//!
//! Failure handling: a failing node yields a [`Fault`] (the failed
//! `StepResult` plus the error). On the way out, every enclosing node that
//! owns a handler gets the chance to absorb it; the handler runs with the
//! error text as input and flow resumes after the owning node. Cancellation
//! is never absorbed.
//!
//! Parallel nodes run each branch as a tokio task over a fork of the
//! context, then merge branch deltas in declared order.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::{AgentRegistry, AgentRequest};
use crate::config::{EngineConfig, LoopExceeded, ParallelPolicy};
use crate::error::MaestroError;
use crate::event::{EventKind, EventLog, Projector};
use crate::plan::{AgentNode, Branch, CondArm, InputRef, NodeKind, PlanNode, Predicate};
use crate::store::{value_text, ExecutionContext, StepResult};
use crate::util::{INSTRUCTIONS_PREFIX, PART_SEPARATOR};

/// A step failure travelling outward in search of a handler
#[derive(Debug)]
pub struct Fault {
    /// The failing step's result (null output, error text set)
    pub result: StepResult,
    pub error: MaestroError,
}

impl Fault {
    fn new(step: &str, agent: &str, error: MaestroError) -> Self {
        Self {
            result: StepResult::failed(step, agent, error.to_string()),
            error,
        }
    }

    fn cancelled(step: &str) -> Self {
        Self::new(step, "", MaestroError::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }

    /// Whether a handler may absorb this fault
    pub fn is_recoverable(&self) -> bool {
        self.error.is_recoverable()
    }
}

type Flow = std::result::Result<(), Fault>;

/// Executes plan nodes; cheap to clone into branch tasks
#[derive(Clone)]
pub struct StepExecutor {
    agents: AgentRegistry,
    config: Arc<EngineConfig>,
    events: EventLog,
    projector: Arc<Projector>,
    cancel: CancellationToken,
}

impl StepExecutor {
    pub fn new(
        agents: AgentRegistry,
        config: Arc<EngineConfig>,
        events: EventLog,
        projector: Arc<Projector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agents,
            config,
            events,
            projector,
            cancel,
        }
    }

    /// Same executor, cancelled by `cancel` instead
    fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Run a node list in order, stopping at the first unabsorbed fault
    pub fn exec_nodes<'a>(
        &'a self,
        nodes: &'a [PlanNode],
        ctx: &'a mut ExecutionContext,
        iteration: Option<u32>,
    ) -> BoxFuture<'a, Flow> {
        Box::pin(async move {
            for node in nodes {
                self.exec_node(node, ctx, iteration).await?;
            }
            Ok(())
        })
    }

    async fn exec_node(
        &self,
        node: &PlanNode,
        ctx: &mut ExecutionContext,
        iteration: Option<u32>,
    ) -> Flow {
        self.checkpoint(&node.name)?;

        let flow = match &node.kind {
            NodeKind::Agent(agent) => self.exec_agent(&node.name, agent, ctx, iteration).await,
            NodeKind::Conditional { arms, fallback } => {
                self.exec_conditional(&node.name, arms, fallback.as_deref(), ctx, iteration)
                    .await
            }
            NodeKind::Parallel { branches } => {
                self.exec_parallel(&node.name, branches, ctx, iteration).await
            }
            NodeKind::Loop {
                body,
                until,
                max_iterations,
            } => {
                self.exec_loop(&node.name, body, until, *max_iterations, ctx)
                    .await
            }
        };

        match (flow, &node.handler) {
            (Err(fault), Some(handler)) if fault.is_recoverable() => {
                self.recover(&node.name, handler, fault, ctx, iteration).await
            }
            (flow, _) => flow,
        }
    }

    /// Hand a fault to a handler subplan
    ///
    /// The handler sees the error text as its input. Its own failures are new
    /// faults for the next enclosing handler.
    pub async fn recover(
        &self,
        owner: &str,
        handler: &[PlanNode],
        fault: Fault,
        ctx: &mut ExecutionContext,
        iteration: Option<u32>,
    ) -> Flow {
        let Fault { result, error } = fault;
        warn!(
            owner,
            step = %result.step_name,
            code = error.code(),
            error = %error,
            "handler absorbing failure"
        );
        self.projector.step_absorbed(&result);
        self.events.emit(EventKind::HandlerInvoked {
            owner: Arc::from(owner),
            failed_step: Arc::from(result.step_name.as_str()),
            error: error.to_string(),
        });

        let error_text = result.error.clone().unwrap_or_else(|| error.to_string());
        ctx.set_cursor(Arc::new(Value::String(error_text)));
        self.exec_nodes(handler, ctx, iteration).await
    }

    fn checkpoint(&self, step: &str) -> Flow {
        if self.cancel.is_cancelled() {
            debug!(step, "cancellation observed at step boundary");
            return Err(Fault::cancelled(step));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Agent
    // ═══════════════════════════════════════════════════════════════

    #[instrument(skip_all, fields(step = %name, agent = %node.agent))]
    async fn exec_agent(
        &self,
        name: &str,
        node: &AgentNode,
        ctx: &mut ExecutionContext,
        iteration: Option<u32>,
    ) -> Flow {
        let (input, parts) = resolve_input(name, node, ctx, &self.agents)?;
        let request = AgentRequest {
            step: name.to_string(),
            agent: node.agent.clone(),
            input: (*input).clone(),
            parts,
            context: node.context.clone(),
            instructions: self.agents.instructions(&node.agent).map(str::to_string),
        };

        let step: Arc<str> = Arc::from(name);
        self.events.emit(EventKind::StepStarted {
            step: Arc::clone(&step),
            agent: node.agent.clone(),
            input: Arc::clone(&input),
            iteration,
        });

        let started = Instant::now();
        let outcome = self.invoke(name, node, &request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (output, usage) = match outcome {
            Ok(done) => done,
            Err(error) => {
                let error = MaestroError::step(name, error);
                self.events.emit(EventKind::StepFailed {
                    step,
                    agent: node.agent.clone(),
                    error: error.to_string(),
                    duration_ms,
                });
                let mut fault = Fault::new(name, &node.agent, error);
                fault.result = fault
                    .result
                    .with_duration(duration_ms)
                    .with_iteration(iteration);
                return Err(fault);
            }
        };

        let result = StepResult::success(name, node.agent.as_str(), output, usage)
            .with_duration(duration_ms)
            .with_iteration(iteration);
        debug!(duration_ms, tokens = usage.total_tokens, "step completed");

        let cursor = if node.outputs.is_empty() {
            Arc::clone(&result.output)
        } else {
            let mut text = result.output_str().into_owned();
            for reference in &node.outputs {
                if let Some(value) = ctx.output(reference) {
                    text.push_str(PART_SEPARATOR);
                    text.push_str(&value_text(value));
                }
            }
            Arc::new(Value::String(text))
        };

        self.projector.step_completed(&result);
        self.events.emit(EventKind::StepCompleted {
            step,
            agent: node.agent.clone(),
            output: Arc::clone(&result.output),
            usage,
            duration_ms,
        });
        ctx.record(result);
        ctx.set_cursor(cursor);
        Ok(())
    }

    /// One agent call under its timeout, with streamed chunks aggregated
    async fn invoke(
        &self,
        name: &str,
        node: &AgentNode,
        request: &AgentRequest,
    ) -> std::result::Result<(Value, crate::store::TokenUsage), MaestroError> {
        let agent = self.agents.require(&node.agent)?;
        let timeout = node.timeout.unwrap_or_else(|| self.config.agent_timeout());

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let call = tokio::time::timeout(timeout, agent.invoke(request, Some(&tx))).await;
        drop(tx);

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk);
        }

        match call {
            Err(_) => Err(MaestroError::AgentTimeout {
                agent: node.agent.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(MaestroError::Agent {
                agent: node.agent.clone(),
                reason: format!("{:#}", e),
            }),
            Ok(Ok(out)) => {
                let output = if out.output.is_null() && !streamed.is_empty() {
                    debug!(step = name, bytes = streamed.len(), "aggregated streamed output");
                    Value::String(streamed)
                } else {
                    out.output
                };
                Ok((output, out.usage))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Conditional
    // ═══════════════════════════════════════════════════════════════

    async fn exec_conditional(
        &self,
        name: &str,
        arms: &[CondArm],
        fallback: Option<&[PlanNode]>,
        ctx: &mut ExecutionContext,
        iteration: Option<u32>,
    ) -> Flow {
        let selected = {
            let scope = ctx.scope(iteration.unwrap_or(0));
            let mut selected = None;
            for arm in arms {
                let holds = arm
                    .predicate
                    .evaluate(&scope)
                    .map_err(|reason| predicate_fault(name, &arm.predicate, reason))?;
                if holds {
                    selected = Some((arm.predicate.source().to_string(), &arm.nodes[..]));
                    break;
                }
            }
            selected.or_else(|| fallback.map(|nodes| ("otherwise".to_string(), nodes)))
        };

        let label = selected
            .as_ref()
            .map_or_else(|| "none".to_string(), |(label, _)| label.clone());
        debug!(step = name, branch = %label, "branch selected");
        self.events.emit(EventKind::BranchSelected {
            step: Arc::from(name),
            branch: label,
        });

        match selected {
            Some((_, nodes)) => self.exec_nodes(nodes, ctx, iteration).await,
            None => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Parallel
    // ═══════════════════════════════════════════════════════════════

    async fn exec_parallel(
        &self,
        name: &str,
        branches: &[Branch],
        ctx: &mut ExecutionContext,
        iteration: Option<u32>,
    ) -> Flow {
        let policy = self.config.parallel_policy;
        let base = ctx.len();
        // Siblings share one child token: fail-fast cancels them, the run's
        // own cancellation reaches them through the parent
        let siblings = self.cancel.child_token();
        let branch_exec = self.with_cancel(siblings.clone());

        self.events.emit(EventKind::ParallelStarted {
            step: Arc::from(name),
            branches: branches.iter().map(|b| b.name.clone()).collect(),
        });

        let mut set = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let exec = branch_exec.clone();
            let nodes = Arc::clone(&branch.nodes);
            let handler = branch.handler.clone();
            let branch_name = branch.name.clone();
            let mut fork = ctx.fork();
            set.spawn(async move {
                let flow = exec.exec_nodes(&nodes, &mut fork, iteration).await;
                // Branch-scoped handler: siblings never notice
                let flow = match (flow, handler.as_deref()) {
                    (Err(fault), Some(handler)) if fault.is_recoverable() => {
                        exec.recover(&branch_name, handler, fault, &mut fork, iteration)
                            .await
                    }
                    (flow, _) => flow,
                };
                (index, fork, flow)
            });
        }

        let mut joined: Vec<Option<(ExecutionContext, Flow)>> =
            (0..branches.len()).map(|_| None).collect();
        // Completion order of failures; under fail-fast the first one is the cause
        let mut failure_order: Vec<usize> = Vec::new();

        while let Some(next) = set.join_next().await {
            match next {
                Ok((index, fork, flow)) => {
                    if flow.is_err() {
                        failure_order.push(index);
                        if policy == ParallelPolicy::FailFast && !siblings.is_cancelled() {
                            debug!(step = name, branch = %branches[index].name, "fail-fast: cancelling siblings");
                            siblings.cancel();
                        }
                    }
                    joined[index] = Some((fork, flow));
                }
                Err(join_error) => {
                    siblings.cancel();
                    // Drain the rest so no branch outlives the node
                    while set.join_next().await.is_some() {}
                    return Err(Fault::new(
                        name,
                        "",
                        MaestroError::Agent {
                            agent: name.to_string(),
                            reason: format!("branch task failed: {}", join_error),
                        },
                    ));
                }
            }
        }

        // Merge in declared order, whatever the completion order was
        let mut cursors = Vec::with_capacity(branches.len());
        let mut merged = Vec::new();
        let mut failed = Vec::new();
        let mut faults: Vec<Option<Fault>> = Vec::with_capacity(branches.len());
        for (branch, slot) in branches.iter().zip(joined) {
            let Some((fork, flow)) = slot else {
                faults.push(None);
                continue;
            };
            ctx.merge(fork.delta_since(base).iter().cloned());
            match flow {
                Ok(()) => {
                    merged.push(branch.name.clone());
                    cursors.push((**fork.cursor()).clone());
                    faults.push(None);
                }
                Err(fault) => {
                    failed.push(branch.name.clone());
                    faults.push(Some(fault));
                }
            }
        }

        self.events.emit(EventKind::ParallelJoined {
            step: Arc::from(name),
            merged,
            failed,
        });

        let cause = match policy {
            ParallelPolicy::FailFast => failure_order.first().copied(),
            ParallelPolicy::WaitAll => faults.iter().position(Option::is_some),
        };
        if let Some(index) = cause {
            if let Some(fault) = faults[index].take() {
                for other in faults.into_iter().flatten() {
                    if !other.is_cancelled() {
                        warn!(step = name, failed = %other.result.step_name, error = %other.error, "additional branch failure");
                        self.projector.step_failed(&other.result);
                    }
                }
                return Err(fault);
            }
        }

        ctx.set_cursor(Arc::new(Value::Array(cursors)));
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Loop
    // ═══════════════════════════════════════════════════════════════

    async fn exec_loop(
        &self,
        name: &str,
        body: &[PlanNode],
        until: &Predicate,
        max_iterations: u32,
        ctx: &mut ExecutionContext,
    ) -> Flow {
        let step: Arc<str> = Arc::from(name);
        let mut iteration = 0;

        loop {
            if iteration > 0 {
                self.checkpoint(name)?;
            }
            iteration += 1;
            self.events.emit(EventKind::LoopIteration {
                step: Arc::clone(&step),
                iteration,
            });
            self.exec_nodes(body, ctx, Some(iteration)).await?;

            let done = until
                .evaluate(&ctx.scope(iteration))
                .map_err(|reason| predicate_fault(name, until, reason))?;
            if done {
                debug!(step = name, iteration, "loop condition met");
                self.events.emit(EventKind::LoopExited {
                    step,
                    iterations: iteration,
                    reason: "until".to_string(),
                });
                return Ok(());
            }

            if iteration >= max_iterations {
                self.events.emit(EventKind::LoopExited {
                    step: Arc::clone(&step),
                    iterations: iteration,
                    reason: "cap".to_string(),
                });
                return match self.config.loop_exceeded {
                    LoopExceeded::Fail => Err(Fault::new(
                        name,
                        "",
                        MaestroError::LoopBoundExceeded {
                            step: name.to_string(),
                            max_iterations,
                        },
                    )),
                    LoopExceeded::Stop => {
                        warn!(step = name, max_iterations, "loop stopped at its iteration cap");
                        Ok(())
                    }
                };
            }
        }
    }
}

/// Effective input plus its individual parts
///
/// No `from`: the cursor. One part: that value unchanged. Several: their
/// text joined by a blank line.
fn resolve_input(
    step: &str,
    node: &AgentNode,
    ctx: &ExecutionContext,
    agents: &AgentRegistry,
) -> std::result::Result<(Arc<Value>, Vec<Value>), Fault> {
    if node.from.is_empty() {
        let cursor = Arc::clone(ctx.cursor());
        let parts = vec![(*cursor).clone()];
        return Ok((cursor, parts));
    }

    let mut parts = Vec::with_capacity(node.from.len());
    for reference in &node.from {
        let value = match reference {
            InputRef::Step(name) => match ctx.output(name) {
                Some(value) => (**value).clone(),
                None => {
                    return Err(Fault::new(
                        step,
                        &node.agent,
                        MaestroError::MissingInput {
                            step: step.to_string(),
                            reference: name.clone(),
                        },
                    ))
                }
            },
            InputRef::Prompt => (**ctx.initial_prompt()).clone(),
            InputRef::Instructions {
                step: source,
                agent,
            } => match agents.instructions(agent) {
                Some(text) => Value::String(text.to_string()),
                None => {
                    return Err(Fault::new(
                        step,
                        &node.agent,
                        MaestroError::MissingInput {
                            step: step.to_string(),
                            reference: format!("{}{}", INSTRUCTIONS_PREFIX, source),
                        },
                    ))
                }
            },
            InputRef::Literal(text) => Value::String(text.clone()),
        };
        parts.push(value);
    }

    let input = match parts.as_slice() {
        [single] => single.clone(),
        many => Value::String(
            many.iter()
                .map(|v| value_text(v).into_owned())
                .collect::<Vec<_>>()
                .join(PART_SEPARATOR),
        ),
    };
    Ok((Arc::new(input), parts))
}

fn predicate_fault(step: &str, predicate: &Predicate, reason: String) -> Fault {
    Fault::new(
        step,
        "",
        MaestroError::Predicate {
            step: step.to_string(),
            reason: format!("{}: {}", predicate.source(), reason),
        },
    )
}
