//! Runner - one workflow run from `Init` to a terminal state
//!
//! ```text
//! Init ──► Running ──► Completed
//!                 ├──► Failed
//!                 └──► Cancelled
//! ```
//!
//! Each run gets a fresh `ExecutionContext` seeded with the prompt. The
//! runner owns the workflow-scoped handler and the terminal stream record.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::agent::AgentRegistry;
use crate::config::EngineConfig;
use crate::error::{MaestroError, Result};
use crate::event::{EventKind, EventLog, FinalResponse, Projector, StreamRecord};
use crate::plan::{count_all, ExecutablePlan, PlanNode};
use crate::store::{ExecutionContext, TokenUsage};

use super::executor::{Fault, StepExecutor};

/// Owner name reported when the workflow-scoped handler absorbs a failure
const WORKFLOW_HANDLER: &str = "workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Move to `to`, rejecting anything the state diagram does not allow
    pub fn transition(&mut self, to: RunState) -> Result<()> {
        let allowed = matches!(
            (*self, to),
            (Self::Init, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        );
        if !allowed {
            return Err(MaestroError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        })
    }
}

/// Everything a finished run leaves behind
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub workflow: String,
    pub state: RunState,
    pub context: ExecutionContext,
    /// Set when the run failed or was cancelled
    pub error: Option<MaestroError>,
    /// Step whose failure ended the run
    pub failed_step: Option<String>,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Final cursor value
    pub fn final_output(&self) -> &Arc<Value> {
        self.context.cursor()
    }

    pub fn usage(&self) -> TokenUsage {
        self.context.usage()
    }

    /// Aggregated response for non-streaming callers
    pub fn response(&self) -> Option<FinalResponse> {
        self.is_completed().then(|| {
            FinalResponse::new(self.workflow.as_str(), self.final_output(), self.usage())
                .with_steps(self.context.to_summary())
        })
    }

    /// The response, or the error that ended the run
    pub fn into_response(self) -> Result<FinalResponse> {
        if let Some(response) = self.response() {
            return Ok(response);
        }
        Err(self.error.unwrap_or(MaestroError::InvalidTransition {
            from: self.state.to_string(),
            to: RunState::Completed.to_string(),
        }))
    }
}

/// A streaming run in flight
pub struct RunHandle {
    pub run_id: String,
    /// Ordered records, closed by exactly one terminal record
    pub events: UnboundedReceiverStream<StreamRecord>,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Request cooperative cancellation (effective at the next step boundary)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish
    pub async fn outcome(self) -> Result<RunOutcome> {
        self.join.await.map_err(|e| MaestroError::Agent {
            agent: String::new(),
            reason: format!("run task failed: {}", e),
        })
    }

    /// Split into the event stream and the outcome future
    pub fn into_parts(self) -> (UnboundedReceiverStream<StreamRecord>, JoinHandle<RunOutcome>, CancellationToken) {
        (self.events, self.join, self.cancel)
    }
}

/// Entry point for executing a compiled plan; cheap to clone
#[derive(Clone)]
pub struct Runner {
    plan: Arc<ExecutablePlan>,
    agents: AgentRegistry,
    config: Arc<EngineConfig>,
    event_log: EventLog,
}

impl Runner {
    /// Bind a plan to agent implementations
    ///
    /// Fails when a declared agent has no implementation.
    pub fn new(plan: ExecutablePlan, agents: AgentRegistry, config: EngineConfig) -> Result<Self> {
        if let Some(missing) = agents.missing(&plan.agents).first() {
            return Err(MaestroError::AgentNotRegistered {
                agent: missing.to_string(),
            });
        }
        Ok(Self {
            plan: Arc::new(plan),
            agents,
            config: Arc::new(config),
            event_log: EventLog::new(),
        })
    }

    pub fn plan(&self) -> &ExecutablePlan {
        &self.plan
    }

    /// Audit log shared by every run of this runner
    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    /// Run to completion without streaming
    ///
    /// `prompt` overrides the workflow's own prompt.
    pub async fn run(&self, prompt: Option<&str>) -> RunOutcome {
        let projector = Arc::new(Projector::detached());
        self.execute(self.seed(prompt), projector, CancellationToken::new())
            .await
    }

    /// Run with a caller-provided cancellation token
    pub async fn run_with_cancel(&self, prompt: Option<&str>, cancel: CancellationToken) -> RunOutcome {
        let projector = Arc::new(Projector::detached());
        self.execute(self.seed(prompt), projector, cancel).await
    }

    /// Run a subplan of this plan (a firing target) as its own run
    ///
    /// The workflow handler still applies.
    pub async fn run_nodes(
        &self,
        nodes: &[PlanNode],
        prompt: &str,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let projector = Arc::new(Projector::detached());
        self.execute_as(new_run_id(), prompt.to_string(), nodes, projector, cancel)
            .await
    }

    /// Start a streaming run on the tokio runtime
    ///
    /// Dropping the returned event stream cancels the run.
    pub fn stream(&self, prompt: Option<&str>) -> RunHandle {
        let cancel = CancellationToken::new();
        let (projector, events) = Projector::channel(cancel.clone());
        let run_id = new_run_id();
        let runner = self.clone();
        let seed = self.seed(prompt);
        let token = cancel.clone();
        let id = run_id.clone();
        let join = tokio::spawn(async move {
            runner
                .execute_as(id, seed, &runner.plan.nodes, Arc::new(projector), token)
                .await
        });
        RunHandle {
            run_id,
            events,
            cancel,
            join,
        }
    }

    fn seed(&self, prompt: Option<&str>) -> String {
        prompt.unwrap_or(&self.plan.prompt).to_string()
    }

    async fn execute(
        &self,
        prompt: String,
        projector: Arc<Projector>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        self.execute_as(new_run_id(), prompt, &self.plan.nodes, projector, cancel)
            .await
    }

    #[instrument(skip_all, fields(workflow = %self.plan.name, run_id = %run_id))]
    async fn execute_as(
        &self,
        run_id: String,
        prompt: String,
        nodes: &[PlanNode],
        projector: Arc<Projector>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let started = Instant::now();
        let mut state = RunState::Init;
        let mut ctx = ExecutionContext::new(prompt);

        self.event_log.emit(EventKind::RunStarted {
            run_id: run_id.clone(),
            workflow: self.plan.name.clone(),
            workflow_hash: self.plan.hash.clone(),
            node_count: count_all(nodes),
            maestro_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        advance(&mut state, RunState::Running);
        info!(nodes = count_all(nodes), "run started");

        let executor = StepExecutor::new(
            self.agents.clone(),
            Arc::clone(&self.config),
            self.event_log.clone(),
            Arc::clone(&projector),
            cancel,
        );

        let flow = executor.exec_nodes(nodes, &mut ctx, None).await;
        // Workflow-scoped handler ends the run once it finishes
        let flow = match (flow, self.plan.handler.as_deref()) {
            (Err(fault), Some(handler)) if fault.is_recoverable() => {
                executor
                    .recover(WORKFLOW_HANDLER, handler, fault, &mut ctx, None)
                    .await
            }
            (flow, _) => flow,
        };

        let duration = started.elapsed();
        let (error, failed_step) = match flow {
            Ok(()) => {
                advance(&mut state, RunState::Completed);
                info!(
                    steps = ctx.len(),
                    tokens = ctx.usage().total_tokens,
                    duration_ms = duration.as_millis() as u64,
                    "run completed"
                );
                self.event_log.emit(EventKind::RunCompleted {
                    final_output: Arc::clone(ctx.cursor()),
                    usage: ctx.usage(),
                    total_duration_ms: duration.as_millis() as u64,
                });
                projector.finish(StreamRecord::completed(
                    self.plan.name.as_str(),
                    Arc::clone(ctx.cursor()),
                    ctx.usage(),
                    ctx.agent_usage().clone(),
                ));
                (None, None)
            }
            Err(Fault { result, error }) if error.is_cancelled() => {
                advance(&mut state, RunState::Cancelled);
                warn!(at_step = %result.step_name, "run cancelled");
                self.event_log.emit(EventKind::RunCancelled {
                    at_step: Some(Arc::from(result.step_name.as_str())),
                });
                projector.finish(StreamRecord::Cancelled {
                    workflow_name: self.plan.name.clone(),
                    error: error.to_string(),
                });
                (Some(error), Some(result.step_name))
            }
            Err(Fault { result, error }) => {
                advance(&mut state, RunState::Failed);
                error!(step = %result.step_name, code = error.code(), error = %error, "run failed");
                self.event_log.emit(EventKind::RunFailed {
                    error: error.to_string(),
                    failed_step: Some(Arc::from(result.step_name.as_str())),
                });
                projector.finish(StreamRecord::Error {
                    failed_step: Some(result.step_name.clone()),
                    failed_agent: Some(result.agent_name.clone()).filter(|a| !a.is_empty()),
                    error: error.to_string(),
                    code: error.code().to_string(),
                    step_complete: false,
                });
                (Some(error), Some(result.step_name))
            }
        };

        RunOutcome {
            run_id,
            workflow: self.plan.name.clone(),
            state,
            context: ctx,
            error,
            failed_step,
            duration,
        }
    }
}

/// Transitions taken here follow the diagram by construction
fn advance(state: &mut RunState, to: RunState) {
    if let Err(e) = state.transition(to) {
        error!(error = %e, "run state machine violated");
    }
}

fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4())
}
