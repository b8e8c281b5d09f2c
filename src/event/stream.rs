//! Event Projector - executor progress → caller-facing records
//!
//! Streaming callers get an ordered sequence of [`StreamRecord`]s: one `step`
//! record per agent step (success, or failure absorbed by a handler), then
//! exactly one terminal record (`workflow_complete`, `error` or `cancelled`).
//! Nothing follows a terminal record.
//!
//! Non-streaming callers get one [`FinalResponse`].
//!
//! On the wire every record is one JSON line prefixed by `data: `. Clients
//! tell records apart by key: only step records carry `step_name`, only the
//! completion record carries `workflow_complete: true`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::{value_text, StepResult, TokenUsage};
use crate::util::STREAM_MARKER;

/// Projection of one `StepResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub step_name: String,
    pub agent_name: String,
    pub step_result: Arc<Value>,
    pub step_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Position in the stream, 0-based
    pub step_index: usize,
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamRecord {
    Step(StreamEvent),
    WorkflowComplete {
        /// Always `true`
        workflow_complete: bool,
        workflow_name: String,
        final_result: Arc<Value>,
        token_usage: TokenUsage,
        agent_usage: BTreeMap<String, TokenUsage>,
        completed_at: DateTime<Utc>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_agent: Option<String>,
        error: String,
        code: String,
        step_complete: bool,
    },
    Cancelled {
        workflow_name: String,
        error: String,
    },
}

impl StreamRecord {
    /// Completion record for a finished run
    pub fn completed(
        workflow_name: impl Into<String>,
        final_result: Arc<Value>,
        token_usage: TokenUsage,
        agent_usage: BTreeMap<String, TokenUsage>,
    ) -> Self {
        Self::WorkflowComplete {
            workflow_complete: true,
            workflow_name: workflow_name.into(),
            final_result,
            token_usage,
            agent_usage,
            completed_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Step(_))
    }

    pub fn as_step(&self) -> Option<&StreamEvent> {
        match self {
            Self::Step(event) => Some(event),
            _ => None,
        }
    }

    /// `data: {json}\n`
    pub fn to_line(&self) -> Result<String> {
        Ok(format!("{}{}\n", STREAM_MARKER, serde_json::to_string(self)?))
    }

    /// Inverse of [`to_line`](Self::to_line); blank or unmarked lines yield `None`
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        match line.trim_end().strip_prefix(STREAM_MARKER) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }
}

/// Aggregated answer for non-streaming callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub response: String,
    pub workflow_name: String,
    pub completed_at: DateTime<Utc>,
    pub usage: TokenUsage,
    /// `final_prompt` plus the latest output of every step
    pub steps: Value,
}

impl FinalResponse {
    pub fn new(workflow_name: impl Into<String>, final_value: &Value, usage: TokenUsage) -> Self {
        Self {
            response: value_text(final_value).into_owned(),
            workflow_name: workflow_name.into(),
            completed_at: Utc::now(),
            usage,
            steps: Value::Null,
        }
    }

    pub fn with_steps(mut self, steps: Value) -> Self {
        self.steps = steps;
        self
    }
}

struct State {
    next_index: usize,
    closed: bool,
}

/// Turns executor progress into stream records
///
/// Shared (`Arc`) by every branch of a run. Index assignment and sending
/// happen under one lock so `step_index` follows stream order.
pub struct Projector {
    tx: Option<mpsc::UnboundedSender<StreamRecord>>,
    state: Mutex<State>,
    /// Cancelled when the receiving side goes away
    disconnect: Option<CancellationToken>,
}

impl std::fmt::Debug for Projector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Projector")
            .field("streaming", &self.tx.is_some())
            .field("emitted", &state.next_index)
            .field("closed", &state.closed)
            .finish()
    }
}

impl Projector {
    /// Projector for non-streaming runs: records are counted, not sent
    pub fn detached() -> Self {
        Self {
            tx: None,
            state: Mutex::new(State {
                next_index: 0,
                closed: false,
            }),
            disconnect: None,
        }
    }

    /// Projector feeding a live stream
    ///
    /// Dropping the returned stream cancels `on_disconnect`.
    pub fn channel(on_disconnect: CancellationToken) -> (Self, UnboundedReceiverStream<StreamRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let projector = Self {
            tx: Some(tx),
            state: Mutex::new(State {
                next_index: 0,
                closed: false,
            }),
            disconnect: Some(on_disconnect),
        };
        (projector, UnboundedReceiverStream::new(rx))
    }

    /// A step finished successfully
    pub fn step_completed(&self, result: &StepResult) {
        self.step(result, true);
    }

    /// A step failed and a handler took over
    pub fn step_absorbed(&self, result: &StepResult) {
        self.step(result, false);
    }

    /// A step failed alongside the failure that ends the run
    ///
    /// Parallel siblings can fail independently; only one of them becomes
    /// the terminal record, the others are reported here.
    pub fn step_failed(&self, result: &StepResult) {
        self.step(result, false);
    }

    fn step(&self, result: &StepResult, complete: bool) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let record = StreamRecord::Step(StreamEvent {
            step_name: result.step_name.clone(),
            agent_name: result.agent_name.clone(),
            step_result: Arc::clone(&result.output),
            step_complete: complete && result.is_success(),
            error: result.error.clone(),
            step_index: state.next_index,
            usage: result.usage,
            iteration: result.iteration,
            timestamp: result.timestamp,
        });
        state.next_index += 1;
        self.send(record);
    }

    /// Emit the terminal record and close the stream
    pub fn finish(&self, record: StreamRecord) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.send(record);
    }

    /// Number of step records emitted so far
    pub fn emitted(&self) -> usize {
        self.state.lock().next_index
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn send(&self, record: StreamRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(record).is_err() {
                if let Some(token) = &self.disconnect {
                    if !token.is_cancelled() {
                        tracing::warn!("stream receiver dropped, cancelling run");
                        token.cancel();
                    }
                }
            }
        }
    }
}
