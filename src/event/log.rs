//! EventLog - append-only audit trail of one run
//!
//! - Event: envelope with id + elapsed time + kind
//! - EventKind: run / step / control-flow / handler levels
//! - EventLog: thread-safe, append-only, shared by clones
//!
//! The audit trail is richer than the live stream: it records control-flow
//! decisions (selected branch, loop iterations, handler hand-offs) that never
//! reach a streaming caller.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::TokenUsage;

/// Single entry in the run's audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since the log was created (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// Everything the executor reports
///
/// Uses `Arc<str>` for step names so branch tasks clone them for free.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // RUN LEVEL
    // ═══════════════════════════════════════════
    RunStarted {
        run_id: String,
        workflow: String,
        /// xxh3 of the workflow, for correlating runs of the same definition
        workflow_hash: String,
        node_count: usize,
        maestro_version: String,
    },
    RunCompleted {
        final_output: Arc<Value>,
        usage: TokenUsage,
        total_duration_ms: u64,
    },
    RunFailed {
        error: String,
        failed_step: Option<Arc<str>>,
    },
    RunCancelled {
        /// Step at whose boundary cancellation was observed
        at_step: Option<Arc<str>>,
    },

    // ═══════════════════════════════════════════
    // STEP LEVEL
    // ═══════════════════════════════════════════
    StepStarted {
        step: Arc<str>,
        agent: String,
        input: Arc<Value>,
        iteration: Option<u32>,
    },
    StepCompleted {
        step: Arc<str>,
        agent: String,
        output: Arc<Value>,
        usage: TokenUsage,
        duration_ms: u64,
    },
    StepFailed {
        step: Arc<str>,
        agent: String,
        error: String,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // CONTROL FLOW
    // ═══════════════════════════════════════════
    BranchSelected {
        step: Arc<str>,
        /// Predicate source of the selected arm, `otherwise` or `none`
        branch: String,
    },
    ParallelStarted {
        step: Arc<str>,
        branches: Vec<String>,
    },
    ParallelJoined {
        step: Arc<str>,
        /// Branch names in declared (merge) order
        merged: Vec<String>,
        failed: Vec<String>,
    },
    LoopIteration {
        step: Arc<str>,
        iteration: u32,
    },
    LoopExited {
        step: Arc<str>,
        iterations: u32,
        /// `until` or `cap`
        reason: String,
    },

    // ═══════════════════════════════════════════
    // HANDLERS
    // ═══════════════════════════════════════════
    HandlerInvoked {
        /// Node (or branch, or `workflow`) owning the handler
        owner: Arc<str>,
        failed_step: Arc<str>,
        error: String,
    },
}

impl EventKind {
    /// Step name if the event is about one step or node
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. }
            | Self::BranchSelected { step, .. }
            | Self::ParallelStarted { step, .. }
            | Self::ParallelJoined { step, .. }
            | Self::LoopIteration { step, .. }
            | Self::LoopExited { step, .. } => Some(step),
            Self::HandlerInvoked { failed_step, .. } => Some(failed_step),
            Self::RunStarted { .. }
            | Self::RunCompleted { .. }
            | Self::RunFailed { .. }
            | Self::RunCancelled { .. } => None,
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(
            self,
            Self::RunStarted { .. }
                | Self::RunCompleted { .. }
                | Self::RunFailed { .. }
                | Self::RunCancelled { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at run start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let mut events = self.events.write();
        // id assigned under the lock so ids follow storage order
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        events.push(Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        });
        id
    }

    /// Get all events (cloned - use `with_events` for zero-copy access)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Zero-copy access to events via callback
    ///
    /// Holds the read lock for the duration of the callback.
    pub fn with_events<T>(&self, f: impl FnOnce(&[Event]) -> T) -> T {
        f(&self.events.read())
    }

    /// Events about one step
    pub fn filter_step(&self, step: &str) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.step() == Some(step))
                .cloned()
                .collect()
        })
    }

    /// Run-level events only
    pub fn run_events(&self) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.is_run_event())
                .cloned()
                .collect()
        })
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        self.with_events(|events| serde_json::to_value(events).unwrap_or(Value::Null))
    }

    /// Write every event as one JSON line (NDJSON)
    pub fn write_ndjson(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.with_events(|events| -> Result<()> {
            for event in events {
                serde_json::to_writer(&mut writer, event)?;
                writer.write_all(b"\n")?;
            }
            Ok(())
        })?;
        writer.flush()?;
        tracing::info!(path = %path.display(), "wrote audit trace");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
