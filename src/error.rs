// The #[error] attribute from thiserror uses struct fields via string interpolation,
// but Rust's unused_assignments lint doesn't recognize this.
#![allow(unused_assignments)]

//! Maestro Error Types with Error Codes
//!
//! Error code ranges:
//! - MAESTRO-000-009: Document errors (YAML, apiVersion, kind)
//! - MAESTRO-010-029: Compile errors (plan construction)
//! - MAESTRO-030-049: Execution errors (step, agent, loop, cancellation)
//! - MAESTRO-050-059: Config / scheduler errors
//! - MAESTRO-090-099: IO / serialization errors
//!
//! Compile errors always carry the offending step name.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MaestroError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum MaestroError {
    // ═══════════════════════════════════════════
    // DOCUMENT ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[MAESTRO-001] Invalid document: {reason}")]
    InvalidDocument { reason: String },

    #[error("[MAESTRO-002] Unsupported apiVersion '{version}'")]
    InvalidApiVersion { version: String },

    #[error("[MAESTRO-003] Workflow file not found: {path}")]
    WorkflowNotFound { path: String },

    #[error("[MAESTRO-004] YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // ═══════════════════════════════════════════
    // COMPILE ERRORS (010-029)
    // ═══════════════════════════════════════════
    #[error("[MAESTRO-010] Duplicate step name '{step}'")]
    DuplicateStep { step: String },

    #[error("[MAESTRO-011] Step '{step}' references unknown agent '{agent}'")]
    UnknownAgent { step: String, agent: String },

    #[error("[MAESTRO-012] Step '{step}' reads '{reference}' before it is guaranteed to run")]
    ForwardReference { step: String, reference: String },

    #[error("[MAESTRO-013] Step '{step}' has invalid expression '{expr}': {reason}")]
    InvalidExpression {
        step: String,
        expr: String,
        reason: String,
    },

    #[error("[MAESTRO-014] Step '{step}' is malformed: {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("[MAESTRO-015] Workflow has no steps")]
    EmptyWorkflow,

    // ═══════════════════════════════════════════
    // EXECUTION ERRORS (030-049)
    // ═══════════════════════════════════════════
    #[error("[MAESTRO-030] Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<MaestroError>,
    },

    #[error("[MAESTRO-031] Agent '{agent}' failed: {reason}")]
    Agent { agent: String, reason: String },

    #[error("[MAESTRO-032] Agent '{agent}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    #[error("[MAESTRO-033] Agent '{agent}' is not registered")]
    AgentNotRegistered { agent: String },

    #[error("[MAESTRO-034] Loop '{step}' exceeded its iteration cap ({max_iterations})")]
    LoopBoundExceeded { step: String, max_iterations: u32 },

    #[error("[MAESTRO-035] Run cancelled")]
    Cancelled,

    #[error("[MAESTRO-036] Illegal run state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("[MAESTRO-037] Step '{step}' could not resolve input '{reference}'")]
    MissingInput { step: String, reference: String },

    #[error("[MAESTRO-038] Predicate on '{step}' failed: {reason}")]
    Predicate { step: String, reason: String },

    // ═══════════════════════════════════════════
    // CONFIG / SCHEDULER ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[MAESTRO-050] Config error: {reason}")]
    Config { reason: String },

    #[error("[MAESTRO-051] Invalid schedule '{expr}': {reason}")]
    Schedule { expr: String, reason: String },

    // ═══════════════════════════════════════════
    // IO ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[MAESTRO-090] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[MAESTRO-091] JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MaestroError {
    /// Get the error code (e.g., "MAESTRO-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDocument { .. } => "MAESTRO-001",
            Self::InvalidApiVersion { .. } => "MAESTRO-002",
            Self::WorkflowNotFound { .. } => "MAESTRO-003",
            Self::YamlParse(_) => "MAESTRO-004",
            Self::DuplicateStep { .. } => "MAESTRO-010",
            Self::UnknownAgent { .. } => "MAESTRO-011",
            Self::ForwardReference { .. } => "MAESTRO-012",
            Self::InvalidExpression { .. } => "MAESTRO-013",
            Self::InvalidStep { .. } => "MAESTRO-014",
            Self::EmptyWorkflow => "MAESTRO-015",
            Self::Step { .. } => "MAESTRO-030",
            Self::Agent { .. } => "MAESTRO-031",
            Self::AgentTimeout { .. } => "MAESTRO-032",
            Self::AgentNotRegistered { .. } => "MAESTRO-033",
            Self::LoopBoundExceeded { .. } => "MAESTRO-034",
            Self::Cancelled => "MAESTRO-035",
            Self::InvalidTransition { .. } => "MAESTRO-036",
            Self::MissingInput { .. } => "MAESTRO-037",
            Self::Predicate { .. } => "MAESTRO-038",
            Self::Config { .. } => "MAESTRO-050",
            Self::Schedule { .. } => "MAESTRO-051",
            Self::Io(_) => "MAESTRO-090",
            Self::Json(_) => "MAESTRO-091",
        }
    }

    /// Step name carried by a compile error, if this is one
    pub fn compile_step(&self) -> Option<&str> {
        match self {
            Self::DuplicateStep { step }
            | Self::UnknownAgent { step, .. }
            | Self::ForwardReference { step, .. }
            | Self::InvalidExpression { step, .. }
            | Self::InvalidStep { step, .. } => Some(step),
            _ => None,
        }
    }

    /// True for errors raised by the plan compiler
    pub fn is_compile_error(&self) -> bool {
        self.compile_step().is_some() || matches!(self, Self::EmptyWorkflow)
    }

    /// Whether an exception handler may absorb this error.
    ///
    /// Cancellation always propagates to the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Step { source, .. } => source.is_recoverable(),
            Self::Agent { .. }
            | Self::AgentTimeout { .. }
            | Self::AgentNotRegistered { .. }
            | Self::LoopBoundExceeded { .. }
            | Self::MissingInput { .. }
            | Self::Predicate { .. } => true,
            _ => false,
        }
    }

    /// True when this error (or the error it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wrap an agent-level failure into a step failure
    pub fn step(step: impl Into<String>, source: MaestroError) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }
}

impl FixSuggestion for MaestroError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            MaestroError::InvalidDocument { .. } => {
                Some("Check apiVersion, kind and the spec.template block")
            }
            MaestroError::InvalidApiVersion { .. } => Some("Use 'maestro/v1alpha1' as apiVersion"),
            MaestroError::WorkflowNotFound { .. } => Some("Check the file path exists"),
            MaestroError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            MaestroError::DuplicateStep { .. } => {
                Some("Step names must be unique across the whole workflow, including nested steps")
            }
            MaestroError::UnknownAgent { .. } => {
                Some("Add the agent to spec.template.agents or fix the agent name")
            }
            MaestroError::ForwardReference { .. } => {
                Some("Only reference steps that always run earlier on every path")
            }
            MaestroError::InvalidExpression { .. } => {
                Some("Example: input contains 'done' and iteration >= 2")
            }
            MaestroError::InvalidStep { .. } => {
                Some("Each step needs exactly one of: agent, if, case, parallel, loop")
            }
            MaestroError::EmptyWorkflow => Some("Add at least one step to spec.template.steps"),
            MaestroError::AgentTimeout { .. } => {
                Some("Raise timeout_ms on the step or agent_timeout_ms in config")
            }
            MaestroError::AgentNotRegistered { .. } => {
                Some("Pass the agent definitions file or use --dry-run")
            }
            MaestroError::LoopBoundExceeded { .. } => {
                Some("Check the until expression or raise max_iterations")
            }
            MaestroError::Config { .. } => Some("Check ~/.config/maestro/config.toml"),
            MaestroError::Schedule { .. } => {
                Some("Use a 6-field cron expression, e.g. '0 */5 * * * *'")
            }
            _ => None,
        }
    }
}
