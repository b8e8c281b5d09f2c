//! StepResult - output of one agent step
//!
//! Output values are opaque to the engine (string or structured JSON) and
//! wrapped in `Arc` so results can be cloned into forks and events in O(1).

use std::borrow::Cow;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counters reported by an agent call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, response_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            response_tokens,
            total_tokens: prompt_tokens + response_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.response_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            response_tokens: self.response_tokens + rhs.response_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Result of one agent step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub agent_name: String,
    /// Agent output (Arc for O(1) cloning of large JSON structures)
    pub output: Arc<Value>,
    /// Tokens consumed by this step alone
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// 1-based loop iteration when produced inside a loop body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl StepResult {
    /// Create a successful result
    pub fn success(
        step_name: impl Into<String>,
        agent_name: impl Into<String>,
        output: impl Into<Value>,
        usage: TokenUsage,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            agent_name: agent_name.into(),
            output: Arc::new(output.into()),
            usage,
            error: None,
            timestamp: Utc::now(),
            duration_ms: 0,
            iteration: None,
        }
    }

    /// Create a failed result (output is null)
    pub fn failed(
        step_name: impl Into<String>,
        agent_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            agent_name: agent_name.into(),
            output: Arc::new(Value::Null),
            usage: TokenUsage::default(),
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration_ms: 0,
            iteration: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_iteration(mut self, iteration: Option<u32>) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Get output as string (zero-copy for String values)
    pub fn output_str(&self) -> Cow<'_, str> {
        value_text(&self.output)
    }
}

/// Text rendering of an opaque output value
///
/// Strings are returned as-is, null renders empty, everything else as JSON.
pub fn value_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}
