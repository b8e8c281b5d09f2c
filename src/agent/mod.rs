//! Agent Invocation Port
//!
//! The engine decides *when* an agent runs and *with what input*; what the
//! agent computes is up to the implementation behind [`Agent`].
//!
//! - [`Agent`]: async trait implemented by model calls, code runners, remote
//!   services, or [`MockAgent`] in tests and dry runs
//! - [`AgentRegistry`]: name → implementation binding for one run
//!
//! Agents report failures with `anyhow::Error`; the executor wraps them into
//! step errors.

mod mock;

pub use mock::{MockAgent, MOCK_ANSWER_PREFIX};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ast::AgentDoc;
use crate::error::{MaestroError, Result};
use crate::store::TokenUsage;

/// Sender for partial output an agent streams while it works
pub type ChunkSender = mpsc::UnboundedSender<String>;

/// Everything an agent receives for one invocation
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    /// Step being executed
    pub step: String,
    pub agent: String,
    /// Effective input (single `from` part unchanged, several joined)
    pub input: Value,
    /// Individual `from` parts, in declared order, before joining
    pub parts: Vec<Value>,
    /// Auxiliary literal strings from `context:`
    pub context: Vec<String>,
    /// Instructions documented for the agent being invoked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// What an agent hands back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    /// `Null` means "whatever I streamed is the answer"
    pub output: Value,
    pub usage: TokenUsage,
}

impl AgentOutput {
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// A pluggable unit of work invoked by agent steps
///
/// # Example
/// ```rust,ignore
/// struct Upper;
///
/// #[async_trait]
/// impl Agent for Upper {
///     async fn invoke(&self, req: &AgentRequest, _: Option<&ChunkSender>) -> anyhow::Result<AgentOutput> {
///         Ok(AgentOutput::new(req.input.to_string().to_uppercase()))
///     }
///     fn name(&self) -> &str { "upper" }
/// }
/// ```
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run once against resolved input
    ///
    /// `chunks`, when given, accepts partial output. The engine aggregates it
    /// into the step result when the returned output is `Null`.
    async fn invoke(
        &self,
        request: &AgentRequest,
        chunks: Option<&ChunkSender>,
    ) -> anyhow::Result<AgentOutput>;

    /// Implementation name for logs (e.g. "mock", "http")
    fn name(&self) -> &str;
}

/// Agent implementations bound by name for a run
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: FxHashMap<String, Arc<dyn Agent>>,
    /// `spec.instructions` of agent documents, by agent name
    instructions: FxHashMap<String, String>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to an implementation, replacing any previous binding
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> &mut Self {
        self.agents.insert(name.into(), agent);
        self
    }

    pub fn with(mut self, name: impl Into<String>, agent: impl Agent + 'static) -> Self {
        self.register(name, Arc::new(agent));
        self
    }

    /// Record the instructions documented for `name`
    pub fn document(&mut self, name: impl Into<String>, instructions: impl Into<String>) -> &mut Self {
        self.instructions.insert(name.into(), instructions.into());
        self
    }

    pub fn instructions(&self, name: &str) -> Option<&str> {
        self.instructions.get(name).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Lookup that fails the way the executor reports it
    pub fn require(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.get(name).ok_or_else(|| MaestroError::AgentNotRegistered {
            agent: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Bound names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Dry-run binding: one [`MockAgent`] per declared agent
    ///
    /// A matching agent document with `instructions` makes the mock answer
    /// with those instructions (`{input}` substituted).
    pub fn mocks(declared: &[String], docs: &[AgentDoc]) -> Self {
        let mut registry = Self::new();
        for name in declared {
            let instructions = docs
                .iter()
                .find(|d| d.name() == name)
                .and_then(|doc| doc.spec.instructions.as_deref());
            let mock = match instructions {
                Some(text) => {
                    registry.document(name.as_str(), text);
                    MockAgent::new(name.as_str()).with_instructions(text)
                }
                None => MockAgent::new(name.as_str()),
            };
            registry.register(name.as_str(), Arc::new(mock));
        }
        registry
    }

    /// Names in `declared` with no binding
    pub fn missing<'a>(&self, declared: &'a [String]) -> Vec<&'a str> {
        declared
            .iter()
            .filter(|name| !self.contains(name))
            .map(String::as_str)
            .collect()
    }
}
