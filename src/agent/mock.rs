//! MockAgent - deterministic stand-in for dry runs and tests
//!
//! Default answer: `"Mock agent: answer for <input>"`. Behaviour can be
//! scripted (fixed responses, instructions template, closure), delayed,
//! streamed in chunks, or made to fail.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::store::{value_text, TokenUsage};

use super::{Agent, AgentOutput, AgentRequest, ChunkSender};

pub const MOCK_ANSWER_PREFIX: &str = "Mock agent: answer for ";

type Responder = dyn Fn(&AgentRequest, u32) -> anyhow::Result<Value> + Send + Sync;

#[derive(Clone)]
enum Behavior {
    Echo,
    /// Instructions text with `{input}` substituted
    Instructions(String),
    /// Responses in call order; the last one repeats
    Script(Vec<Value>),
    Func(Arc<Responder>),
    Fail(String),
}

pub struct MockAgent {
    name: String,
    behavior: Behavior,
    latency: Duration,
    /// Calls that fail before the configured behaviour takes over
    fail_first: u32,
    chunked: bool,
    usage: Option<TokenUsage>,
    calls: AtomicU32,
    requests: Mutex<Vec<AgentRequest>>,
}

impl fmt::Debug for MockAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAgent")
            .field("name", &self.name)
            .field("latency", &self.latency)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Echo,
            latency: Duration::ZERO,
            fail_first: 0,
            chunked: false,
            usage: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `instructions`, replacing `{input}` with the input text
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.behavior = Behavior::Instructions(instructions.into());
        self
    }

    /// Answer each call with the next response; the last one repeats
    pub fn with_responses<I, V>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.behavior = Behavior::Script(responses.into_iter().map(Into::into).collect());
        self
    }

    /// Answer through a closure receiving the request and the 1-based call number
    pub fn with_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&AgentRequest, u32) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.behavior = Behavior::Func(Arc::new(f));
        self
    }

    /// Fail every call with `message`
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.behavior = Behavior::Fail(message.into());
        self
    }

    /// Fail the first `n` calls, then behave normally
    pub fn fail_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stream the answer word by word and return a `Null` output
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    /// Fixed usage per call (default: word counts of input and answer)
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.name
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }

    fn answer(&self, request: &AgentRequest, call: u32) -> anyhow::Result<Value> {
        if call <= self.fail_first {
            anyhow::bail!("{} failed on call {}", self.name, call);
        }
        let input = value_text(&request.input);
        match &self.behavior {
            Behavior::Echo => Ok(Value::String(format!("{}{}", MOCK_ANSWER_PREFIX, input))),
            Behavior::Instructions(text) => Ok(Value::String(text.replace("{input}", &input))),
            Behavior::Script(responses) => {
                let index = (call as usize - 1).min(responses.len().saturating_sub(1));
                Ok(responses.get(index).cloned().unwrap_or(Value::Null))
            }
            Behavior::Func(f) => f(request, call),
            Behavior::Fail(message) => anyhow::bail!("{}", message),
        }
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl Agent for MockAgent {
    async fn invoke(
        &self,
        request: &AgentRequest,
        chunks: Option<&ChunkSender>,
    ) -> anyhow::Result<AgentOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let output = self.answer(request, call)?;
        let usage = self.usage.unwrap_or_else(|| {
            TokenUsage::new(
                word_count(&value_text(&request.input)),
                word_count(&value_text(&output)),
            )
        });

        if let (true, Some(sender)) = (self.chunked, chunks) {
            let text = value_text(&output).into_owned();
            for (i, word) in text.split(' ').enumerate() {
                let chunk = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {}", word)
                };
                // Receiver gone means the step was abandoned; nothing to do
                let _ = sender.send(chunk);
            }
            return Ok(AgentOutput::new(Value::Null).with_usage(usage));
        }

        Ok(AgentOutput::new(output).with_usage(usage))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
