//! ExecutionContext - ordered, append-only record of one run
//!
//! Insertion order is execution order (not declaration order); a step that
//! runs several times (loop bodies) appears once per execution and lookups
//! by name return the latest entry.
//!
//! Parallel branches work on forks: `fork()` snapshots the context, each
//! branch appends to its private copy, and the executor merges the branch
//! deltas back with `merge()` in declared branch order.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::plan::ExprScope;

use super::result::{StepResult, TokenUsage};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    initial_prompt: Arc<Value>,
    /// Step results in execution order
    results: Vec<StepResult>,
    /// step name → position of its latest result
    latest: FxHashMap<String, usize>,
    /// Value implicitly feeding the next step
    cursor: Arc<Value>,
    usage: TokenUsage,
    agent_usage: BTreeMap<String, TokenUsage>,
}

impl ExecutionContext {
    /// Fresh context for one run, cursor seeded with the initial prompt
    pub fn new(initial_prompt: impl Into<Value>) -> Self {
        let prompt = Arc::new(initial_prompt.into());
        Self {
            cursor: Arc::clone(&prompt),
            initial_prompt: prompt,
            results: Vec::new(),
            latest: FxHashMap::default(),
            usage: TokenUsage::default(),
            agent_usage: BTreeMap::new(),
        }
    }

    pub fn initial_prompt(&self) -> &Arc<Value> {
        &self.initial_prompt
    }

    pub fn cursor(&self) -> &Arc<Value> {
        &self.cursor
    }

    pub fn set_cursor(&mut self, value: Arc<Value>) {
        self.cursor = value;
    }

    /// Append a result and accumulate its usage (monotonic)
    pub fn record(&mut self, result: StepResult) {
        self.usage += result.usage;
        *self
            .agent_usage
            .entry(result.agent_name.clone())
            .or_default() += result.usage;
        self.latest
            .insert(result.step_name.clone(), self.results.len());
        self.results.push(result);
    }

    /// Latest result recorded under `step`
    pub fn get(&self, step: &str) -> Option<&StepResult> {
        self.latest.get(step).map(|&i| &self.results[i])
    }

    /// Latest output recorded under `step`
    pub fn output(&self, step: &str) -> Option<&Arc<Value>> {
        self.get(step).map(|r| &r.output)
    }

    pub fn contains(&self, step: &str) -> bool {
        self.latest.contains_key(step)
    }

    /// All results in execution order
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    /// Every execution of `step`, oldest first
    pub fn results_for<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a StepResult> + 'a {
        self.results.iter().filter(move |r| r.step_name == step)
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.results.last()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Cumulative usage per agent name
    pub fn agent_usage(&self) -> &BTreeMap<String, TokenUsage> {
        &self.agent_usage
    }

    /// Snapshot for a parallel branch
    ///
    /// The fork shares nothing mutable with `self`; its new results start at
    /// position `self.len()`.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Results a fork produced after it was taken from a context of `base_len`
    pub fn delta_since(&self, base_len: usize) -> &[StepResult] {
        &self.results[base_len.min(self.results.len())..]
    }

    /// Append results produced elsewhere (a branch delta), in the given order
    pub fn merge<I>(&mut self, results: I)
    where
        I: IntoIterator<Item = StepResult>,
    {
        for result in results {
            self.record(result);
        }
    }

    /// Predicate view of this context
    pub fn scope(&self, iteration: u32) -> ContextScope<'_> {
        ContextScope {
            ctx: self,
            iteration,
        }
    }

    /// Latest output per step name plus the final cursor, for callers that
    /// want the whole run at once
    pub fn to_summary(&self) -> Value {
        let mut map = Map::new();
        map.insert("final_prompt".to_string(), (*self.cursor).clone());
        for r in &self.results {
            map.insert(r.step_name.clone(), (*r.output).clone());
        }
        Value::Object(map)
    }
}

/// `ExprScope` over an execution context
pub struct ContextScope<'a> {
    ctx: &'a ExecutionContext,
    iteration: u32,
}

impl ExprScope for ContextScope<'_> {
    fn input(&self) -> &Value {
        self.ctx.cursor()
    }

    fn iteration(&self) -> u32 {
        self.iteration
    }

    fn step_output(&self, name: &str) -> Option<&Value> {
        self.ctx.output(name).map(|v| v.as_ref())
    }
}
