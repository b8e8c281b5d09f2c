//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use maestro::agent::{AgentRegistry, MockAgent};
use maestro::ast::WorkflowSpec;
use maestro::config::EngineConfig;
use maestro::event::StreamRecord;
use maestro::plan::{compile, ExecutablePlan};
use maestro::runtime::{RunHandle, RunOutcome, Runner};
use tokio_stream::StreamExt;

/// Full workflow document around a step list written at column 0
pub fn workflow(name: &str, agents: &[&str], steps: &str) -> String {
    let mut doc = format!(
        "apiVersion: maestro/v1alpha1\nkind: Workflow\nmetadata:\n  name: {}\nspec:\n  template:\n    agents: [{}]\n    prompt: x\n    steps:\n",
        name,
        agents.join(", ")
    );
    for line in steps.trim_matches('\n').lines() {
        doc.push_str("    ");
        doc.push_str(line);
        doc.push('\n');
    }
    doc
}

/// Same as [`workflow`], plus a trailing `template`-level block (`exception:`, `event:`)
pub fn workflow_with(name: &str, agents: &[&str], steps: &str, extra: &str) -> String {
    let mut doc = workflow(name, agents, steps);
    for line in extra.trim_matches('\n').lines() {
        doc.push_str("    ");
        doc.push_str(line);
        doc.push('\n');
    }
    doc
}

pub fn plan(yaml: &str) -> ExecutablePlan {
    plan_with(yaml, &EngineConfig::default())
}

pub fn plan_with(yaml: &str, config: &EngineConfig) -> ExecutablePlan {
    let spec = WorkflowSpec::from_yaml(yaml).expect("workflow parses");
    compile(&spec, config).expect("workflow compiles")
}

pub fn runner(yaml: &str, agents: AgentRegistry) -> Runner {
    runner_with(yaml, agents, EngineConfig::default())
}

pub fn runner_with(yaml: &str, agents: AgentRegistry, config: EngineConfig) -> Runner {
    let plan = plan_with(yaml, &config);
    Runner::new(plan, agents, config).expect("agents bound")
}

/// Registry with one echoing mock per name
pub fn echo_agents(names: &[&str]) -> AgentRegistry {
    names
        .iter()
        .fold(AgentRegistry::new(), |registry, name| {
            registry.with(*name, MockAgent::new(*name))
        })
}

/// Bind a shared mock so the test can inspect it afterwards
pub fn bind(registry: &mut AgentRegistry, name: &str, agent: MockAgent) -> Arc<MockAgent> {
    let agent = Arc::new(agent);
    registry.register(name, agent.clone());
    agent
}

/// Drain a streaming run: every record, then the outcome
pub async fn collect(handle: RunHandle) -> (Vec<StreamRecord>, RunOutcome) {
    let (mut events, join, _cancel) = handle.into_parts();
    let mut records = Vec::new();
    while let Some(record) = events.next().await {
        records.push(record);
    }
    (records, join.await.expect("run task"))
}

pub fn step_names(outcome: &RunOutcome) -> Vec<&str> {
    outcome
        .context
        .results()
        .iter()
        .map(|r| r.step_name.as_str())
        .collect()
}

pub fn terminal_count(records: &[StreamRecord]) -> usize {
    records.iter().filter(|r| r.is_terminal()).count()
}

pub fn echo(input: &str) -> String {
    format!("{}{}", maestro::agent::MOCK_ANSWER_PREFIX, input)
}
