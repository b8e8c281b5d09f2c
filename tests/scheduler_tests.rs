//! Scheduler: independent runs on a cron trigger

mod common;

use common::{bind, runner, workflow_with};
use maestro::agent::{AgentRegistry, MockAgent};
use maestro::runtime::{RunState, Scheduler, StopReason};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn scheduled(event: &str) -> String {
    workflow_with(
        "scheduled",
        &["poller"],
        "- name: poll\n  agent: poller\n",
        &format!("event:\n{}", event),
    )
}

#[tokio::test(start_paused = true)]
async fn failed_firing_does_not_stop_the_schedule() {
    let mut agents = AgentRegistry::new();
    let poller = bind(
        &mut agents,
        "poller",
        MockAgent::new("poller").fail_first(1),
    );
    let runner = runner(
        &scheduled("  cron: '* * * * * *'\n  max_runs: 3\n"),
        agents,
    );
    let scheduler = Scheduler::from_plan(runner, CancellationToken::new()).unwrap();

    let mut states = Vec::new();
    let summary = scheduler.run_with(|outcome| states.push(outcome.state)).await;

    assert_eq!(summary.firings, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stopped, StopReason::MaxRuns);
    assert_eq!(
        states,
        vec![RunState::Failed, RunState::Completed, RunState::Completed]
    );
    assert_eq!(poller.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn every_firing_is_a_fresh_run() {
    let runner = runner(
        &scheduled("  cron: '* * * * * *'\n  prompt: tick\n  max_runs: 2\n"),
        AgentRegistry::new().with("poller", MockAgent::new("poller")),
    );
    let scheduler = Scheduler::from_plan(runner, CancellationToken::new()).unwrap();

    let mut runs = Vec::new();
    scheduler
        .run_with(|outcome| {
            runs.push((
                outcome.run_id.clone(),
                outcome.context.len(),
                (**outcome.final_output()).clone(),
            ))
        })
        .await;

    assert_eq!(runs.len(), 2);
    assert_ne!(runs[0].0, runs[1].0);
    for (_, steps, output) in &runs {
        assert_eq!(*steps, 1);
        assert_eq!(*output, json!(common::echo("tick")));
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_between_firings() {
    let cancel = CancellationToken::new();
    let runner = runner(
        &scheduled("  cron: '* * * * * *'\n"),
        AgentRegistry::new().with("poller", MockAgent::new("poller")),
    );
    let scheduler = Scheduler::from_plan(runner, cancel.clone()).unwrap();

    let summary = scheduler
        .run_with(|_| {
            cancel.cancel();
        })
        .await;

    assert_eq!(summary.firings, 1);
    assert_eq!(summary.stopped, StopReason::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn later_firings_run_only_the_target_on_the_previous_value() {
    let mut agents = AgentRegistry::new();
    let fetcher = bind(&mut agents, "fetcher", MockAgent::new("fetcher"));
    let summarizer = bind(
        &mut agents,
        "summarizer",
        MockAgent::new("summarizer").with_instructions("summary of {input}"),
    );
    let yaml = workflow_with(
        "targeted",
        &["fetcher", "summarizer"],
        "- name: fetch\n  agent: fetcher\n- name: digest\n  agent: summarizer\n",
        "event:\n  cron: '* * * * * *'\n  max_runs: 3\n  agent: fetcher\n  steps: [digest]\n",
    );
    let scheduler = Scheduler::from_plan(runner(&yaml, agents), CancellationToken::new()).unwrap();

    let mut runs: Vec<Vec<String>> = Vec::new();
    scheduler
        .run_with(|outcome| {
            runs.push(
                outcome
                    .context
                    .results()
                    .iter()
                    .map(|r| r.step_name.clone())
                    .collect(),
            )
        })
        .await;

    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0], vec!["fetch", "digest"]);
    assert_eq!(runs[1], vec!["event.fetcher", "digest"]);
    assert_eq!(runs[2], vec!["event.fetcher", "digest"]);
    assert_eq!(fetcher.call_count(), 3);
    assert_eq!(summarizer.call_count(), 3);

    let first_final = format!("summary of {}", common::echo("x"));
    let second_fetch = &fetcher.requests()[1];
    assert_eq!(second_fetch.input, json!(first_final));
}

#[test]
fn workflow_without_event_cannot_be_scheduled() {
    let yaml = common::workflow("plain", &["poller"], "- name: poll\n  agent: poller\n");
    let runner = runner(
        &yaml,
        AgentRegistry::new().with("poller", MockAgent::new("poller")),
    );
    let err = Scheduler::from_plan(runner, CancellationToken::new())
        .err()
        .unwrap();
    assert_eq!(err.code(), "MAESTRO-051");
}
