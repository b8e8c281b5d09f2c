//! Step executor behaviour over compiled workflows
//!
//! Every test runs a real plan against `MockAgent`s:
//! 1. Sequential chains and input routing
//! 2. Conditionals
//! 3. Parallel fan-out, merge order, failure policies
//! 4. Loops and iteration caps
//! 5. Handlers at step, branch and workflow scope
//! 6. Cancellation, timeouts, streaming agents, token usage

mod common;

use std::time::Duration;

use common::*;
use maestro::agent::{AgentRegistry, MockAgent};
use maestro::config::{EngineConfig, LoopExceeded, ParallelPolicy};
use maestro::event::{EventKind, StreamRecord};
use maestro::runtime::RunState;
use maestro::store::TokenUsage;
use pretty_assertions::assert_eq;
use rand::Rng;
use serde_json::json;
use tokio_stream::StreamExt;

// ============================================================================
// SEQUENTIAL
// ============================================================================

#[tokio::test]
async fn sequential_chain_threads_the_cursor() {
    let yaml = workflow(
        "chain",
        &["a", "b", "c"],
        r#"
- name: first
  agent: a
- name: second
  agent: b
- name: third
  agent: c
"#,
    );
    let outcome = runner(&yaml, echo_agents(&["a", "b", "c"])).run(None).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(step_names(&outcome), vec!["first", "second", "third"]);
    assert_eq!(
        **outcome.final_output(),
        json!(echo(&echo(&echo("x"))))
    );
    assert_eq!(outcome.response().unwrap().response, echo(&echo(&echo("x"))));
}

#[tokio::test]
async fn from_routes_previous_output_and_final_response_is_last_output() {
    let mut agents = AgentRegistry::new();
    let a = bind(&mut agents, "a", MockAgent::new("a"));
    let b = bind(&mut agents, "b", MockAgent::new("b").with_instructions("analysis of {input}"));
    let yaml = workflow(
        "fetch-analyze",
        &["a", "b"],
        r#"
- name: fetch
  agent: a
- name: analyze
  agent: b
  from: [fetch]
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;

    assert_eq!(a.requests()[0].input, json!("x"));
    let fetched = outcome.context.output("fetch").unwrap();
    assert_eq!(b.requests()[0].input, **fetched);
    assert_eq!(
        outcome.response().unwrap().response,
        format!("analysis of {}", echo("x"))
    );
}

#[tokio::test]
async fn instructions_input_reads_the_documented_agent_instructions() {
    let mut agents = AgentRegistry::new();
    agents.document("planner", "List three risks.");
    agents.register("planner", std::sync::Arc::new(MockAgent::new("planner")));
    let reviewer = bind(&mut agents, "reviewer", MockAgent::new("reviewer"));
    let yaml = workflow(
        "instructions-input",
        &["planner", "reviewer"],
        r#"
- name: plan
  agent: planner
- name: review
  agent: reviewer
  from: [plan, "instructions:plan"]
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;

    assert_eq!(outcome.state, RunState::Completed);
    let request = &reviewer.requests()[0];
    assert_eq!(request.parts[1], json!("List three risks."));
    assert!(request.input.as_str().unwrap().ends_with("\n\nList three risks."));
    assert_eq!(request.instructions, None);
}

#[tokio::test]
async fn undocumented_instructions_fail_the_step() {
    let yaml = workflow(
        "no-docs",
        &["a", "b"],
        "- name: one\n  agent: a\n- name: two\n  agent: b\n  from: [\"instructions:one\"]\n",
    );
    let outcome = runner(&yaml, echo_agents(&["a", "b"])).run(None).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.failed_step.as_deref(), Some("two"));
    assert!(outcome
        .error
        .as_ref()
        .unwrap()
        .to_string()
        .contains("instructions:one"));
}

#[tokio::test]
async fn stream_lines_follow_the_client_key_contract() {
    let yaml = workflow("wire", &["a", "b"], "- name: one\n  agent: a\n- name: two\n  agent: b\n");
    let (records, _) = collect(runner(&yaml, echo_agents(&["a", "b"])).stream(None)).await;

    let mut steps = Vec::new();
    let mut completion = None;
    for record in &records {
        let line = record.to_line().unwrap();
        let data: serde_json::Value =
            serde_json::from_str(line.trim_end().strip_prefix("data: ").unwrap()).unwrap();
        if data.get("step_name").is_some() {
            for key in ["step_name", "step_result", "agent_name", "step_complete"] {
                assert!(data.get(key).is_some(), "missing {} in {}", key, data);
            }
            steps.push(data);
        } else if data.get("workflow_complete").is_some() {
            completion = Some(data);
        }
    }

    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s["step_complete"] == json!(true)));
    assert_eq!(completion.unwrap()["workflow_complete"], json!(true));
}

#[tokio::test]
async fn error_line_is_not_mistaken_for_a_step() {
    let agents = AgentRegistry::new().with("a", MockAgent::new("a").failing("down"));
    let yaml = workflow("wire-error", &["a"], "- name: one\n  agent: a\n");
    let (records, _) = collect(runner(&yaml, agents).stream(None)).await;

    assert_eq!(records.len(), 1);
    let line = records[0].to_line().unwrap();
    assert!(!line.contains("\"step_name\""));
    assert!(!line.contains("\"workflow_complete\""));
    assert!(line.contains("\"failed_step\":\"one\""));
}

#[tokio::test]
async fn final_response_lists_latest_step_outputs() {
    let yaml = workflow("summary", &["a", "b"], "- name: one\n  agent: a\n- name: two\n  agent: b\n");
    let outcome = runner(&yaml, echo_agents(&["a", "b"])).run(None).await;

    let response = outcome.response().unwrap();
    assert_eq!(response.steps["one"], json!(echo("x")));
    assert_eq!(response.steps["final_prompt"], json!(echo(&echo("x"))));
}

#[tokio::test]
async fn prompt_override_seeds_the_first_step() {
    let yaml = workflow("seed", &["a"], "- name: only\n  agent: a\n");
    let outcome = runner(&yaml, echo_agents(&["a"])).run(Some("hello")).await;
    assert_eq!(**outcome.final_output(), json!(echo("hello")));
}

#[tokio::test]
async fn from_joins_steps_prompt_and_literals() {
    let mut agents = echo_agents(&["a"]);
    let reader = bind(&mut agents, "reader", MockAgent::new("reader"));
    let yaml = workflow(
        "routing",
        &["a", "reader"],
        r#"
- name: fetch
  agent: a
- name: combine
  agent: reader
  from: [prompt, fetch, "be brief"]
  context: ["formal tone"]
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;
    assert!(outcome.is_completed());

    let request = &reader.requests()[0];
    assert_eq!(request.parts.len(), 3);
    assert_eq!(
        request.input,
        json!(format!("x\n\n{}\n\nbe brief", echo("x")))
    );
    assert_eq!(request.context, vec!["formal tone"]);
}

#[tokio::test]
async fn single_from_part_passes_value_unchanged() {
    let mut agents = AgentRegistry::new().with(
        "maker",
        MockAgent::new("maker").with_responses([json!({"score": 7})]),
    );
    let reader = bind(&mut agents, "reader", MockAgent::new("reader"));
    let yaml = workflow(
        "structured",
        &["maker", "reader"],
        r#"
- name: make
  agent: maker
- name: noise
  agent: maker
- name: read
  agent: reader
  from: [make]
"#,
    );
    runner(&yaml, agents).run(None).await;
    assert_eq!(reader.requests()[0].input, json!({"score": 7}));
}

#[tokio::test]
async fn outputs_reemit_prior_results_after_own_output() {
    let agents = AgentRegistry::new()
        .with("a", MockAgent::new("a").with_responses(["facts"]))
        .with("b", MockAgent::new("b").with_responses(["summary"]));
    let yaml = workflow(
        "outputs",
        &["a", "b"],
        r#"
- name: fetch
  agent: a
- name: summarize
  agent: b
  outputs: [fetch]
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;
    assert_eq!(**outcome.final_output(), json!("summary\n\nfacts"));
    // The step's own result is untouched
    assert_eq!(**outcome.context.output("summarize").unwrap(), json!("summary"));
}

// ============================================================================
// CONDITIONAL
// ============================================================================

fn routing_workflow() -> String {
    workflow(
        "route",
        &["judge", "a"],
        r#"
- name: decide
  agent: judge
- name: route
  if: "input contains 'yes'"
  then:
    - name: approve
      agent: a
  else:
    - name: reject
      agent: a
"#,
    )
}

#[tokio::test]
async fn conditional_runs_matching_arm_only() {
    for (verdict, expected) in [("yes please", "approve"), ("no thanks", "reject")] {
        let agents = AgentRegistry::new()
            .with("judge", MockAgent::new("judge").with_responses([verdict]))
            .with("a", MockAgent::new("a"));
        let runner = runner(&routing_workflow(), agents);
        let outcome = runner.run(None).await;
        assert_eq!(step_names(&outcome), vec!["decide", expected]);

        let selected: Vec<String> = runner
            .event_log()
            .events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::BranchSelected { branch, .. } => Some(branch),
                _ => None,
            })
            .collect();
        let label = if expected == "approve" {
            "input contains 'yes'"
        } else {
            "otherwise"
        };
        assert_eq!(selected, vec![label]);
    }
}

#[tokio::test]
async fn case_without_match_or_default_is_a_no_op() {
    let yaml = workflow(
        "case",
        &["a"],
        r#"
- name: start
  agent: a
- name: pick
  case:
    - when: "input == 'left'"
      do:
        - name: go_left
          agent: a
    - when: "input == 'right'"
      do:
        - name: go_right
          agent: a
- name: end
  agent: a
"#,
    );
    let outcome = runner(&yaml, echo_agents(&["a"])).run(None).await;
    assert_eq!(step_names(&outcome), vec!["start", "end"]);
    assert_eq!(**outcome.final_output(), json!(echo(&echo("x"))));
}

#[tokio::test]
async fn case_picks_first_true_arm() {
    let agents = AgentRegistry::new()
        .with("judge", MockAgent::new("judge").with_responses(["42"]))
        .with("a", MockAgent::new("a"));
    let yaml = workflow(
        "first-match",
        &["judge", "a"],
        r#"
- name: score
  agent: judge
- name: grade
  case:
    - when: "input > 40"
      do:
        - name: high
          agent: a
    - when: "input > 10"
      do:
        - name: medium
          agent: a
  default:
    - name: low
      agent: a
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;
    assert_eq!(step_names(&outcome), vec!["score", "high"]);
}

// ============================================================================
// PARALLEL
// ============================================================================

fn fan_workflow() -> String {
    workflow(
        "fan",
        &["a", "b", "c"],
        r#"
- name: fan
  parallel: [a, b, c]
"#,
    )
}

fn jittery(name: &str) -> MockAgent {
    let ms = rand::thread_rng().gen_range(0..25);
    MockAgent::new(name)
        .with_instructions(format!("{}:{{input}}", name))
        .with_latency(Duration::from_millis(ms))
}

#[tokio::test]
async fn parallel_merge_order_ignores_completion_order() {
    for _ in 0..5 {
        let agents = AgentRegistry::new()
            .with("a", jittery("a"))
            .with("b", jittery("b"))
            .with("c", jittery("c"));
        let outcome = runner(&fan_workflow(), agents).run(None).await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(step_names(&outcome), vec!["fan.a", "fan.b", "fan.c"]);
        assert_eq!(**outcome.final_output(), json!(["a:x", "b:x", "c:x"]));
    }
}

#[tokio::test]
async fn branches_start_from_the_same_cursor() {
    let mut agents = echo_agents(&["a", "c"]);
    let b = bind(&mut agents, "b", MockAgent::new("b"));
    runner(&fan_workflow(), agents).run(Some("seed")).await;
    assert_eq!(b.requests()[0].input, json!("seed"));
}

fn failing_fan(handler: bool) -> String {
    let bad_branch = if handler {
        "  - name: bad\n    steps:\n      - name: bad_1\n        agent: bad\n    exception:\n      - name: bad_fix\n        agent: fixer\n"
    } else {
        "  - name: bad\n    steps:\n      - name: bad_1\n        agent: bad\n"
    };
    let steps = format!(
        "- name: fan\n  parallel:\n  - name: slow\n    steps:\n      - name: slow_1\n        agent: slow\n      - name: slow_2\n        agent: after\n{}",
        bad_branch
    );
    workflow("failing-fan", &["slow", "after", "bad", "fixer"], &steps)
}

fn failing_agents() -> (AgentRegistry, std::sync::Arc<MockAgent>, std::sync::Arc<MockAgent>) {
    let mut agents = AgentRegistry::new()
        .with(
            "slow",
            MockAgent::new("slow")
                .with_instructions("slow done")
                .with_latency(Duration::from_millis(80)),
        )
        .with("bad", MockAgent::new("bad").failing("boom"));
    let after = bind(&mut agents, "after", MockAgent::new("after"));
    let fixer = bind(
        &mut agents,
        "fixer",
        MockAgent::new("fixer").with_instructions("fixed: {input}"),
    );
    (agents, after, fixer)
}

#[tokio::test]
async fn fail_fast_stops_siblings_at_next_boundary() {
    let (agents, after, _) = failing_agents();
    let handle = runner(&failing_fan(false), agents).stream(None);
    let (records, outcome) = collect(handle).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.failed_step.as_deref(), Some("bad_1"));
    assert_eq!(outcome.error.as_ref().unwrap().code(), "MAESTRO-030");
    assert_eq!(after.call_count(), 0);

    assert_eq!(terminal_count(&records), 1);
    match records.last() {
        Some(StreamRecord::Error {
            failed_step,
            failed_agent,
            error,
            code,
            step_complete,
        }) => {
            assert_eq!(failed_step.as_deref(), Some("bad_1"));
            assert_eq!(failed_agent.as_deref(), Some("bad"));
            assert!(error.contains("boom"));
            assert_eq!(code, "MAESTRO-030");
            assert!(!step_complete);
        }
        other => panic!("expected terminal error, got {:?}", other),
    }
}

#[tokio::test]
async fn wait_all_lets_siblings_finish() {
    let (agents, after, _) = failing_agents();
    let config = EngineConfig {
        parallel_policy: ParallelPolicy::WaitAll,
        ..EngineConfig::default()
    };
    let outcome = runner_with(&failing_fan(false), agents, config)
        .run(None)
        .await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.failed_step.as_deref(), Some("bad_1"));
    assert_eq!(after.call_count(), 1);
    // Partial branch work is kept
    assert!(outcome.context.contains("slow_2"));
}

#[tokio::test]
async fn every_failed_branch_is_reported_once() {
    let agents = AgentRegistry::new()
        .with("b1", MockAgent::new("b1").failing("first down"))
        .with(
            "b2",
            MockAgent::new("b2")
                .failing("second down")
                .with_latency(Duration::from_millis(10)),
        );
    let config = EngineConfig {
        parallel_policy: ParallelPolicy::WaitAll,
        ..EngineConfig::default()
    };
    let yaml = workflow("double-fault", &["b1", "b2"], "- name: fan\n  parallel: [b1, b2]\n");
    let (records, outcome) = collect(runner_with(&yaml, agents, config).stream(None)).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.failed_step.as_deref(), Some("fan.b1"));
    assert_eq!(records.len(), 2);
    let extra = records[0].as_step().unwrap();
    assert_eq!(extra.step_name, "fan.b2");
    assert!(!extra.step_complete);
    assert!(extra.error.as_deref().unwrap().contains("second down"));
    assert!(matches!(
        &records[1],
        StreamRecord::Error { failed_step: Some(step), .. } if step == "fan.b1"
    ));
}

#[tokio::test]
async fn fail_fast_reports_a_sibling_failing_in_flight() {
    let agents = AgentRegistry::new()
        .with("quick", MockAgent::new("quick").failing("quick down"))
        .with(
            "late",
            MockAgent::new("late")
                .failing("late down")
                .with_latency(Duration::from_millis(30)),
        );
    let yaml = workflow("in-flight", &["quick", "late"], "- name: fan\n  parallel: [late, quick]\n");
    let (records, outcome) = collect(runner(&yaml, agents).stream(None)).await;

    assert_eq!(outcome.failed_step.as_deref(), Some("fan.quick"));
    assert_eq!(terminal_count(&records), 1);
    let steps: Vec<_> = records.iter().filter_map(StreamRecord::as_step).collect();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step_name, "fan.late");
    assert!(!steps[0].step_complete);
}

#[tokio::test]
async fn branch_handler_keeps_failure_local() {
    let (agents, after, fixer) = failing_agents();
    let runner = runner(&failing_fan(true), agents);
    let (records, outcome) = collect(runner.stream(None)).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(after.call_count(), 1);
    assert_eq!(fixer.call_count(), 1);
    assert_eq!(step_names(&outcome), vec!["slow_1", "slow_2", "bad_fix"]);

    let cursor = outcome.final_output();
    let fixed = cursor[1].as_str().unwrap();
    assert!(fixed.starts_with("fixed: "));
    assert!(fixed.contains("boom"));

    let absorbed: Vec<_> = records
        .iter()
        .filter_map(StreamRecord::as_step)
        .filter(|e| !e.step_complete)
        .collect();
    assert_eq!(absorbed.len(), 1);
    assert_eq!(absorbed[0].step_name, "bad_1");
    assert!(absorbed[0].error.as_deref().unwrap().contains("boom"));
    assert!(matches!(records.last(), Some(StreamRecord::WorkflowComplete { .. })));
}

#[tokio::test]
async fn node_handler_absorbs_branch_failure() {
    let agents = AgentRegistry::new()
        .with("a", MockAgent::new("a"))
        .with("bad", MockAgent::new("bad").failing("nope"))
        .with("fixer", MockAgent::new("fixer").with_instructions("recovered"));
    let yaml = workflow(
        "node-handler",
        &["a", "bad", "fixer"],
        r#"
- name: fan
  parallel: [a, bad]
  exception:
    - name: fan_fix
      agent: fixer
- name: next
  agent: a
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;
    assert_eq!(outcome.state, RunState::Completed);
    assert!(outcome.context.contains("fan_fix"));
    assert_eq!(**outcome.final_output(), json!(echo("recovered")));
}

// ============================================================================
// LOOP
// ============================================================================

fn loop_workflow(max: u32) -> String {
    workflow(
        "loop",
        &["writer", "a"],
        &format!(
            r#"
- name: refine
  loop:
    steps:
      - name: draft
        agent: writer
    until: "input contains 'ok'"
    max_iterations: {}
- name: publish
  agent: a
"#,
            max
        ),
    )
}

#[tokio::test]
async fn loop_runs_until_predicate_holds() {
    let agents = AgentRegistry::new()
        .with(
            "writer",
            MockAgent::new("writer").with_responses(["draft 1", "draft 2", "final ok"]),
        )
        .with("a", MockAgent::new("a"));
    let runner = runner(&loop_workflow(5), agents);
    let outcome = runner.run(None).await;

    assert_eq!(outcome.state, RunState::Completed);
    let iterations: Vec<Option<u32>> = outcome
        .context
        .results_for("draft")
        .map(|r| r.iteration)
        .collect();
    assert_eq!(iterations, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(**outcome.final_output(), json!(echo("final ok")));

    let exits: Vec<(u32, String)> = runner
        .event_log()
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::LoopExited {
                iterations, reason, ..
            } => Some((iterations, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(exits, vec![(3, "until".to_string())]);
}

#[tokio::test]
async fn loop_threads_cursor_between_iterations() {
    let mut agents = echo_agents(&["a"]);
    let writer = bind(
        &mut agents,
        "writer",
        MockAgent::new("writer").with_responses(["v1", "v2 ok"]),
    );
    runner(&loop_workflow(5), agents).run(None).await;

    let inputs: Vec<_> = writer.requests().into_iter().map(|r| r.input).collect();
    assert_eq!(inputs, vec![json!("x"), json!("v1")]);
}

#[tokio::test]
async fn loop_cap_raises_loop_bound_exceeded() {
    let mut agents = echo_agents(&["a"]);
    let writer = bind(
        &mut agents,
        "writer",
        MockAgent::new("writer").with_responses(["never done"]),
    );
    let outcome = runner(&loop_workflow(3), agents).run(None).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(outcome.error.as_ref().unwrap().code(), "MAESTRO-034");
    assert_eq!(outcome.failed_step.as_deref(), Some("refine"));
    assert_eq!(writer.call_count(), 3);
    assert!(!outcome.context.contains("publish"));
}

#[tokio::test]
async fn loop_cap_stop_policy_continues() {
    let agents = AgentRegistry::new()
        .with("writer", MockAgent::new("writer").with_responses(["never done"]))
        .with("a", MockAgent::new("a"));
    let config = EngineConfig {
        loop_exceeded: LoopExceeded::Stop,
        ..EngineConfig::default()
    };
    let outcome = runner_with(&loop_workflow(2), agents, config).run(None).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(outcome.context.results_for("draft").count(), 2);
    assert!(outcome.context.contains("publish"));
}

#[tokio::test]
async fn until_can_read_iteration() {
    let yaml = workflow(
        "counted",
        &["a"],
        r#"
- name: repeat
  loop:
    agent: a
    until: "iteration >= 4"
    max_iterations: 10
"#,
    );
    let outcome = runner(&yaml, echo_agents(&["a"])).run(None).await;
    assert_eq!(outcome.context.results_for("repeat.a").count(), 4);
}

// ============================================================================
// HANDLERS
// ============================================================================

#[tokio::test]
async fn step_handler_receives_error_and_flow_resumes() {
    let mut agents = AgentRegistry::new()
        .with("bad", MockAgent::new("bad").failing("boom"))
        .with("a", MockAgent::new("a"));
    let fixer = bind(
        &mut agents,
        "fixer",
        MockAgent::new("fixer").with_instructions("fixed: {input}"),
    );
    let yaml = workflow(
        "step-handler",
        &["bad", "fixer", "a"],
        r#"
- name: risky
  agent: bad
  exception:
    - name: fallback
      agent: fixer
- name: next
  agent: a
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(step_names(&outcome), vec!["fallback", "next"]);
    let handler_input = fixer.requests()[0].input.clone();
    let text = handler_input.as_str().unwrap();
    assert!(text.contains("risky"));
    assert!(text.contains("boom"));
    assert_eq!(
        **outcome.final_output(),
        json!(echo(&format!("fixed: {}", text)))
    );
}

#[tokio::test]
async fn failing_handler_escalates_to_enclosing_handler() {
    let agents = AgentRegistry::new()
        .with("bad", MockAgent::new("bad").failing("boom"))
        .with("worse", MockAgent::new("worse").failing("still broken"))
        .with("fixer", MockAgent::new("fixer").with_instructions("outer fixed"));
    let yaml = workflow(
        "escalate",
        &["bad", "worse", "fixer"],
        r#"
- name: outer
  loop:
    steps:
      - name: inner
        agent: bad
        exception:
          - name: inner_fix
            agent: worse
    until: "true"
  exception:
    - name: outer_fix
      agent: fixer
"#,
    );
    let outcome = runner(&yaml, agents).run(None).await;
    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(**outcome.final_output(), json!("outer fixed"));
}

#[tokio::test]
async fn workflow_handler_ends_the_run_completed() {
    let mut agents = AgentRegistry::new()
        .with("bad", MockAgent::new("bad").failing("boom"))
        .with("fixer", MockAgent::new("fixer").with_instructions("apology"));
    let a = bind(&mut agents, "a", MockAgent::new("a"));
    let yaml = workflow_with(
        "wf-handler",
        &["bad", "fixer", "a"],
        r#"
- name: first
  agent: bad
- name: second
  agent: a
"#,
        "exception:\n  agent: fixer\n",
    );
    let runner = runner(&yaml, agents);
    let (records, outcome) = collect(runner.stream(None)).await;

    assert_eq!(outcome.state, RunState::Completed);
    assert_eq!(a.call_count(), 0);
    assert_eq!(step_names(&outcome), vec!["exception"]);
    assert_eq!(outcome.response().unwrap().response, "apology");
    assert_eq!(terminal_count(&records), 1);

    let owners: Vec<String> = runner
        .event_log()
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::HandlerInvoked { owner, .. } => Some(owner.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(owners, vec!["workflow"]);
}

#[tokio::test]
async fn unhandled_failure_fails_run_with_one_terminal_error() {
    let mut agents = AgentRegistry::new()
        .with("a", MockAgent::new("a"))
        .with("bad", MockAgent::new("bad").failing("boom"));
    let c = bind(&mut agents, "c", MockAgent::new("c"));
    let yaml = workflow(
        "unhandled",
        &["a", "bad", "c"],
        r#"
- name: ok
  agent: a
- name: broken
  agent: bad
- name: never
  agent: c
"#,
    );
    let (records, outcome) = collect(runner(&yaml, agents).stream(None)).await;

    assert_eq!(outcome.state, RunState::Failed);
    assert_eq!(c.call_count(), 0);
    assert_eq!(records.len(), 2);
    assert!(records[0].as_step().unwrap().step_complete);
    assert_eq!(terminal_count(&records), 1);
    assert!(matches!(
        &records[1],
        StreamRecord::Error { failed_step: Some(step), .. } if step == "broken"
    ));
    let err = outcome.into_response().unwrap_err();
    assert_eq!(err.code(), "MAESTRO-030");
}

// ============================================================================
// CANCELLATION, TIMEOUTS, STREAMING, USAGE
// ============================================================================

#[tokio::test]
async fn cancellation_during_parallel_ends_cancelled() {
    let slow = |name: &str| MockAgent::new(name).with_latency(Duration::from_millis(60));
    let mut agents = AgentRegistry::new().with("a", slow("a")).with("b", slow("b"));
    let tail = bind(&mut agents, "tail", MockAgent::new("tail"));
    let fixer = bind(&mut agents, "fixer", MockAgent::new("fixer"));
    let yaml = workflow_with(
        "cancel",
        &["a", "b", "tail", "fixer"],
        r#"
- name: fan
  parallel:
    - name: left
      steps:
        - name: left_1
          agent: a
        - name: left_2
          agent: tail
    - name: right
      steps:
        - name: right_1
          agent: b
        - name: right_2
          agent: tail
"#,
        "exception:\n  agent: fixer\n",
    );
    let (mut events, join, token) = runner(&yaml, agents).stream(None).into_parts();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let mut records = Vec::new();
    while let Some(record) = events.next().await {
        records.push(record);
    }
    let outcome = join.await.unwrap();

    assert_eq!(outcome.state, RunState::Cancelled);
    assert!(outcome.error.as_ref().unwrap().is_cancelled());
    assert_eq!(tail.call_count(), 0);
    assert_eq!(fixer.call_count(), 0);
    assert_eq!(terminal_count(&records), 1);
    assert!(matches!(records.last(), Some(StreamRecord::Cancelled { .. })));
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_run() {
    let mut agents = AgentRegistry::new().with(
        "a",
        MockAgent::new("a").with_latency(Duration::from_millis(10)),
    );
    let b = bind(&mut agents, "b", MockAgent::new("b"));
    let yaml = workflow(
        "drop",
        &["a", "b"],
        "- name: one\n  agent: a\n- name: two\n  agent: b\n",
    );
    let handle = runner(&yaml, agents).stream(None);
    let (events, join, _cancel) = handle.into_parts();
    drop(events);

    let outcome = join.await.unwrap();
    assert_eq!(outcome.state, RunState::Cancelled);
    assert_eq!(b.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_fails_the_step() {
    let agents = AgentRegistry::new().with(
        "slow",
        MockAgent::new("slow").with_latency(Duration::from_secs(5)),
    );
    let yaml = workflow(
        "timeout",
        &["slow"],
        "- name: wait\n  agent: slow\n  timeout_ms: 20\n",
    );
    let outcome = runner(&yaml, agents).run(None).await;

    assert_eq!(outcome.state, RunState::Failed);
    let err = outcome.error.unwrap();
    assert_eq!(err.code(), "MAESTRO-030");
    assert!(err.to_string().contains("timed out after 20ms"));
}

#[tokio::test]
async fn streamed_chunks_aggregate_into_one_result() {
    let agents = AgentRegistry::new().with("s", MockAgent::new("s").chunked());
    let yaml = workflow("chunks", &["s"], "- name: talk\n  agent: s\n");
    let (records, outcome) = collect(runner(&yaml, agents).stream(Some("a b c"))).await;

    assert_eq!(**outcome.final_output(), json!(echo("a b c")));
    assert_eq!(outcome.context.len(), 1);
    let steps: Vec<_> = records.iter().filter_map(StreamRecord::as_step).collect();
    assert_eq!(steps.len(), 1);
    assert_eq!(*steps[0].step_result, json!(echo("a b c")));
}

#[tokio::test]
async fn usage_totals_per_run_and_agent() {
    let agents = AgentRegistry::new()
        .with("a", MockAgent::new("a").with_usage(TokenUsage::new(3, 4)))
        .with("b", MockAgent::new("b").with_usage(TokenUsage::new(1, 1)));
    let yaml = workflow(
        "usage",
        &["a", "b"],
        "- name: one\n  agent: a\n- name: two\n  agent: b\n- name: three\n  agent: a\n",
    );
    let (records, outcome) = collect(runner(&yaml, agents).stream(None)).await;

    assert_eq!(outcome.usage(), TokenUsage::new(7, 9));
    assert_eq!(outcome.context.agent_usage()["a"], TokenUsage::new(6, 8));
    match records.last() {
        Some(StreamRecord::WorkflowComplete {
            token_usage,
            agent_usage,
            ..
        }) => {
            assert_eq!(*token_usage, TokenUsage::new(7, 9));
            assert_eq!(agent_usage["b"], TokenUsage::new(1, 1));
        }
        other => panic!("expected workflow_complete, got {:?}", other),
    }
}

#[tokio::test]
async fn step_indices_are_contiguous() {
    let agents = AgentRegistry::new()
        .with("a", jittery("a"))
        .with("b", jittery("b"))
        .with("c", jittery("c"));
    let (records, _) = collect(runner(&fan_workflow(), agents).stream(None)).await;
    let indices: Vec<usize> = records
        .iter()
        .filter_map(StreamRecord::as_step)
        .map(|e| e.step_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn runs_are_independent() {
    let runner = runner(&fan_workflow(), echo_agents(&["a", "b", "c"]));
    let (first, second) = tokio::join!(runner.run(Some("one")), runner.run(Some("two")));
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.final_output()[0], json!(echo("one")));
    assert_eq!(second.final_output()[0], json!(echo("two")));
}
