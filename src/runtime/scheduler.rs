//! Scheduler - fires independent runs on a cron schedule
//!
//! Each firing is a fresh run through the same `Runner`. The scheduler keeps
//! only "when did I last fire", a firing counter and the last completed
//! firing's final value; a failed firing is logged and the next one proceeds
//! as usual.
//!
//! With a firing target (`event.agent` / `event.steps`) only the first
//! firing runs the whole workflow. Later firings run the target subplan on
//! the previous final value, or the whole workflow again while no firing has
//! completed yet.
//!
//! Stops when cancelled, after `max_runs`, or once the `exit` predicate holds
//! on a firing's final value.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{MaestroError, Result};
use crate::plan::{PlanNode, Predicate, Trigger};
use crate::store::value_text;

use super::runner::{RunOutcome, RunState, Runner};

/// Why the scheduler loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// `exit` predicate held
    Exit,
    MaxRuns,
    /// The cron expression has no upcoming time
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub firings: u32,
    pub failed: u32,
    pub stopped: StopReason,
}

pub struct Scheduler {
    runner: Runner,
    expr: String,
    schedule: Schedule,
    prompt: Option<String>,
    exit: Option<Predicate>,
    max_runs: Option<u32>,
    target: Option<Vec<PlanNode>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Scheduler for the plan's own `event:` block
    pub fn from_plan(runner: Runner, cancel: CancellationToken) -> Result<Self> {
        let trigger = runner
            .plan()
            .trigger
            .clone()
            .ok_or_else(|| MaestroError::Schedule {
                expr: String::new(),
                reason: format!("workflow '{}' has no event block", runner.plan().name),
            })?;
        Self::new(runner, &trigger, cancel)
    }

    pub fn new(runner: Runner, trigger: &Trigger, cancel: CancellationToken) -> Result<Self> {
        let schedule = Schedule::from_str(&trigger.cron).map_err(|e| MaestroError::Schedule {
            expr: trigger.cron.clone(),
            reason: e.to_string(),
        })?;
        info!(workflow = %runner.plan().name, schedule = %trigger.cron, "schedule registered");
        Ok(Self {
            runner,
            expr: trigger.cron.clone(),
            schedule,
            prompt: trigger.prompt.clone(),
            exit: trigger.exit.clone(),
            max_runs: trigger.max_runs,
            target: trigger.target.clone(),
            cancel,
        })
    }

    pub fn workflow(&self) -> &str {
        &self.runner.plan().name
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Next fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run the scheduler loop until a stop condition
    pub async fn run(&self) -> ScheduleSummary {
        self.run_with(|_| {}).await
    }

    /// Like [`run`](Self::run), handing every finished firing to `on_fire`
    pub async fn run_with<F>(&self, mut on_fire: F) -> ScheduleSummary
    where
        F: FnMut(&RunOutcome),
    {
        let mut firings = 0u32;
        let mut failed = 0u32;
        let mut last_fire: Option<DateTime<Utc>> = None;
        let mut last_final: Option<String> = None;

        let stopped = loop {
            if self.max_runs.is_some_and(|max| firings >= max) {
                break StopReason::MaxRuns;
            }

            let now = Utc::now();
            // Never fire the same instant twice
            let from = last_fire.map_or(now, |last| last.max(now));
            let Some(fire_at) = self.next_after(from) else {
                break StopReason::Exhausted;
            };
            let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            info!(
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_ms = delay.as_millis() as u64,
                "next firing scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break StopReason::Cancelled,
            }

            last_fire = Some(fire_at);
            firings += 1;
            info!(firing = firings, "firing scheduled run");

            let outcome = match (&self.target, &last_final) {
                (Some(nodes), Some(previous)) => {
                    info!(firing = firings, nodes = nodes.len(), "running firing target");
                    self.runner
                        .run_nodes(nodes, previous, self.cancel.child_token())
                        .await
                }
                _ => {
                    self.runner
                        .run_with_cancel(self.prompt.as_deref(), self.cancel.child_token())
                        .await
                }
            };
            match outcome.state {
                RunState::Completed => {
                    info!(firing = firings, run_id = %outcome.run_id, "scheduled run completed");
                    last_final = Some(value_text(outcome.final_output()).into_owned());
                }
                RunState::Cancelled => {
                    on_fire(&outcome);
                    break StopReason::Cancelled;
                }
                _ => {
                    failed += 1;
                    let message = outcome.error.as_ref().map(ToString::to_string).unwrap_or_default();
                    error!(firing = firings, run_id = %outcome.run_id, error = %message, "scheduled run failed");
                }
            }
            on_fire(&outcome);

            if self.should_exit(&outcome, firings) {
                break StopReason::Exit;
            }
        };

        info!(firings, failed, reason = ?stopped, "scheduler stopped");
        ScheduleSummary {
            firings,
            failed,
            stopped,
        }
    }

    fn should_exit(&self, outcome: &RunOutcome, firing: u32) -> bool {
        let Some(exit) = &self.exit else {
            return false;
        };
        if !outcome.is_completed() {
            return false;
        }
        match exit.evaluate(&outcome.context.scope(firing)) {
            Ok(done) => done,
            Err(reason) => {
                warn!(expr = %exit, reason = %reason, "exit predicate failed, continuing");
                false
            }
        }
    }
}
