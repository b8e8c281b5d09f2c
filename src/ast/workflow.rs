//! Workflow Types - the declarative workflow document
//!
//! Contains the core YAML-parsed types:
//! - `WorkflowDoc`: apiVersion / kind / metadata / spec envelope (raw)
//! - `WorkflowSpec`: the flattened, immutable workflow description
//! - `ExceptionSpec`: workflow-scoped exception handler
//! - `EventSpec`: recurrence schedule

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MaestroError;
use crate::util::API_VERSION_PREFIX;

use super::step::StepSpec;

/// Document metadata shared by workflow and agent documents
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Workflow document as written in YAML (raw)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDoc {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: WorkflowDocSpec,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowDocSpec {
    pub template: TemplateRaw,
}

#[derive(Debug, Deserialize)]
pub struct TemplateRaw {
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub exception: Option<ExceptionSpec>,
    #[serde(default)]
    pub event: Option<EventSpec>,
}

/// Workflow-scoped exception handler
///
/// Either a handler subplan (`steps`) or the shorthand `agent`, which runs a
/// single agent step named after `name` (or `exception` when absent).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExceptionSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl ExceptionSpec {
    /// Handler steps, expanding the `agent` shorthand
    pub fn handler_steps(&self) -> Vec<StepSpec> {
        match (&self.agent, self.steps.is_empty()) {
            (Some(agent), true) => vec![StepSpec::agent_step(
                self.name.as_deref().unwrap_or("exception"),
                agent.as_str(),
            )],
            _ => self.steps.clone(),
        }
    }
}

/// Recurrence schedule for repeated runs
///
/// ```yaml
/// event:
///   cron: "0 */5 * * * *"
///   prompt: "check the inbox"
///   exit: "input contains 'done'"
///   agent: summarizer        # optional firing target
///   steps: [triage]          # optional firing target
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventSpec {
    /// Cron expression (seconds precision, 6 or 7 fields)
    pub cron: String,
    /// Prompt seeded into every firing (defaults to the workflow prompt)
    #[serde(default)]
    pub prompt: Option<String>,
    /// Stop scheduling once this predicate holds on a firing's final value
    #[serde(default)]
    pub exit: Option<String>,
    /// Stop after this many firings
    #[serde(default)]
    pub max_runs: Option<u32>,
    /// Agent run by later firings on the previous final value
    #[serde(default)]
    pub agent: Option<String>,
    /// Top-level steps run by later firings (after `agent`, if any)
    #[serde(default)]
    pub steps: Vec<String>,
}

impl EventSpec {
    /// Whether later firings run a subset instead of the whole workflow
    pub fn has_target(&self) -> bool {
        self.agent.is_some() || !self.steps.is_empty()
    }
}

/// Validated workflow description. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Declared agent names, in order
    pub agents: Vec<String>,
    /// Initial prompt feeding the first step
    pub prompt: String,
    pub steps: Vec<StepSpec>,
    pub exception: Option<ExceptionSpec>,
    pub event: Option<EventSpec>,
}

impl WorkflowDoc {
    /// Check the envelope and flatten into a `WorkflowSpec`
    pub fn into_spec(self) -> Result<WorkflowSpec, MaestroError> {
        if !self.api_version.starts_with(API_VERSION_PREFIX) {
            return Err(MaestroError::InvalidApiVersion {
                version: self.api_version,
            });
        }
        if self.kind != "Workflow" {
            return Err(MaestroError::InvalidDocument {
                reason: format!("expected kind 'Workflow', got '{}'", self.kind),
            });
        }
        if self.metadata.name.trim().is_empty() {
            return Err(MaestroError::InvalidDocument {
                reason: "metadata.name is required".to_string(),
            });
        }

        let template = self.spec.template;
        Ok(WorkflowSpec {
            name: self.metadata.name,
            labels: self.metadata.labels,
            agents: template.agents,
            prompt: template.prompt,
            steps: template.steps,
            exception: template.exception,
            event: template.event,
        })
    }
}

impl WorkflowSpec {
    /// Parse a workflow YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self, MaestroError> {
        let doc: WorkflowDoc = serde_yaml::from_str(yaml)?;
        doc.into_spec()
    }

    /// Compute a hash of the workflow for audit correlation
    ///
    /// Uses xxhash3 over the canonical JSON form of the whole definition:
    /// name, prompt, agents, the full step tree, exception and event blocks.
    /// Returns a 16-character hex string (64-bit hash).
    pub fn compute_hash(&self) -> String {
        use xxhash_rust::xxh3::xxh3_64;

        let canonical = serde_json::to_vec(&(
            &self.name,
            &self.prompt,
            &self.agents,
            &self.steps,
            &self.exception,
            &self.event,
        ))
        .unwrap_or_else(|_| self.name.clone().into_bytes());

        format!("{:016x}", xxh3_64(&canonical))
    }
}
