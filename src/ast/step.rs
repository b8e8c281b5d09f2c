//! Step Types - one entry of `spec.template.steps`
//!
//! A step declares its control-flow kind through mutually exclusive keys:
//!
//! ```yaml
//! - name: fetch            # agent step
//!   agent: fetcher
//!   from: [prompt]
//! - name: route            # conditional
//!   if: "input contains 'yes'"
//!   then: [...]
//!   else: [...]
//! - name: pick             # case / do
//!   case:
//!     - when: "input == 'a'"
//!       do: [...]
//!   default: [...]
//! - name: fan              # parallel
//!   parallel: [agent_a, { name: right, steps: [...] }]
//! - name: refine           # loop
//!   loop: { steps: [...], until: "input contains 'ok'", max_iterations: 5 }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::MaestroError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepSpec {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Agent invoked by this step (agent steps only)
    #[serde(default)]
    pub agent: Option<String>,

    /// Explicit input routing: prior step names, `prompt`, or literal strings
    #[serde(default)]
    pub from: Vec<String>,

    /// Auxiliary literal strings passed alongside the input
    #[serde(default)]
    pub context: Vec<String>,

    /// Prior step names re-emitted after this step's own output
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Per-call timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,

    #[serde(default)]
    pub then: Option<Vec<StepSpec>>,

    #[serde(default, rename = "else")]
    pub otherwise: Option<Vec<StepSpec>>,

    #[serde(default)]
    pub case: Option<Vec<CaseArm>>,

    #[serde(default)]
    pub default: Option<Vec<StepSpec>>,

    #[serde(default)]
    pub parallel: Option<Vec<BranchSpec>>,

    #[serde(default, rename = "loop")]
    pub loop_spec: Option<LoopSpec>,

    /// Handler scoped to this step and everything nested in it
    #[serde(default)]
    pub exception: Option<Vec<StepSpec>>,
}

/// One `case:` arm
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaseArm {
    pub when: String,
    #[serde(rename = "do")]
    pub steps: Vec<StepSpec>,
}

/// One branch of a `parallel:` step
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BranchSpec {
    /// Shorthand: a single agent step named `<parallel step>.<agent>`
    Agent(String),
    Block {
        #[serde(default)]
        name: Option<String>,
        steps: Vec<StepSpec>,
        /// Handler scoped to this branch only
        #[serde(default)]
        exception: Option<Vec<StepSpec>>,
    },
}

/// Body and termination of a `loop:` step
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Shorthand body: a single agent step named `<loop step>.<agent>`
    #[serde(default)]
    pub agent: Option<String>,
    pub until: String,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

/// Borrowed view of the control-flow kind a step declares
#[derive(Debug, Clone, Copy)]
pub enum StepKind<'a> {
    Agent(&'a str),
    If {
        predicate: &'a str,
        then: &'a [StepSpec],
        otherwise: Option<&'a [StepSpec]>,
    },
    Case {
        arms: &'a [CaseArm],
        default: Option<&'a [StepSpec]>,
    },
    Parallel(&'a [BranchSpec]),
    Loop(&'a LoopSpec),
}

impl StepSpec {
    /// Resolve which control-flow kind this step declares
    ///
    /// Exactly one of `agent`, `if`, `case`, `parallel`, `loop` must be present.
    /// Keys belonging to another kind (`then` without `if`, `default` without
    /// `case`) are rejected too.
    pub fn kind(&self) -> Result<StepKind<'_>, MaestroError> {
        let declared: Vec<&str> = [
            ("agent", self.agent.is_some()),
            ("if", self.if_expr.is_some()),
            ("case", self.case.is_some()),
            ("parallel", self.parallel.is_some()),
            ("loop", self.loop_spec.is_some()),
        ]
        .into_iter()
        .filter_map(|(key, present)| present.then_some(key))
        .collect();

        if declared.len() != 1 {
            return Err(self.malformed(if declared.is_empty() {
                "no control-flow key (agent, if, case, parallel, loop)".to_string()
            } else {
                format!("conflicting control-flow keys: {}", declared.join(", "))
            }));
        }

        if self.if_expr.is_none() && (self.then.is_some() || self.otherwise.is_some()) {
            return Err(self.malformed("then/else require if".to_string()));
        }
        if self.case.is_none() && self.default.is_some() {
            return Err(self.malformed("default requires case".to_string()));
        }
        if self.agent.is_none()
            && (!self.from.is_empty() || !self.context.is_empty() || !self.outputs.is_empty())
        {
            return Err(self.malformed("from/context/outputs apply to agent steps only".to_string()));
        }

        let kind = match declared[0] {
            "agent" => StepKind::Agent(self.agent.as_deref().unwrap_or_default()),
            "if" => StepKind::If {
                predicate: self.if_expr.as_deref().unwrap_or_default(),
                then: self
                    .then
                    .as_deref()
                    .ok_or_else(|| self.malformed("if requires then".to_string()))?,
                otherwise: self.otherwise.as_deref(),
            },
            "case" => StepKind::Case {
                arms: self.case.as_deref().unwrap_or_default(),
                default: self.default.as_deref(),
            },
            "parallel" => StepKind::Parallel(self.parallel.as_deref().unwrap_or_default()),
            _ => match &self.loop_spec {
                Some(spec) => StepKind::Loop(spec),
                None => return Err(self.malformed("loop body missing".to_string())),
            },
        };
        Ok(kind)
    }

    fn malformed(&self, reason: String) -> MaestroError {
        MaestroError::InvalidStep {
            step: self.name.clone(),
            reason,
        }
    }

    /// Build a bare agent step (used for `parallel`/`loop` shorthands)
    pub fn agent_step(name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            agent: Some(agent.into()),
            from: Vec::new(),
            context: Vec::new(),
            outputs: Vec::new(),
            timeout_ms: None,
            if_expr: None,
            then: None,
            otherwise: None,
            case: None,
            default: None,
            parallel: None,
            loop_spec: None,
            exception: None,
        }
    }
}
