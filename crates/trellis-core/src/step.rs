//! Compiled step types.
//!
//! A [`Step`] is the fully-resolved form of one entry in a workflow's
//! `steps:` list. All polymorphic YAML shapes have been disambiguated by the
//! compiler; the executor only ever sees these value types.

use crate::duration::secs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default cap on concurrently running parallel items.
pub const DEFAULT_MAX_CONCURRENT: i32 = 8;

/// A named parameter. Positional parameters are named `1`, `2`, … after
/// evaluation, so every compiled pair carries a name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamPair {
    pub name: String,
    pub value: String,
}

impl ParamPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Render as a `NAME=VALUE` environment entry.
    pub fn as_env(&self) -> String {
        if self.name.is_empty() {
            return self.value.clone();
        }
        format!("{}={}", self.name, self.value)
    }
}

/// An integer that may instead be a string holding a late-evaluated
/// variable reference (`limit: ${RETRIES}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    String(String),
}

impl Default for IntOrString {
    fn default() -> Self {
        IntOrString::Int(0)
    }
}

impl IntOrString {
    pub fn is_zero(&self) -> bool {
        matches!(self, IntOrString::Int(0))
    }
}

/// A condition evaluated before a step (or workflow) runs.
///
/// `condition` holds either a `$VAR`-style expression matched against
/// `expected`, or a command whose exit status decides when `expected` is
/// empty. `negate` inverts the outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub condition: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub negate: bool,
}

/// Flags controlling whether execution continues past a failed step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub exit_codes: Vec<i32>,
    #[serde(default)]
    pub mark_success: bool,
    #[serde(default)]
    pub output: Vec<String>,
}

/// Retry behaviour for a failed step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub limit: IntOrString,
    #[serde(default)]
    pub interval_sec: IntOrString,
    #[serde(default)]
    pub exit_codes: Vec<i32>,
    /// Multiplier applied to the interval between attempts; must be > 1.0.
    #[serde(default)]
    pub backoff: Option<f64>,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub max_interval: Option<Duration>,
}

/// Whether a repeat loop runs while its condition holds or until it holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    While,
    Until,
}

/// Repeat behaviour for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    pub mode: RepeatMode,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub exit_codes: Vec<i32>,
    #[serde(default, with = "secs")]
    pub interval: Duration,
    /// Maximum number of iterations; 0 means unlimited.
    #[serde(default)]
    pub limit: i32,
    #[serde(default)]
    pub backoff: Option<f64>,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub max_interval: Option<Duration>,
}

/// Resolved executor for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub executor_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

impl ExecutorConfig {
    pub fn typed(executor_type: impl Into<String>) -> Self {
        Self {
            executor_type: executor_type.into(),
            config: BTreeMap::new(),
        }
    }
}

/// One item of a parallel expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelItem {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub params: Vec<ParamPair>,
}

/// Parallel execution over a static item list or a runtime variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default)]
    pub items: Vec<ParallelItem>,
    /// Set when the item source is a variable resolved at run time.
    #[serde(default)]
    pub variable: String,
    pub max_concurrent: i32,
}

/// Reference to a sub-DAG invoked by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildDag {
    pub name: String,
    #[serde(default)]
    pub params: String,
}

/// A fully-resolved workflow step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub shell_args: Vec<String>,
    #[serde(default)]
    pub shell_packages: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// The original command line before splitting.
    #[serde(default)]
    pub cmd_with_args: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Variable name capturing the step's output (leading `$` stripped).
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub depends: Vec<String>,
    /// True when the source declared an explicitly empty `depends:`.
    #[serde(skip)]
    pub explicitly_no_deps: bool,
    #[serde(default)]
    pub continue_on: ContinueOn,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub repeat_policy: Option<RepeatPolicy>,
    #[serde(default)]
    pub mail_on_error: bool,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub signal_on_stop: String,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub parallel: Option<ParallelConfig>,
    #[serde(default)]
    pub child: Option<ChildDag>,
    #[serde(default, with = "secs")]
    pub timeout: Duration,
    /// Step-level environment, kept raw; evaluated at run time.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub container: Option<crate::dag::Container>,
    #[serde(default)]
    pub params: Vec<ParamPair>,
}

impl Step {
    /// The identifier other steps use to depend on this one.
    pub fn preferred_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }

    /// True for human-in-the-loop steps, which are incompatible with
    /// worker dispatch.
    pub fn is_hitl(&self) -> bool {
        matches!(self.executor.executor_type.as_str(), "hitl" | "human")
    }
}
