//! Compiled workflow definition.
//!
//! These types are the output of the workflow compiler: every field resolved to
//! its semantic type, every duration a [`Duration`], every schedule a
//! validated cron descriptor. A [`Dag`] is pure data; it holds no background
//! resources and is owned by the caller once returned.

use crate::duration::secs;
use crate::step::{Condition, Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default number of days run history is retained.
pub const DEFAULT_HIST_RETENTION_DAYS: i32 = 30;

/// Default cap on concurrent runs of one workflow.
pub const DEFAULT_MAX_ACTIVE_RUNS: i32 = 1;

/// Execution type of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagType {
    /// Steps run in declared order; the compiler injects implicit
    /// dependencies between consecutive steps.
    #[default]
    Chain,
    /// Dependencies are only those explicitly declared.
    Graph,
}

/// A single cron schedule entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub expression: String,
}

impl ScheduleEntry {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }
}

/// Lifecycle handlers attached to a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerOn {
    #[serde(default)]
    pub init: Option<Step>,
    #[serde(default)]
    pub success: Option<Step>,
    #[serde(default)]
    pub failure: Option<Step>,
    #[serde(default)]
    pub abort: Option<Step>,
    #[serde(default)]
    pub wait: Option<Step>,
    #[serde(default)]
    pub exit: Option<Step>,
}

/// SMTP server settings for mail notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A mail notification target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub attach_logs: bool,
}

/// Which lifecycle events trigger notification mail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailOn {
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub success: bool,
}

/// SSH connection settings for remote execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub password: String,
}

/// One model entry when `llm.model` is given as a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

/// LLM provider settings for agent-flavoured steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub models: Vec<LlmModel>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
}

/// OpenTelemetry export settings, carried as configuration only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub timeout: Option<Duration>,
}

/// Reference to a secret resolved by a backend at run time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub provider: String,
    pub key: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Registry credentials for container image pulls.
///
/// A bare-string auth entry lands in `auth`; a raw JSON payload is stored
/// under the synthetic `_json` registry key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: String,
}

/// Registry key that carries a verbatim JSON auth payload.
pub const REGISTRY_AUTH_JSON_KEY: &str = "_json";

/// Controls over how a run may be started from the UI/API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub disable_param_edit: bool,
    #[serde(default)]
    pub disable_run_id_edit: bool,
}

/// Image pull policy for workflow containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    #[default]
    Missing,
    Never,
}

/// How a workflow container is kept alive for step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Startup {
    #[default]
    Keepalive,
    Entrypoint,
    Command,
}

/// Condition the container must reach before steps run in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitFor {
    #[default]
    Running,
    Healthy,
}

/// Container health check settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub test: Vec<String>,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub interval: Option<Duration>,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "crate::duration::opt_secs")]
    pub start_period: Option<Duration>,
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Container in which workflow steps run.
///
/// Either `exec` (attach to an existing container) or `image` (create one)
/// is set, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub exec: String,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    #[serde(default)]
    pub startup: Startup,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub wait_for: WaitFor,
    #[serde(default)]
    pub log_pattern: String,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub keep_container: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

/// A build diagnostic: the offending field, the value when meaningful, and
/// the cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub field: String,
    #[serde(default)]
    pub value: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: None,
            message: message.into(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}: {} (value: {})", self.field, self.message, v),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// A compiled workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    /// Source file path, empty when compiled from in-memory bytes.
    #[serde(default)]
    pub location: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dag_type: DagType,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    pub stop_schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    pub restart_schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    pub skip_if_successful: bool,
    /// Resolved `KEY=VALUE` entries, in declaration order.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dotenv: Vec<String>,
    #[serde(default)]
    pub log_dir: String,
    #[serde(default)]
    pub log_output: bool,
    #[serde(default)]
    pub max_output_size: i64,
    #[serde(default)]
    pub hist_retention_days: i32,
    #[serde(default, with = "secs")]
    pub max_cleanup_time: Duration,
    #[serde(default, with = "secs")]
    pub timeout: Duration,
    #[serde(default, with = "secs")]
    pub delay: Duration,
    #[serde(default, with = "secs")]
    pub restart_wait: Duration,
    #[serde(default)]
    pub max_active_runs: i32,
    #[serde(default)]
    pub max_active_steps: i32,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub shell_args: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    /// Shell-escaped join of the originally-declared parameters, used for
    /// sub-DAG invocation.
    #[serde(default)]
    pub default_params: String,
    /// Resolved `KEY=VALUE` parameter entries.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub params_json: Option<String>,
    #[serde(default)]
    pub handler_on: HandlerOn,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub error_mail: Option<MailConfig>,
    #[serde(default)]
    pub info_mail: Option<MailConfig>,
    #[serde(default)]
    pub wait_mail: Option<MailConfig>,
    #[serde(default)]
    pub mail_on: Option<MailOn>,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default)]
    pub registry_auths: BTreeMap<String, RegistryAuthConfig>,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub otel: Option<OtelConfig>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub worker_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub run_config: Option<RunConfig>,
    /// Sub-DAGs declared in the same source file, keyed by name.
    #[serde(default)]
    pub local_dags: BTreeMap<String, Dag>,
    /// Raw bytes of the originating document, kept for replay and restart.
    #[serde(skip)]
    pub yaml_data: Vec<u8>,
    /// Populated only under the errors-allowed build mode.
    #[serde(default)]
    pub build_errors: Vec<Diagnostic>,
    /// Non-fatal deprecation notices.
    #[serde(default)]
    pub build_warnings: Vec<String>,
}

impl Dag {
    /// Look up a step by name or alternate identifier.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.name == id || (!s.id.is_empty() && s.id == id))
    }

    /// True when any step requires human interaction.
    pub fn has_hitl_steps(&self) -> bool {
        self.steps.iter().any(|s| s.is_hitl())
    }
}
