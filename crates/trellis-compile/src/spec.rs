//! Typed decoding of raw workflow documents.
//!
//! A [`WorkflowDefinition`] preserves the YAML shape of one document with
//! typed attributes. Polymorphic fields (a value may be a string, a list,
//! or a keyed record depending on context) stay as [`serde_yaml::Value`] or
//! a small sum type until a later phase disambiguates them. Decoding is
//! strict: unknown keys are errors at both the workflow and step level.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// A value given either as a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::Single(s) => vec![s],
            StringOrList::List(v) => v,
        }
    }
}

/// A value given either as an integer or a string (ports, SMTP port, …).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntOrStringValue {
    Int(i64),
    Str(String),
}

impl IntOrStringValue {
    pub fn into_string(self) -> String {
        match self {
            IntOrStringValue::Int(n) => n.to_string(),
            IntOrStringValue::Str(s) => s,
        }
    }
}

/// The `schedule:` field: one expression, a list, or a keyed record with
/// separate start/stop/restart expressions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScheduleValue {
    Single(String),
    Multiple(Vec<String>),
    Detailed(DetailedSchedule),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetailedSchedule {
    pub start: Option<StringOrList>,
    pub stop: Option<StringOrList>,
    pub restart: Option<StringOrList>,
}

/// The `shell:` field: a command line to split, or command plus args.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ShellValue {
    Command(String),
    CommandWithArgs(Vec<String>),
}

/// The `executor:` field: absent, a bare type name, or a typed record.
#[derive(Debug, Clone)]
pub enum ExecutorValue {
    Shorthand(String),
    Structured {
        executor_type: String,
        config: serde_yaml::Value,
    },
}

impl<'de> Deserialize<'de> for ExecutorValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(s) => Ok(ExecutorValue::Shorthand(s)),
            serde_yaml::Value::Mapping(map) => {
                let executor_type = match map.get("type") {
                    Some(serde_yaml::Value::String(s)) => s.clone(),
                    Some(_) => return Err(D::Error::custom("executor type must be a string")),
                    None => return Err(D::Error::custom("executor requires a type")),
                };
                let config = map
                    .get("config")
                    .cloned()
                    .unwrap_or(serde_yaml::Value::Null);
                if let Some(unknown) = map.keys().find_map(|k| match k.as_str() {
                    Some("type") | Some("config") => None,
                    other => Some(other.unwrap_or("<non-string>").to_string()),
                }) {
                    return Err(D::Error::custom(format!(
                        "unknown executor key: {}",
                        unknown
                    )));
                }
                Ok(ExecutorValue::Structured {
                    executor_type,
                    config,
                })
            }
            serde_yaml::Value::Null => Ok(ExecutorValue::Shorthand(String::new())),
            _ => Err(D::Error::custom(
                "executor must be a string or a {type, config} record",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SmtpDefinition {
    pub host: Option<String>,
    pub port: Option<IntOrStringValue>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MailDefinition {
    pub from: Option<String>,
    pub to: Option<StringOrList>,
    pub prefix: Option<String>,
    pub attach_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MailOnDefinition {
    pub failure: Option<bool>,
    pub success: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SshDefinition {
    pub user: Option<String>,
    pub host: Option<String>,
    pub ip: Option<String>,
    pub port: Option<IntOrStringValue>,
    pub key: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LlmDefinition {
    pub provider: Option<String>,
    /// A model name, or a list of model records.
    pub model: Option<serde_yaml::Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LlmModelDefinition {
    pub provider: Option<String>,
    pub name: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OtelDefinition {
    pub endpoint: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub insecure: Option<bool>,
    /// Unit-suffixed string or bare seconds.
    pub timeout: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SecretDefinition {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub key: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfigDefinition {
    pub disable_param_edit: Option<bool>,
    pub disable_run_id_edit: Option<bool>,
}

/// Lifecycle handler steps. `cancel` is a deprecated spelling of `abort`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HandlerOnDefinition {
    pub init: Option<serde_yaml::Value>,
    pub success: Option<serde_yaml::Value>,
    pub failure: Option<serde_yaml::Value>,
    pub abort: Option<serde_yaml::Value>,
    pub cancel: Option<serde_yaml::Value>,
    pub wait: Option<serde_yaml::Value>,
    pub exit: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ContinueOnDefinition {
    pub failure: Option<bool>,
    pub skipped: Option<bool>,
    /// One exit code or a list.
    pub exit_code: Option<serde_yaml::Value>,
    pub mark_success: Option<bool>,
    pub output: Option<StringOrList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicyDefinition {
    /// Integer, or a string for late evaluation.
    pub limit: Option<serde_yaml::Value>,
    pub interval_sec: Option<serde_yaml::Value>,
    pub exit_code: Option<serde_yaml::Value>,
    /// `true` for the default multiplier, or an explicit number > 1.0.
    pub backoff: Option<serde_yaml::Value>,
    pub max_interval_sec: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RepeatPolicyDefinition {
    /// `true`, `"while"`, or `"until"`.
    pub repeat: Option<serde_yaml::Value>,
    pub interval_sec: Option<i64>,
    pub limit: Option<i32>,
    pub condition: Option<String>,
    pub expected: Option<String>,
    pub exit_code: Option<serde_yaml::Value>,
    pub backoff: Option<serde_yaml::Value>,
    pub max_interval_sec: Option<i64>,
}

/// One decoded step record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StepDefinition {
    pub name: Option<String>,
    pub id: Option<String>,
    pub description: Option<String>,
    pub shell: Option<ShellValue>,
    pub shell_packages: Option<Vec<String>>,
    pub script: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub mail_on_error: Option<bool>,
    pub working_dir: Option<String>,
    /// Alias of `workingDir`.
    pub dir: Option<String>,
    /// A command line string or a list of argv elements.
    pub command: Option<serde_yaml::Value>,
    pub args: Option<serde_yaml::Value>,
    pub params: Option<serde_yaml::Value>,
    pub timeout_sec: Option<i64>,
    /// A step identifier or a list of them. An explicitly empty list opts
    /// the step out of implicit chain dependencies.
    pub depends: Option<serde_yaml::Value>,
    pub parallel: Option<serde_yaml::Value>,
    pub call: Option<String>,
    /// Deprecated alias of `call`.
    pub run: Option<String>,
    pub continue_on: Option<ContinueOnDefinition>,
    pub retry_policy: Option<RetryPolicyDefinition>,
    pub repeat_policy: Option<RepeatPolicyDefinition>,
    pub signal_on_stop: Option<String>,
    pub precondition: Option<serde_yaml::Value>,
    pub preconditions: Option<serde_yaml::Value>,
    pub output: Option<String>,
    pub env: Option<serde_yaml::Value>,
    pub executor: Option<ExecutorValue>,
    pub container: Option<serde_yaml::Value>,
}

/// One decoded workflow document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub name: Option<String>,
    pub group: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub dag_type: Option<String>,
    pub shell: Option<ShellValue>,
    pub working_dir: Option<String>,
    pub dotenv: Option<StringOrList>,
    pub schedule: Option<ScheduleValue>,
    pub skip_if_successful: Option<bool>,
    pub log_dir: Option<String>,
    pub log_output: Option<bool>,
    /// A keyed record, a list of keyed records, or a list of `K=V` strings.
    pub env: Option<serde_yaml::Value>,
    pub handler_on: Option<HandlerOnDefinition>,
    /// An ordered array (possibly of sibling groups), a keyed record, or a
    /// single command shorthand.
    pub steps: Option<serde_yaml::Value>,
    pub smtp: Option<SmtpDefinition>,
    pub mail_on: Option<MailOnDefinition>,
    pub error_mail: Option<MailDefinition>,
    pub info_mail: Option<MailDefinition>,
    pub wait_mail: Option<MailDefinition>,
    pub timeout_sec: Option<i64>,
    pub delay_sec: Option<i64>,
    pub restart_wait_sec: Option<i64>,
    pub hist_retention_days: Option<i32>,
    pub precondition: Option<serde_yaml::Value>,
    pub preconditions: Option<serde_yaml::Value>,
    pub max_active_runs: Option<i64>,
    pub max_active_steps: Option<i64>,
    pub params: Option<serde_yaml::Value>,
    #[serde(rename = "maxCleanUpTimeSec")]
    pub max_cleanup_time_sec: Option<i64>,
    pub tags: Option<serde_yaml::Value>,
    pub queue: Option<String>,
    pub max_output_size: Option<i64>,
    pub otel: Option<OtelDefinition>,
    pub worker_selector: Option<BTreeMap<String, String>>,
    /// A container name string, or a container record.
    pub container: Option<serde_yaml::Value>,
    pub run_config: Option<RunConfigDefinition>,
    /// A JSON string, or a map of registry → token / auth record.
    pub registry_auths: Option<serde_yaml::Value>,
    pub ssh: Option<SshDefinition>,
    pub llm: Option<LlmDefinition>,
    pub secrets: Option<Vec<SecretDefinition>>,
}

/// Container record shape. Decoded weakly: scalar fields coerce from
/// string or number, but unknown keys are still rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ContainerDefinition {
    pub name: Option<String>,
    pub image: Option<String>,
    pub exec: Option<String>,
    pub env: Option<serde_yaml::Value>,
    pub volumes: Option<Vec<String>>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub platform: Option<String>,
    pub ports: Option<Vec<IntOrStringValue>>,
    pub network: Option<String>,
    pub pull_policy: Option<serde_yaml::Value>,
    pub startup: Option<String>,
    pub command: Option<StringOrList>,
    pub wait_for: Option<String>,
    pub log_pattern: Option<String>,
    pub restart_policy: Option<String>,
    pub keep_container: Option<bool>,
    #[serde(alias = "healthcheck")]
    pub health_check: Option<HealthCheckDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckDefinition {
    pub test: Option<StringOrList>,
    pub interval: Option<serde_yaml::Value>,
    pub timeout: Option<serde_yaml::Value>,
    pub start_period: Option<serde_yaml::Value>,
    pub retries: Option<u32>,
}

/// Decode one raw document into a definition, tagging failures with the
/// document index.
pub fn decode_document(
    index: usize,
    value: serde_yaml::Value,
) -> crate::errors::Result<WorkflowDefinition> {
    serde_yaml::from_value(value).map_err(|e| crate::errors::BuildError::Decode {
        index,
        message: e.to_string(),
    })
}
