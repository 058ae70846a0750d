//! Per-field builders for the transformer pipeline.
//!
//! Each builder turns one attribute of the decoded definition into its
//! compiled form. Errors are field-tagged so the aggregator can render
//! `field: cause (value: …)` diagnostics.

use crate::errors::{field_err, field_err_val, Result};
use crate::spec::{
    ContainerDefinition, LlmDefinition, LlmModelDefinition, MailDefinition, ScheduleValue,
    ShellValue, SmtpDefinition, SshDefinition, StringOrList,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use trellis_core::dag::{
    Container, DagType, HealthCheck, LlmConfig, LlmModel, MailConfig, PullPolicy,
    RegistryAuthConfig, ScheduleEntry, SmtpConfig, SshConfig, Startup, WaitFor,
    REGISTRY_AUTH_JSON_KEY,
};
use trellis_core::duration::parse_duration;
use trellis_core::step::Condition;

/// Maximum accepted length for workflow, step, and queue names.
pub const MAX_NAME_LEN: usize = 100;

/// Validate a workflow/step/queue name: letters, digits, `_ - .`.
pub fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(field_err_val(
            field,
            name,
            format!("name must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(field_err_val(
            field,
            name,
            "name may only contain letters, digits, '_', '-', and '.'",
        ));
    }
    Ok(())
}

/// Empty defaults to chain; `agent` is reserved.
pub fn build_dag_type(raw: Option<&str>) -> Result<DagType> {
    match raw.unwrap_or("") {
        "" | "chain" => Ok(DagType::Chain),
        "graph" => Ok(DagType::Graph),
        "agent" => Err(field_err_val("type", "agent", "reserved workflow type")),
        other => Err(field_err_val("type", other, "invalid workflow type")),
    }
}

/// Flatten comma-separated tokens, lowercase, trim, drop empties.
pub fn build_tags(value: &serde_yaml::Value) -> Result<Vec<String>> {
    let raw: Vec<String> = match value {
        serde_yaml::Value::String(s) => vec![s.clone()],
        serde_yaml::Value::Sequence(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => out.push(s.clone()),
                    serde_yaml::Value::Number(n) => out.push(n.to_string()),
                    _ => return Err(field_err("tags", "tags must be strings")),
                }
            }
            out
        }
        _ => return Err(field_err("tags", "tags must be a string or a list")),
    };
    Ok(raw
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect())
}

/// Validate one cron expression, normalising the five-field form to the
/// `cron` crate's six fields. `@hourly`-style macros pass through.
pub fn validate_cron(field: &str, expression: &str) -> Result<()> {
    let trimmed = expression.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map(|_| ())
        .map_err(|e| field_err_val(field, expression, format!("invalid cron expression: {}", e)))
}

/// Expand the `schedule:` field into start/stop/restart entry lists.
pub fn build_schedules(
    value: &ScheduleValue,
) -> Result<(Vec<ScheduleEntry>, Vec<ScheduleEntry>, Vec<ScheduleEntry>)> {
    let entries = |field: &str, raw: Vec<String>| -> Result<Vec<ScheduleEntry>> {
        raw.into_iter()
            .map(|expr| {
                validate_cron(field, &expr)?;
                Ok(ScheduleEntry::new(expr))
            })
            .collect()
    };
    match value {
        ScheduleValue::Single(expr) => {
            Ok((entries("schedule", vec![expr.clone()])?, vec![], vec![]))
        }
        ScheduleValue::Multiple(exprs) => {
            Ok((entries("schedule", exprs.clone())?, vec![], vec![]))
        }
        ScheduleValue::Detailed(detail) => {
            let start = detail.start.clone().map(StringOrList::into_vec).unwrap_or_default();
            let stop = detail.stop.clone().map(StringOrList::into_vec).unwrap_or_default();
            let restart = detail
                .restart
                .clone()
                .map(StringOrList::into_vec)
                .unwrap_or_default();
            Ok((
                entries("schedule", start)?,
                entries("stopSchedule", stop)?,
                entries("restartSchedule", restart)?,
            ))
        }
    }
}

/// Integer seconds to a duration; negatives are stored as zero at the
/// workflow level (steps reject them).
pub fn seconds(raw: i64) -> Duration {
    if raw <= 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(raw as u64)
    }
}

/// A duration given as bare seconds or a unit-suffixed string.
pub fn yaml_duration(field: &str, value: &serde_yaml::Value) -> Result<Duration> {
    match value {
        serde_yaml::Value::Number(n) => match n.as_u64() {
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Err(field_err_val(field, n, "duration must be non-negative")),
        },
        serde_yaml::Value::String(s) => parse_duration(s)
            .map_err(|e| field_err_val(field, s, e.to_string())),
        _ => Err(field_err(field, "duration must be a number or string")),
    }
}

/// Split the `shell:` field into a command and its arguments.
pub fn build_shell(value: &ShellValue) -> Result<(String, Vec<String>)> {
    match value {
        ShellValue::Command(line) => {
            let mut parts = shell_words::split(line)
                .map_err(|e| field_err_val("shell", line, e.to_string()))?;
            if parts.is_empty() {
                return Ok((String::new(), Vec::new()));
            }
            let command = parts.remove(0);
            Ok((command, parts))
        }
        ShellValue::CommandWithArgs(parts) => {
            let mut parts = parts.clone();
            if parts.is_empty() {
                return Ok((String::new(), Vec::new()));
            }
            let command = parts.remove(0);
            Ok((command, parts))
        }
    }
}

/// Resolve a working directory per the storage rules: absolute,
/// `~`-prefixed, and variable-prefixed values are stored verbatim for the
/// runtime to expand; relative values resolve against the workflow file's
/// directory, then the caller default, the process working directory, and
/// finally the user home.
pub fn build_working_dir(
    raw: Option<&str>,
    spec_dir: Option<&Path>,
    default_dir: Option<&Path>,
) -> String {
    if let Some(dir) = raw {
        if dir.starts_with('/') || dir.starts_with('~') || dir.starts_with('$') {
            return dir.to_string();
        }
        if let Some(base) = spec_dir {
            return base.join(dir).display().to_string();
        }
        return dir.to_string();
    }
    if let Some(base) = spec_dir {
        return base.display().to_string();
    }
    if let Some(dir) = default_dir {
        return dir.display().to_string();
    }
    if let Ok(cwd) = std::env::current_dir() {
        return cwd.display().to_string();
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().display().to_string())
        .unwrap_or_default()
}

/// Parse the `env:` shapes into ordered `(key, value)` entries: a keyed
/// record, a list of keyed records, or a list of `K=V` strings.
pub fn env_entries(field: &str, value: &serde_yaml::Value) -> Result<Vec<(String, String)>> {
    fn mapping_entries(
        field: &str,
        map: &serde_yaml::Mapping,
        out: &mut Vec<(String, String)>,
    ) -> Result<()> {
        for (key, value) in map {
            let key = key
                .as_str()
                .ok_or_else(|| field_err(field, "env keys must be strings"))?;
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => return Err(field_err(field, format!("env value for {} must be a scalar", key))),
            };
            out.push((key.to_string(), value));
        }
        Ok(())
    }

    let mut entries = Vec::new();
    match value {
        serde_yaml::Value::Mapping(map) => mapping_entries(field, map, &mut entries)?,
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                match item {
                    serde_yaml::Value::Mapping(map) => mapping_entries(field, map, &mut entries)?,
                    serde_yaml::Value::String(s) => match s.split_once('=') {
                        Some((k, v)) => entries.push((k.to_string(), v.to_string())),
                        None => {
                            return Err(field_err_val(field, s, "expected KEY=VALUE"));
                        }
                    },
                    _ => return Err(field_err(field, "env entries must be records or strings")),
                }
            }
        }
        _ => return Err(field_err(field, "env must be a record or a list")),
    }
    Ok(entries)
}

/// Parse the `precondition(s)` shapes: a string, a record, or a list.
pub fn parse_preconditions(field: &str, value: &serde_yaml::Value) -> Result<Vec<Condition>> {
    fn one(field: &str, value: &serde_yaml::Value) -> Result<Condition> {
        match value {
            serde_yaml::Value::String(s) => Ok(Condition {
                condition: s.clone(),
                ..Default::default()
            }),
            serde_yaml::Value::Mapping(map) => {
                let mut cond = Condition::default();
                for (key, entry) in map {
                    match key.as_str() {
                        Some("condition") | Some("command") => {
                            cond.condition = entry
                                .as_str()
                                .ok_or_else(|| field_err(field, "condition must be a string"))?
                                .to_string();
                        }
                        Some("expected") => {
                            cond.expected = match entry {
                                serde_yaml::Value::String(s) => s.clone(),
                                serde_yaml::Value::Number(n) => n.to_string(),
                                _ => {
                                    return Err(field_err(field, "expected must be a scalar"));
                                }
                            };
                        }
                        Some("negate") => {
                            cond.negate = entry
                                .as_bool()
                                .ok_or_else(|| field_err(field, "negate must be a boolean"))?;
                        }
                        Some(other) => {
                            return Err(field_err_val(field, other, "unknown precondition key"));
                        }
                        None => return Err(field_err(field, "precondition keys must be strings")),
                    }
                }
                if cond.condition.is_empty() {
                    return Err(field_err(field, "precondition requires condition or command"));
                }
                Ok(cond)
            }
            _ => Err(field_err(field, "precondition must be a string or record")),
        }
    }

    match value {
        serde_yaml::Value::Sequence(items) => items.iter().map(|v| one(field, v)).collect(),
        other => Ok(vec![one(field, other)?]),
    }
}

pub fn build_smtp(def: &SmtpDefinition) -> SmtpConfig {
    SmtpConfig {
        host: def.host.clone().unwrap_or_default(),
        port: def
            .port
            .clone()
            .map(|p| p.into_string())
            .unwrap_or_default(),
        username: def.username.clone().unwrap_or_default(),
        password: def.password.clone().unwrap_or_default(),
    }
}

pub fn build_mail(def: &MailDefinition) -> MailConfig {
    MailConfig {
        from: def.from.clone().unwrap_or_default(),
        to: def.to.clone().map(StringOrList::into_vec).unwrap_or_default(),
        prefix: def.prefix.clone().unwrap_or_default(),
        attach_logs: def.attach_logs.unwrap_or(false),
    }
}

pub fn build_ssh(def: &SshDefinition) -> Result<SshConfig> {
    let ip = match (&def.host, &def.ip) {
        (Some(host), None) => host.clone(),
        (None, Some(ip)) => ip.clone(),
        (Some(_), Some(_)) => {
            return Err(field_err("ssh", "host and ip are mutually exclusive"));
        }
        (None, None) => String::new(),
    };
    Ok(SshConfig {
        user: def.user.clone().unwrap_or_default(),
        ip,
        port: def
            .port
            .clone()
            .map(|p| p.into_string())
            .unwrap_or_else(|| "22".to_string()),
        key: def.key.clone().unwrap_or_default(),
        password: def.password.clone().unwrap_or_default(),
    })
}

const LLM_PROVIDERS: &[&str] = &["openai", "anthropic", "gemini", "openrouter", "local"];

fn canonical_provider(field: &str, raw: &str) -> Result<String> {
    let lowered = raw.to_lowercase();
    let canonical = match lowered.as_str() {
        "ollama" | "vllm" | "llama" => "local".to_string(),
        other => other.to_string(),
    };
    if !LLM_PROVIDERS.contains(&canonical.as_str()) {
        return Err(field_err_val(field, raw, "unknown LLM provider"));
    }
    Ok(canonical)
}

fn check_llm_bounds(
    field: &str,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<i64>,
) -> Result<()> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(field_err_val(field, t, "temperature must be within [0.0, 2.0]"));
        }
    }
    if let Some(p) = top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(field_err_val(field, p, "topP must be within [0.0, 1.0]"));
        }
    }
    if let Some(m) = max_tokens {
        if m < 1 {
            return Err(field_err_val(field, m, "maxTokens must be >= 1"));
        }
    }
    Ok(())
}

pub fn build_llm(def: &LlmDefinition) -> Result<LlmConfig> {
    let mut config = LlmConfig {
        temperature: def.temperature,
        top_p: def.top_p,
        max_tokens: def.max_tokens,
        ..Default::default()
    };
    check_llm_bounds("llm", def.temperature, def.top_p, def.max_tokens)?;
    if let Some(provider) = &def.provider {
        config.provider = canonical_provider("llm", provider)?;
    }
    match &def.model {
        None => {}
        Some(serde_yaml::Value::String(name)) => config.model = name.clone(),
        Some(serde_yaml::Value::Sequence(items)) => {
            for item in items {
                let model: LlmModelDefinition = serde_yaml::from_value(item.clone())
                    .map_err(|e| field_err("llm", e.to_string()))?;
                let provider = model
                    .provider
                    .as_deref()
                    .ok_or_else(|| field_err("llm", "model entries require a provider"))?;
                let name = model
                    .name
                    .clone()
                    .ok_or_else(|| field_err("llm", "model entries require a name"))?;
                check_llm_bounds("llm", model.temperature, model.top_p, model.max_tokens)?;
                config.models.push(LlmModel {
                    provider: canonical_provider("llm", provider)?,
                    name,
                    temperature: model.temperature,
                    top_p: model.top_p,
                    max_tokens: model.max_tokens,
                });
            }
        }
        Some(_) => {
            return Err(field_err("llm", "model must be a string or a list of records"));
        }
    }
    Ok(config)
}

/// Build the container attribute. The string form names an existing
/// container to attach to; the record form creates one. `exec` and
/// `image` are mutually exclusive and `exec` forbids the create-only
/// field set.
pub fn build_container(field: &str, value: &serde_yaml::Value) -> Result<Container> {
    if let serde_yaml::Value::String(name) = value {
        return Ok(Container {
            exec: name.clone(),
            ..Default::default()
        });
    }
    let serde_yaml::Value::Mapping(raw_map) = value else {
        return Err(field_err(field, "container must be a string or a record"));
    };
    let def: ContainerDefinition = serde_yaml::from_value(value.clone())
        .map_err(|e| field_err(field, e.to_string()))?;

    let has_exec = def.exec.as_deref().is_some_and(|s| !s.is_empty());
    let has_image = def.image.as_deref().is_some_and(|s| !s.is_empty());
    if has_exec && has_image {
        return Err(field_err(field, "exec and image are mutually exclusive"));
    }
    if !has_exec && !has_image {
        return Err(field_err(field, "container requires exec or image"));
    }
    if has_exec {
        const FORBIDDEN: &[&str] = &[
            "name",
            "pullPolicy",
            "volumes",
            "ports",
            "network",
            "platform",
            "startup",
            "command",
            "waitFor",
            "logPattern",
            "restartPolicy",
            "keepContainer",
            "healthcheck",
            "healthCheck",
        ];
        for key in raw_map.keys() {
            if let Some(key) = key.as_str() {
                if FORBIDDEN.contains(&key) {
                    return Err(field_err_val(
                        field,
                        key,
                        "not allowed when exec is set",
                    ));
                }
            }
        }
    }

    let pull_policy = match &def.pull_policy {
        None => PullPolicy::default(),
        Some(serde_yaml::Value::Bool(true)) => PullPolicy::Always,
        Some(serde_yaml::Value::Bool(false)) => PullPolicy::Never,
        Some(serde_yaml::Value::String(s)) => match s.to_lowercase().as_str() {
            "always" => PullPolicy::Always,
            "missing" => PullPolicy::Missing,
            "never" => PullPolicy::Never,
            other => return Err(field_err_val(field, other, "invalid pullPolicy")),
        },
        Some(_) => return Err(field_err(field, "pullPolicy must be a string or bool")),
    };

    let startup = match def.startup.as_deref() {
        None => Startup::default(),
        Some("keepalive") => Startup::Keepalive,
        Some("entrypoint") => Startup::Entrypoint,
        Some("command") => Startup::Command,
        Some(other) => return Err(field_err_val(field, other, "invalid startup mode")),
    };
    let wait_for = match def.wait_for.as_deref() {
        None => WaitFor::default(),
        Some("running") => WaitFor::Running,
        Some("healthy") => WaitFor::Healthy,
        Some(other) => return Err(field_err_val(field, other, "invalid waitFor")),
    };

    let health_check = match &def.health_check {
        None => None,
        Some(hc) => Some(HealthCheck {
            test: hc.test.clone().map(StringOrList::into_vec).unwrap_or_default(),
            interval: hc
                .interval
                .as_ref()
                .map(|v| yaml_duration(field, v))
                .transpose()?,
            timeout: hc
                .timeout
                .as_ref()
                .map(|v| yaml_duration(field, v))
                .transpose()?,
            start_period: hc
                .start_period
                .as_ref()
                .map(|v| yaml_duration(field, v))
                .transpose()?,
            retries: hc.retries,
        }),
    };

    let env = match &def.env {
        None => Vec::new(),
        Some(value) => env_entries(field, value)?
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect(),
    };

    Ok(Container {
        name: def.name.clone().unwrap_or_default(),
        image: def.image.clone().unwrap_or_default(),
        exec: def.exec.clone().unwrap_or_default(),
        env,
        volumes: def.volumes.clone().unwrap_or_default(),
        user: def.user.clone().unwrap_or_default(),
        working_dir: def.working_dir.clone().unwrap_or_default(),
        platform: def.platform.clone().unwrap_or_default(),
        ports: def
            .ports
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.into_string())
            .collect(),
        network: def.network.clone().unwrap_or_default(),
        pull_policy,
        startup,
        command: def.command.clone().map(StringOrList::into_vec).unwrap_or_default(),
        wait_for,
        log_pattern: def.log_pattern.clone().unwrap_or_default(),
        restart_policy: def.restart_policy.clone().unwrap_or_default(),
        keep_container: def.keep_container.unwrap_or(false),
        health_check,
    })
}

/// Build registry auth entries: a JSON string (kept verbatim under the
/// synthetic `_json` key), or a map whose values are bare tokens or
/// `{username, password, auth}` records. Map keys are string-coerced.
pub fn build_registry_auths(
    value: &serde_yaml::Value,
) -> Result<BTreeMap<String, RegistryAuthConfig>> {
    let field = "registryAuths";
    let mut out = BTreeMap::new();
    match value {
        serde_yaml::Value::String(payload) => {
            serde_json::from_str::<serde_json::Value>(payload)
                .map_err(|e| field_err(field, format!("invalid JSON payload: {}", e)))?;
            out.insert(
                REGISTRY_AUTH_JSON_KEY.to_string(),
                RegistryAuthConfig {
                    auth: payload.clone(),
                    ..Default::default()
                },
            );
        }
        serde_yaml::Value::Mapping(map) => {
            for (key, entry) in map {
                let registry = match key {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    _ => return Err(field_err(field, "registry keys must be strings")),
                };
                let config = match entry {
                    serde_yaml::Value::String(token) => RegistryAuthConfig {
                        auth: token.clone(),
                        ..Default::default()
                    },
                    serde_yaml::Value::Mapping(_) => serde_yaml::from_value(entry.clone())
                        .map_err(|e| field_err(field, e.to_string()))?,
                    _ => {
                        return Err(field_err_val(
                            field,
                            registry,
                            "auth must be a token string or a record",
                        ));
                    }
                };
                out.insert(registry, config);
            }
        }
        _ => return Err(field_err(field, "must be a JSON string or a map")),
    }
    Ok(out)
}
