//! Step building: normalisation, the per-step sub-pipeline, and name
//! synthesis.
//!
//! The `steps:` value arrives as an ordered array (whose items may
//! themselves be arrays of siblings), a keyed record, or a single command
//! shorthand. Every raw step runs through the same sub-pipeline; missing
//! names are synthesized from the step's dominant trait.

use crate::errors::{field_err, field_err_val, BuildError, ErrorList, Result};
use crate::fields::{
    build_container, build_shell, env_entries, parse_preconditions, validate_name,
};
use crate::params;
use crate::spec::{
    ContinueOnDefinition, ExecutorValue, RepeatPolicyDefinition, RetryPolicyDefinition,
    StepDefinition, StringOrList,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;
use trellis_core::dag::Dag;
use trellis_core::signal::signal_number;
use trellis_core::step::{
    ChildDag, Condition, ContinueOn, ExecutorConfig, IntOrString, ParallelConfig, ParallelItem,
    ParamPair, RepeatMode, RepeatPolicy, RetryPolicy, Step, DEFAULT_MAX_CONCURRENT,
};

/// Default backoff multiplier when `backoff: true`.
const DEFAULT_BACKOFF: f64 = 2.0;

/// Fallbacks applied to steps that did not textually declare a field.
/// A step's explicit value wins even when empty or zero; env and
/// preconditions are additive, with default entries first.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepDefaults {
    pub retry_policy: Option<RetryPolicy>,
    pub continue_on: Option<ContinueOn>,
    pub repeat_policy: Option<RepeatPolicy>,
    pub timeout: Option<Duration>,
    pub mail_on_error: Option<bool>,
    pub signal_on_stop: Option<String>,
    pub env: Vec<String>,
    pub preconditions: Vec<Condition>,
}

/// The normalised shape of the `steps:` value.
pub(crate) enum StepsLayout {
    /// Ordered groups; a plain step is a group of one, a nested array is a
    /// sibling group.
    Ordered(Vec<Vec<serde_yaml::Value>>),
    /// Keyed record in document order; dependencies are explicit.
    Keyed(Vec<(String, serde_yaml::Value)>),
}

pub(crate) fn normalize_steps(value: &serde_yaml::Value) -> Result<StepsLayout> {
    match value {
        serde_yaml::Value::String(command) => Ok(StepsLayout::Ordered(vec![vec![
            serde_yaml::Value::String(command.clone()),
        ]])),
        serde_yaml::Value::Sequence(items) => {
            let mut groups = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_yaml::Value::Sequence(siblings) => groups.push(siblings.clone()),
                    other => groups.push(vec![other.clone()]),
                }
            }
            Ok(StepsLayout::Ordered(groups))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                let name = key
                    .as_str()
                    .ok_or_else(|| field_err("steps", "step names must be strings"))?;
                entries.push((name.to_string(), value.clone()));
            }
            Ok(StepsLayout::Keyed(entries))
        }
        _ => Err(field_err(
            "steps",
            "steps must be a list, a keyed record, or a command string",
        )),
    }
}

/// Result of building every step.
pub(crate) struct BuiltSteps {
    pub steps: Vec<Step>,
    /// Step index groups in declaration order (ordered form only).
    pub groups: Vec<Vec<usize>>,
    /// True when the source used the ordered array form.
    pub ordered: bool,
}

/// Build all steps, collecting per-step errors and skipping broken steps.
pub(crate) fn build_steps(
    value: &serde_yaml::Value,
    dag: &Dag,
    defaults: &StepDefaults,
    warnings: &mut Vec<String>,
    errors: &mut ErrorList,
) -> BuiltSteps {
    let layout = match normalize_steps(value) {
        Ok(layout) => layout,
        Err(e) => {
            errors.push(e);
            return BuiltSteps {
                steps: Vec::new(),
                groups: Vec::new(),
                ordered: false,
            };
        }
    };

    let mut steps: Vec<Step> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let ordered = matches!(layout, StepsLayout::Ordered(_));

    match layout {
        StepsLayout::Ordered(raw_groups) => {
            for raw_group in raw_groups {
                let mut group = Vec::with_capacity(raw_group.len());
                for raw in raw_group {
                    let index = steps.len();
                    match build_step(&raw, None, index, dag, defaults, warnings) {
                        Ok(mut step) => {
                            synthesize_name(&mut step, &raw, index, &steps);
                            group.push(index);
                            steps.push(step);
                        }
                        Err(e) => errors.push(e),
                    }
                }
                groups.push(group);
            }
        }
        StepsLayout::Keyed(entries) => {
            for (name, raw) in entries {
                let index = steps.len();
                match build_step(&raw, Some(&name), index, dag, defaults, warnings) {
                    Ok(step) => steps.push(step),
                    Err(e) => errors.push(e),
                }
            }
        }
    }

    for err in validate_step_names(&steps) {
        errors.push(err);
    }

    BuiltSteps {
        steps,
        groups,
        ordered,
    }
}

fn validate_step_names(steps: &[Step]) -> Vec<BuildError> {
    let mut errors = Vec::new();
    let mut seen: Vec<&str> = Vec::new();
    for step in steps {
        if let Err(e) = validate_name("steps", &step.name) {
            errors.push(e);
        }
        if seen.contains(&step.name.as_str()) {
            errors.push(field_err_val("steps", &step.name, "duplicate step name"));
        }
        seen.push(&step.name);
        if !step.id.is_empty() {
            if seen.contains(&step.id.as_str()) {
                errors.push(field_err_val("steps", &step.id, "duplicate step identifier"));
            }
            seen.push(&step.id);
        }
    }
    errors
}

/// Build one step from its raw value, shorthand included.
pub(crate) fn build_step(
    raw: &serde_yaml::Value,
    keyed_name: Option<&str>,
    index: usize,
    dag: &Dag,
    defaults: &StepDefaults,
    warnings: &mut Vec<String>,
) -> Result<Step> {
    let def: StepDefinition = match raw {
        serde_yaml::Value::String(command) => StepDefinition {
            command: Some(serde_yaml::Value::String(command.clone())),
            ..Default::default()
        },
        other => serde_yaml::from_value(other.clone())
            .map_err(|e| field_err(format!("steps[{}]", index), e.to_string()))?,
    };

    let mut step = Step {
        name: keyed_name
            .map(str::to_string)
            .or_else(|| def.name.clone())
            .unwrap_or_default(),
        id: def.id.clone().unwrap_or_default(),
        description: def.description.clone().unwrap_or_default(),
        ..Default::default()
    };
    if !step.id.is_empty() {
        validate_name("steps", &step.id)?;
    }

    // Working dir: step value, its `dir` alias, else the workflow's.
    step.working_dir = def
        .working_dir
        .clone()
        .or_else(|| def.dir.clone())
        .unwrap_or_else(|| dag.working_dir.clone());

    // Shell: empty inherits the workflow shell.
    match &def.shell {
        Some(shell) => {
            let (command, args) = build_shell(shell)?;
            step.shell = command;
            step.shell_args = args;
        }
        None => {
            step.shell = dag.shell.clone();
            step.shell_args = dag.shell_args.clone();
        }
    }
    step.shell_packages = def.shell_packages.clone().unwrap_or_default();

    build_command(&def, &mut step)?;

    if let Some(params_value) = &def.params {
        step.params = params::parse_only(params_value)?;
    }

    if let Some(timeout) = def.timeout_sec {
        if timeout < 0 {
            return Err(field_err_val(
                "timeoutSec",
                timeout,
                "timeoutSec must be >= 0",
            ));
        }
        step.timeout = Duration::from_secs(timeout as u64);
    } else if let Some(timeout) = defaults.timeout {
        step.timeout = timeout;
    }

    build_depends(&def, &mut step)?;
    build_parallel(&def, &mut step)?;
    build_child(&def, &mut step, warnings)?;
    if let Some(container_value) = &def.container {
        step.container = Some(build_container("container", container_value)?);
    }
    build_executor(&def, &mut step, dag)?;

    step.continue_on = match &def.continue_on {
        Some(c) => build_continue_on(c)?,
        None => defaults.continue_on.clone().unwrap_or_default(),
    };
    step.retry_policy = match &def.retry_policy {
        Some(r) => Some(build_retry_policy(r)?),
        None => defaults.retry_policy.clone(),
    };
    step.repeat_policy = match &def.repeat_policy {
        Some(r) => build_repeat_policy(r)?,
        None => defaults.repeat_policy.clone(),
    };

    match &def.signal_on_stop {
        Some(name) => {
            if signal_number(name).is_none() {
                return Err(field_err_val("signalOnStop", name, "unknown signal name"));
            }
            step.signal_on_stop = name.clone();
        }
        None => {
            if let Some(name) = &defaults.signal_on_stop {
                step.signal_on_stop = name.clone();
            }
        }
    }

    step.mail_on_error = def
        .mail_on_error
        .or(defaults.mail_on_error)
        .unwrap_or(false);

    if let Some(output) = &def.output {
        step.output = output.strip_prefix('$').unwrap_or(output).to_string();
    }

    step.stdout = def.stdout.clone().unwrap_or_default();
    step.stderr = def.stderr.clone().unwrap_or_default();

    // Env and preconditions are additive: default entries first.
    step.env = defaults.env.clone();
    if let Some(env_value) = &def.env {
        for (k, v) in env_entries("env", env_value)? {
            step.env.push(format!("{}={}", k, v));
        }
    }
    step.preconditions = defaults.preconditions.clone();
    for value in [&def.precondition, &def.preconditions].into_iter().flatten() {
        step.preconditions
            .extend(parse_preconditions("preconditions", value)?);
    }

    Ok(step)
}

fn scalar_string(field: &str, value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(field_err(field, "expected a scalar value")),
    }
}

fn string_list(field: &str, value: &serde_yaml::Value) -> Result<Vec<String>> {
    match value {
        serde_yaml::Value::Sequence(items) => {
            items.iter().map(|v| scalar_string(field, v)).collect()
        }
        other => Ok(vec![scalar_string(field, other)?]),
    }
}

fn int_list(field: &str, value: &serde_yaml::Value) -> Result<Vec<i32>> {
    let ints = |v: &serde_yaml::Value| -> Result<i32> {
        v.as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| field_err(field, "expected an exit code"))
    };
    match value {
        serde_yaml::Value::Sequence(items) => items.iter().map(ints).collect(),
        other => Ok(vec![ints(other)?]),
    }
}

pub(crate) fn yaml_to_json(value: &serde_yaml::Value) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| field_err("executor", e.to_string()))
}

fn build_command(def: &StepDefinition, step: &mut Step) -> Result<()> {
    if def.command.is_some() && def.script.is_some() {
        return Err(field_err(
            "command",
            "command and script are mutually exclusive",
        ));
    }
    step.script = def.script.clone().unwrap_or_default();

    if let Some(command) = &def.command {
        match command {
            serde_yaml::Value::String(line) => {
                step.cmd_with_args = line.clone();
                // Tolerates unbalanced quoting from backtick substitutions.
                let parts = shell_words::split(line)
                    .unwrap_or_else(|_| line.split_whitespace().map(str::to_string).collect());
                let mut parts = parts.into_iter();
                step.command = parts.next().unwrap_or_default();
                step.args.extend(parts);
            }
            serde_yaml::Value::Sequence(_) => {
                let mut parts = string_list("command", command)?.into_iter();
                step.command = parts.next().unwrap_or_default();
                let args: Vec<String> = parts.collect();
                step.cmd_with_args = if args.is_empty() {
                    step.command.clone()
                } else {
                    format!("{} {}", step.command, shell_words::join(args.iter().map(String::as_str)))
                };
                step.args.extend(args);
            }
            other => {
                step.command = scalar_string("command", other)?;
                step.cmd_with_args = step.command.clone();
            }
        }
    }

    if let Some(args) = &def.args {
        match args {
            serde_yaml::Value::String(line) => {
                let parts = shell_words::split(line)
                    .unwrap_or_else(|_| line.split_whitespace().map(str::to_string).collect());
                step.args.extend(parts);
            }
            other => step.args.extend(string_list("args", other)?),
        }
    }
    Ok(())
}

fn build_depends(def: &StepDefinition, step: &mut Step) -> Result<()> {
    let Some(depends) = &def.depends else {
        return Ok(());
    };
    match depends {
        serde_yaml::Value::Sequence(items) if items.is_empty() => {
            step.explicitly_no_deps = true;
        }
        other => step.depends = string_list("depends", other)?,
    }
    Ok(())
}

fn build_parallel(def: &StepDefinition, step: &mut Step) -> Result<()> {
    let Some(parallel) = &def.parallel else {
        return Ok(());
    };
    let config = match parallel {
        serde_yaml::Value::String(reference) => {
            if !reference.starts_with('$') {
                return Err(field_err_val(
                    "parallel",
                    reference,
                    "expected a variable reference or an item list",
                ));
            }
            ParallelConfig {
                variable: reference.clone(),
                max_concurrent: DEFAULT_MAX_CONCURRENT,
                ..Default::default()
            }
        }
        serde_yaml::Value::Sequence(_) => ParallelConfig {
            items: parallel_items(parallel)?,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            ..Default::default()
        },
        serde_yaml::Value::Mapping(map) => {
            let items = map
                .get("items")
                .ok_or_else(|| field_err("parallel", "items is required"))?;
            let max_concurrent = match map.get("maxConcurrent") {
                Some(v) => v
                    .as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        field_err("parallel", "maxConcurrent must be a positive integer")
                    })?,
                None => DEFAULT_MAX_CONCURRENT,
            };
            if let Some(unknown) = map.keys().find_map(|k| match k.as_str() {
                Some("items") | Some("maxConcurrent") => None,
                other => Some(other.unwrap_or("<non-string>").to_string()),
            }) {
                return Err(field_err_val("parallel", unknown, "unknown parallel key"));
            }
            match items {
                serde_yaml::Value::String(reference) if reference.starts_with('$') => {
                    ParallelConfig {
                        variable: reference.clone(),
                        max_concurrent,
                        ..Default::default()
                    }
                }
                _ => ParallelConfig {
                    items: parallel_items(items)?,
                    max_concurrent,
                    ..Default::default()
                },
            }
        }
        _ => {
            return Err(field_err(
                "parallel",
                "expected a variable reference, a list, or an items record",
            ));
        }
    };
    step.parallel = Some(config);
    Ok(())
}

fn parallel_items(value: &serde_yaml::Value) -> Result<Vec<ParallelItem>> {
    let serde_yaml::Value::Sequence(items) = value else {
        return Err(field_err("parallel", "items must be a list"));
    };
    items
        .iter()
        .map(|item| match item {
            serde_yaml::Value::Mapping(map) => {
                let mut keys: Vec<String> = Vec::with_capacity(map.len());
                for key in map.keys() {
                    keys.push(
                        key.as_str()
                            .ok_or_else(|| field_err("parallel", "item keys must be strings"))?
                            .to_string(),
                    );
                }
                keys.sort();
                let mut pairs = Vec::with_capacity(keys.len());
                for key in keys {
                    let value = map
                        .get(key.as_str())
                        .map(|v| scalar_string("parallel", v))
                        .transpose()?
                        .unwrap_or_default();
                    pairs.push(ParamPair::new(key, value));
                }
                Ok(ParallelItem {
                    params: pairs,
                    ..Default::default()
                })
            }
            other => Ok(ParallelItem {
                value: scalar_string("parallel", other)?,
                ..Default::default()
            }),
        })
        .collect()
}

fn build_child(
    def: &StepDefinition,
    step: &mut Step,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let target = match (&def.call, &def.run) {
        (Some(call), _) => Some(call.clone()),
        (None, Some(run)) => {
            let notice = format!(
                "step {}: 'run' is deprecated, use 'call' instead",
                def.name.as_deref().unwrap_or("<unnamed>")
            );
            warn!("{}", notice);
            warnings.push(notice);
            Some(run.clone())
        }
        (None, None) => None,
    };
    let Some(name) = target else {
        return Ok(());
    };
    let params = match &def.params {
        Some(value) => params::stringify(value)?,
        None => String::new(),
    };
    step.child = Some(ChildDag { name, params });
    Ok(())
}

/// Resolve the executor. With no explicit executor, a workflow container
/// wins over a workflow SSH config; sub-DAG calls force the dag/parallel
/// executor types.
fn build_executor(def: &StepDefinition, step: &mut Step, dag: &Dag) -> Result<()> {
    if step.child.is_some() {
        step.executor = ExecutorConfig::typed(if step.parallel.is_some() {
            "parallel"
        } else {
            "dag"
        });
        return Ok(());
    }
    match &def.executor {
        None | Some(ExecutorValue::Shorthand(_)) => {
            let shorthand = match &def.executor {
                Some(ExecutorValue::Shorthand(name)) => name.as_str(),
                _ => "",
            };
            if !shorthand.is_empty() {
                step.executor = ExecutorConfig::typed(shorthand);
            } else if dag.container.is_some() || step.container.is_some() {
                step.executor = ExecutorConfig::typed("container");
            } else if dag.ssh.is_some() {
                step.executor = ExecutorConfig::typed("ssh");
            }
        }
        Some(ExecutorValue::Structured {
            executor_type,
            config,
        }) => {
            let mut map = BTreeMap::new();
            match config {
                serde_yaml::Value::Null => {}
                serde_yaml::Value::Mapping(entries) => {
                    for (key, value) in entries {
                        let key = key
                            .as_str()
                            .ok_or_else(|| field_err("executor", "config keys must be strings"))?;
                        map.insert(key.to_string(), yaml_to_json(value)?);
                    }
                }
                _ => return Err(field_err("executor", "config must be a map")),
            }
            step.executor = ExecutorConfig {
                executor_type: executor_type.clone(),
                config: map,
            };
        }
    }
    Ok(())
}

fn build_continue_on(def: &ContinueOnDefinition) -> Result<ContinueOn> {
    Ok(ContinueOn {
        failure: def.failure.unwrap_or(false),
        skipped: def.skipped.unwrap_or(false),
        exit_codes: def
            .exit_code
            .as_ref()
            .map(|v| int_list("continueOn", v))
            .transpose()?
            .unwrap_or_default(),
        mark_success: def.mark_success.unwrap_or(false),
        output: def
            .output
            .clone()
            .map(StringOrList::into_vec)
            .unwrap_or_default(),
    })
}

fn build_backoff(field: &str, value: &serde_yaml::Value) -> Result<Option<f64>> {
    match value {
        serde_yaml::Value::Bool(true) => Ok(Some(DEFAULT_BACKOFF)),
        serde_yaml::Value::Bool(false) => Ok(None),
        serde_yaml::Value::Number(n) => {
            let factor = n
                .as_f64()
                .ok_or_else(|| field_err(field, "backoff must be a number"))?;
            if factor <= 1.0 {
                return Err(field_err_val(
                    field,
                    factor,
                    "backoff must be greater than 1.0",
                ));
            }
            Ok(Some(factor))
        }
        _ => Err(field_err(field, "backoff must be a boolean or a number")),
    }
}

fn int_or_string(field: &str, value: &serde_yaml::Value) -> Result<IntOrString> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(IntOrString::Int)
            .ok_or_else(|| field_err(field, "expected an integer")),
        serde_yaml::Value::String(s) => Ok(IntOrString::String(s.clone())),
        _ => Err(field_err(field, "expected an integer or a string")),
    }
}

fn build_retry_policy(def: &RetryPolicyDefinition) -> Result<RetryPolicy> {
    Ok(RetryPolicy {
        limit: def
            .limit
            .as_ref()
            .map(|v| int_or_string("retryPolicy", v))
            .transpose()?
            .unwrap_or_default(),
        interval_sec: def
            .interval_sec
            .as_ref()
            .map(|v| int_or_string("retryPolicy", v))
            .transpose()?
            .unwrap_or_default(),
        exit_codes: def
            .exit_code
            .as_ref()
            .map(|v| int_list("retryPolicy", v))
            .transpose()?
            .unwrap_or_default(),
        backoff: def
            .backoff
            .as_ref()
            .map(|v| build_backoff("retryPolicy", v))
            .transpose()?
            .flatten(),
        max_interval: def
            .max_interval_sec
            .map(|secs| Duration::from_secs(secs.max(0) as u64)),
    })
}

/// Repeat mode inference: `condition` + `expected` repeats until the
/// condition matches; `condition` or `exitCode` alone repeats while it
/// does; `repeat: true` repeats unconditionally.
fn build_repeat_policy(def: &RepeatPolicyDefinition) -> Result<Option<RepeatPolicy>> {
    let condition = def.condition.as_ref().map(|c| Condition {
        condition: c.clone(),
        expected: def.expected.clone().unwrap_or_default(),
        negate: false,
    });
    let exit_codes = def
        .exit_code
        .as_ref()
        .map(|v| int_list("repeatPolicy", v))
        .transpose()?
        .unwrap_or_default();

    let mode = match &def.repeat {
        Some(serde_yaml::Value::Bool(true)) => RepeatMode::While,
        Some(serde_yaml::Value::Bool(false)) => return Ok(None),
        Some(serde_yaml::Value::String(s)) => {
            let mode = match s.as_str() {
                "while" => RepeatMode::While,
                "until" => RepeatMode::Until,
                other => {
                    return Err(field_err_val(
                        "repeatPolicy",
                        other,
                        "repeat must be a boolean, 'while', or 'until'",
                    ));
                }
            };
            if condition.is_none() && exit_codes.is_empty() {
                return Err(field_err(
                    "repeatPolicy",
                    "explicit while/until requires condition or exitCode",
                ));
            }
            mode
        }
        Some(_) => {
            return Err(field_err(
                "repeatPolicy",
                "repeat must be a boolean, 'while', or 'until'",
            ));
        }
        None => {
            // Legacy inference from the fields that are present.
            match &condition {
                Some(c) if !c.expected.is_empty() => RepeatMode::Until,
                Some(_) => RepeatMode::While,
                None if !exit_codes.is_empty() => RepeatMode::While,
                None => return Ok(None),
            }
        }
    };

    Ok(Some(RepeatPolicy {
        mode,
        condition,
        exit_codes,
        interval: Duration::from_secs(def.interval_sec.unwrap_or(0).max(0) as u64),
        limit: def.limit.unwrap_or(0),
        backoff: def
            .backoff
            .as_ref()
            .map(|v| build_backoff("repeatPolicy", v))
            .transpose()?
            .flatten(),
        max_interval: def
            .max_interval_sec
            .map(|secs| Duration::from_secs(secs.max(0) as u64)),
    }))
}

/// Synthesize a missing step name from the step's dominant trait; the
/// counter starts at `index + 1` and increments until unique.
fn synthesize_name(step: &mut Step, raw: &serde_yaml::Value, index: usize, existing: &[Step]) {
    if !step.name.is_empty() {
        return;
    }
    let explicit_executor = matches!(
        raw,
        serde_yaml::Value::Mapping(map) if map.get("executor").is_some_and(|e| !e.is_null())
    );
    let prefix = if explicit_executor && !step.executor.executor_type.is_empty() {
        step.executor.executor_type.clone()
    } else if step.container.is_some() {
        "docker".to_string()
    } else if step.parallel.is_some() {
        "parallel".to_string()
    } else if step.child.is_some() {
        "dag".to_string()
    } else if !step.script.is_empty() {
        "script".to_string()
    } else if !step.command.is_empty() {
        "cmd".to_string()
    } else {
        "step".to_string()
    };

    let taken = |candidate: &str| {
        existing
            .iter()
            .any(|s| s.name == candidate || s.id == candidate)
    };
    let mut n = index + 1;
    let mut candidate = format!("{}_{}", prefix, n);
    while taken(&candidate) {
        n += 1;
        candidate = format!("{}_{}", prefix, n);
    }
    step.name = candidate;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trellis_core::dag::SshConfig;

    fn yaml(input: &str) -> serde_yaml::Value {
        serde_yaml::from_str(input).unwrap()
    }

    fn build_one(input: &str, dag: &Dag) -> Result<Step> {
        build_step(
            &yaml(input),
            None,
            0,
            dag,
            &StepDefaults::default(),
            &mut Vec::new(),
        )
    }

    #[test]
    fn test_shorthand_becomes_command_step() {
        let dag = Dag::default();
        let mut errors = ErrorList::new();
        let built = build_steps(
            &yaml("- echo hello\n"),
            &dag,
            &StepDefaults::default(),
            &mut Vec::new(),
            &mut errors,
        );
        assert!(errors.is_empty());
        assert_eq!(built.steps.len(), 1);
        assert_eq!(built.steps[0].command, "echo");
        assert_eq!(built.steps[0].args, vec!["hello"]);
        assert_eq!(built.steps[0].cmd_with_args, "echo hello");
        assert_eq!(built.steps[0].name, "cmd_1");
    }

    #[test]
    fn test_command_script_mutex() {
        let dag = Dag::default();
        let err = build_one("command: echo hi\nscript: |\n  echo hi\n", &dag).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let dag = Dag::default();
        let err = build_one("command: x\ntimeoutSec: -3\n", &dag).unwrap_err();
        assert!(err.to_string().contains("timeoutSec must be >= 0"));
    }

    #[test]
    fn test_explicit_empty_depends() {
        let dag = Dag::default();
        let step = build_one("command: x\ndepends: []\n", &dag).unwrap();
        assert!(step.explicitly_no_deps);
        assert!(step.depends.is_empty());
    }

    #[test]
    fn test_executor_synthesis_prefers_container_over_ssh() {
        let dag = Dag {
            container: Some(Default::default()),
            ssh: Some(SshConfig::default()),
            ..Default::default()
        };
        let step = build_one("command: x\n", &dag).unwrap();
        assert_eq!(step.executor.executor_type, "container");
    }

    #[test]
    fn test_executor_synthesis_ssh_without_container() {
        let dag = Dag {
            ssh: Some(SshConfig::default()),
            ..Default::default()
        };
        let step = build_one("command: x\n", &dag).unwrap();
        assert_eq!(step.executor.executor_type, "ssh");
    }

    #[test]
    fn test_call_sets_dag_executor() {
        let dag = Dag::default();
        let step = build_one("call: child\nparams: \"A=1\"\n", &dag).unwrap();
        assert_eq!(step.executor.executor_type, "dag");
        let child = step.child.unwrap();
        assert_eq!(child.name, "child");
        assert_eq!(child.params, "A=1");
    }

    #[test]
    fn test_run_alias_warns() {
        let dag = Dag::default();
        let mut warnings = Vec::new();
        let step = build_step(
            &yaml("run: child\n"),
            None,
            0,
            &dag,
            &StepDefaults::default(),
            &mut warnings,
        )
        .unwrap();
        assert!(step.child.is_some());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("deprecated"));
    }

    #[test]
    fn test_parallel_with_call_uses_parallel_executor() {
        let dag = Dag::default();
        let step = build_one("call: child\nparallel:\n  - a\n  - b\n", &dag).unwrap();
        assert_eq!(step.executor.executor_type, "parallel");
        assert_eq!(step.parallel.unwrap().items.len(), 2);
    }

    #[test]
    fn test_parallel_variable_reference() {
        let dag = Dag::default();
        let step = build_one("command: x\nparallel: ${ITEMS}\n", &dag).unwrap();
        let parallel = step.parallel.unwrap();
        assert_eq!(parallel.variable, "${ITEMS}");
        assert_eq!(parallel.max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_parallel_record_with_max_concurrent() {
        let dag = Dag::default();
        let step =
            build_one("command: x\nparallel:\n  items: [a, b]\n  maxConcurrent: 2\n", &dag)
                .unwrap();
        let parallel = step.parallel.unwrap();
        assert_eq!(parallel.max_concurrent, 2);
        assert_eq!(parallel.items[0].value, "a");
    }

    #[test]
    fn test_retry_backoff_must_exceed_one() {
        let dag = Dag::default();
        let err = build_one(
            "command: x\nretryPolicy:\n  limit: 3\n  backoff: 1.0\n",
            &dag,
        )
        .unwrap_err();
        assert!(err.to_string().contains("greater than 1.0"));
    }

    #[test]
    fn test_retry_backoff_true_defaults() {
        let dag = Dag::default();
        let step = build_one(
            "command: x\nretryPolicy:\n  limit: 3\n  backoff: true\n",
            &dag,
        )
        .unwrap();
        assert_eq!(step.retry_policy.unwrap().backoff, Some(DEFAULT_BACKOFF));
    }

    #[test]
    fn test_repeat_inference() {
        let dag = Dag::default();
        let step = build_one(
            "command: x\nrepeatPolicy:\n  condition: \"`cat status`\"\n  expected: done\n",
            &dag,
        )
        .unwrap();
        assert_eq!(step.repeat_policy.unwrap().mode, RepeatMode::Until);

        let step = build_one(
            "command: x\nrepeatPolicy:\n  condition: \"`cat status`\"\n",
            &dag,
        )
        .unwrap();
        assert_eq!(step.repeat_policy.unwrap().mode, RepeatMode::While);

        let step = build_one("command: x\nrepeatPolicy:\n  exitCode: [1]\n", &dag).unwrap();
        assert_eq!(step.repeat_policy.unwrap().mode, RepeatMode::While);

        let step = build_one("command: x\nrepeatPolicy:\n  repeat: true\n", &dag).unwrap();
        let policy = step.repeat_policy.unwrap();
        assert_eq!(policy.mode, RepeatMode::While);
        assert!(policy.condition.is_none());
    }

    #[test]
    fn test_explicit_repeat_requires_condition_or_exit_code() {
        let dag = Dag::default();
        let err = build_one("command: x\nrepeatPolicy:\n  repeat: while\n", &dag).unwrap_err();
        assert!(err.to_string().contains("requires condition or exitCode"));
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let dag = Dag::default();
        let err = build_one("command: x\nsignalOnStop: SIGBOGUS\n", &dag).unwrap_err();
        assert!(err.to_string().contains("unknown signal"));
    }

    #[test]
    fn test_output_dollar_prefix_stripped() {
        let dag = Dag::default();
        let step = build_one("command: x\noutput: $RESULT\n", &dag).unwrap();
        assert_eq!(step.output, "RESULT");
    }

    #[test]
    fn test_defaults_inheritance_textual_presence() {
        let dag = Dag::default();
        let defaults = StepDefaults {
            timeout: Some(Duration::from_secs(30)),
            mail_on_error: Some(true),
            env: vec!["SRC=default".to_string()],
            ..Default::default()
        };
        // Absent fields inherit.
        let step = build_step(
            &yaml("command: x\n"),
            None,
            0,
            &dag,
            &defaults,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(step.timeout, Duration::from_secs(30));
        assert!(step.mail_on_error);
        assert_eq!(step.env, vec!["SRC=default"]);

        // Explicit zero wins over the default.
        let step = build_step(
            &yaml("command: x\ntimeoutSec: 0\nmailOnError: false\nenv:\n  A: 1\n"),
            None,
            0,
            &dag,
            &defaults,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(step.timeout, Duration::ZERO);
        assert!(!step.mail_on_error);
        assert_eq!(step.env, vec!["SRC=default", "A=1"]);
    }

    #[test]
    fn test_keyed_steps_take_names_from_keys() {
        let dag = Dag::default();
        let mut errors = ErrorList::new();
        let built = build_steps(
            &yaml("extract:\n  command: e\nload:\n  command: l\n  depends: [extract]\n"),
            &dag,
            &StepDefaults::default(),
            &mut Vec::new(),
            &mut errors,
        );
        assert!(errors.is_empty());
        assert!(!built.ordered);
        assert_eq!(built.steps[0].name, "extract");
        assert_eq!(built.steps[1].depends, vec!["extract"]);
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let dag = Dag::default();
        let mut errors = ErrorList::new();
        build_steps(
            &yaml("- name: a\n  command: x\n- name: a\n  command: y\n"),
            &dag,
            &StepDefaults::default(),
            &mut Vec::new(),
            &mut errors,
        );
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_synthesized_names_by_trait() {
        let dag = Dag::default();
        let mut errors = ErrorList::new();
        let built = build_steps(
            &yaml("- script: |\n    echo s\n- parallel: [a]\n  command: x\n- call: child\n"),
            &dag,
            &StepDefaults::default(),
            &mut Vec::new(),
            &mut errors,
        );
        assert!(errors.is_empty());
        assert_eq!(built.steps[0].name, "script_1");
        assert_eq!(built.steps[1].name, "parallel_2");
        assert_eq!(built.steps[2].name, "dag_3");
    }
}
