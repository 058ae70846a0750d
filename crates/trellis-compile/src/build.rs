//! The transformer pipeline: one ordered registry of per-field builders
//! dispatched over a decoded definition to write a compiled [`Dag`].
//!
//! The pipeline runs in two tiers. The metadata tier always runs; the full
//! tier is skipped when the caller asks for metadata only. Handlers and
//! steps run after the field pipeline because they cross-reference the
//! partially-built workflow (container, ssh, shell). Registry order is part
//! of the contract: each transformer sees the DAG as prior transformers
//! left it.

use crate::chain::inject_chain_dependencies;
use crate::errors::{field_err, field_err_val, BuildError, ErrorList, Result};
use crate::eval::Evaluator;
use crate::exec::{HttpSchemaFetcher, ShellCommandRunner};
use crate::fields;
use crate::params;
use crate::schema::SchemaContext;
use crate::scope::{EnvScope, VarSource};
use crate::spec::{StringOrList, WorkflowDefinition};
use crate::steps::{build_step, build_steps, StepDefaults};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_core::dag::{
    Dag, MailOn, RunConfig, SecretRef, DEFAULT_HIST_RETENTION_DAYS, DEFAULT_MAX_ACTIVE_RUNS,
};
use trellis_core::ports::{CommandRunner, SchemaFetcher};
use trellis_core::step::Step;

/// Capabilities and cancellation shared by every build in a process.
#[derive(Clone)]
pub struct CompileContext {
    pub runner: Arc<dyn CommandRunner>,
    pub fetcher: Arc<dyn SchemaFetcher>,
    pub cancel: CancellationToken,
}

impl CompileContext {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(ShellCommandRunner),
            fetcher: Arc::new(HttpSchemaFetcher::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SchemaFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-controlled build options and flags.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub base_config: Option<PathBuf>,
    pub params: Option<String>,
    pub params_list: Vec<String>,
    pub name: Option<String>,
    pub dags_dir: Option<PathBuf>,
    pub default_working_dir: Option<PathBuf>,
    /// Pre-populated build-time env, used to replay retries/restarts.
    pub build_env: Vec<(String, String)>,
    pub no_eval: bool,
    pub only_metadata: bool,
    pub allow_build_errors: bool,
    pub skip_schema_validation: bool,
    pub skip_base_handlers: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_config = Some(path.into());
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }

    pub fn with_params_list(mut self, params: Vec<String>) -> Self {
        self.params_list = params;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_dags_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dags_dir = Some(dir.into());
        self
    }

    pub fn with_default_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_working_dir = Some(dir.into());
        self
    }

    pub fn with_build_env(mut self, env: Vec<(String, String)>) -> Self {
        self.build_env = env;
        self
    }

    pub fn no_eval(mut self) -> Self {
        self.no_eval = true;
        self
    }

    pub fn only_metadata(mut self) -> Self {
        self.only_metadata = true;
        self
    }

    pub fn allow_build_errors(mut self) -> Self {
        self.allow_build_errors = true;
        self
    }

    pub fn skip_schema_validation(mut self) -> Self {
        self.skip_schema_validation = true;
        self
    }

    pub fn skip_base_handlers(mut self) -> Self {
        self.skip_base_handlers = true;
        self
    }
}

/// Transient per-build state. The env scope lives exactly as long as one
/// build.
struct BuildContext<'a> {
    compile: &'a CompileContext,
    opts: &'a LoadOptions,
    file: Option<&'a Path>,
    fallback_name: Option<&'a str>,
    scope: EnvScope,
    errors: ErrorList,
    warnings: Vec<String>,
}

impl<'a> BuildContext<'a> {
    fn spec_dir(&self) -> Option<&Path> {
        self.file.and_then(Path::parent)
    }
}

/// The ordered transformer registry. Metadata fields always run; full
/// fields are skipped under `only_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Group,
    Description,
    Type,
    Tags,
    Env,
    Schedule,
    Params,
    WorkerSelector,
    Timeout,
    Delay,
    RestartWait,
    MaxActiveRuns,
    MaxActiveSteps,
    Queue,
    MaxOutputSize,
    SkipIfSuccessful,
    LogDir,
    LogOutput,
    MailOn,
    RunConfig,
    HistRetentionDays,
    MaxCleanupTime,
    Shell,
    WorkingDir,
    Container,
    RegistryAuths,
    Ssh,
    Llm,
    Secrets,
    Dotenv,
    Smtp,
    ErrorMail,
    InfoMail,
    WaitMail,
    Preconditions,
    Otel,
}

const METADATA_FIELDS: &[Field] = &[
    Field::Name,
    Field::Group,
    Field::Description,
    Field::Type,
    Field::Tags,
    Field::Env,
    Field::Schedule,
    Field::Params,
    Field::WorkerSelector,
    Field::Timeout,
    Field::Delay,
    Field::RestartWait,
    Field::MaxActiveRuns,
    Field::MaxActiveSteps,
    Field::Queue,
    Field::MaxOutputSize,
    Field::SkipIfSuccessful,
];

const FULL_FIELDS: &[Field] = &[
    Field::LogDir,
    Field::LogOutput,
    Field::MailOn,
    Field::RunConfig,
    Field::HistRetentionDays,
    Field::MaxCleanupTime,
    Field::Shell,
    Field::WorkingDir,
    Field::Container,
    Field::RegistryAuths,
    Field::Ssh,
    Field::Llm,
    Field::Secrets,
    Field::Dotenv,
    Field::Smtp,
    Field::ErrorMail,
    Field::InfoMail,
    Field::WaitMail,
    Field::Preconditions,
    Field::Otel,
];

/// Compile one decoded definition into a DAG.
///
/// Under `allow_build_errors` a partially-built DAG carrying its
/// diagnostics is returned; otherwise any accumulated diagnostics become
/// one composite error.
pub(crate) async fn build_dag(
    compile: &CompileContext,
    opts: &LoadOptions,
    def: &WorkflowDefinition,
    file: Option<&Path>,
    fallback_name: Option<&str>,
) -> Result<Dag> {
    if compile.cancel.is_cancelled() {
        return Err(BuildError::Cancelled);
    }

    let mut bctx = BuildContext {
        compile,
        opts,
        file,
        fallback_name,
        scope: EnvScope::with_os_snapshot(),
        errors: ErrorList::new(),
        warnings: Vec::new(),
    };
    let mut dag = Dag::default();

    // Dotenv and build-env layers load before the pipeline so workflow env
    // and params can reference them. The dotenv *attribute* is still a
    // full-tier concern.
    load_dotenv_layer(&mut bctx, def);
    if !opts.build_env.is_empty() {
        bctx.scope
            .push_layer(VarSource::BuildEnv, opts.build_env.clone());
    }

    for field in METADATA_FIELDS {
        apply_field(*field, &mut bctx, def, &mut dag).await?;
    }
    if !opts.only_metadata {
        for field in FULL_FIELDS {
            apply_field(*field, &mut bctx, def, &mut dag).await?;
        }
        build_handlers(&mut bctx, def, &mut dag);
        build_dag_steps(&mut bctx, def, &mut dag);
        for err in global_validations(&dag) {
            bctx.errors.push(err);
        }
    }

    dag.build_warnings = bctx.warnings;
    if bctx.errors.is_empty() {
        return Ok(dag);
    }
    if opts.allow_build_errors {
        debug!(
            errors = bctx.errors.len(),
            workflow = %dag.name,
            "Returning workflow with build errors"
        );
        dag.build_errors = bctx.errors.diagnostics();
        return Ok(dag);
    }
    Err(BuildError::List(bctx.errors))
}

/// Run one transformer, collecting its error under the field name.
/// Cancellation is never collected; it aborts the build.
async fn apply_field(
    field: Field,
    bctx: &mut BuildContext<'_>,
    def: &WorkflowDefinition,
    dag: &mut Dag,
) -> Result<()> {
    if let Err(err) = dispatch_field(field, bctx, def, dag).await {
        if matches!(err, BuildError::Cancelled)
            || matches!(err, BuildError::Core(trellis_core::Error::Cancelled))
        {
            return Err(BuildError::Cancelled);
        }
        bctx.errors.push(err);
    }
    Ok(())
}

async fn dispatch_field(
    field: Field,
    bctx: &mut BuildContext<'_>,
    def: &WorkflowDefinition,
    dag: &mut Dag,
) -> Result<()> {
    match field {
        Field::Name => {
            let name = def
                .name
                .clone()
                .or_else(|| bctx.opts.name.clone())
                .or_else(|| bctx.fallback_name.map(str::to_string))
                .unwrap_or_default();
            if !name.is_empty() {
                fields::validate_name("name", &name)?;
            }
            dag.name = name;
        }
        Field::Group => dag.group = def.group.clone().unwrap_or_default(),
        Field::Description => dag.description = def.description.clone().unwrap_or_default(),
        Field::Type => dag.dag_type = fields::build_dag_type(def.dag_type.as_deref())?,
        Field::Tags => {
            if let Some(value) = &def.tags {
                dag.tags = fields::build_tags(value)?;
            }
        }
        Field::Env => {
            if let Some(value) = &def.env {
                let entries = fields::env_entries("env", value)?;
                let compile = bctx.compile;
                let evaluator = Evaluator::new(
                    compile.runner.as_ref(),
                    &compile.cancel,
                    bctx.opts.no_eval,
                );
                for (key, raw_value) in entries {
                    let value = evaluator
                        .evaluate_strict(&raw_value, &bctx.scope, &[])
                        .await
                        .map_err(|e| match e {
                            trellis_core::Error::Cancelled => BuildError::Cancelled,
                            other => field_err_val("env", &key, other.to_string()),
                        })?;
                    bctx.scope.define(VarSource::DagEnv, key.clone(), value.clone());
                    dag.env.push(format!("{}={}", key, value));
                }
            }
        }
        Field::Schedule => {
            if let Some(value) = &def.schedule {
                let (start, stop, restart) = fields::build_schedules(value)?;
                dag.schedule = start;
                dag.stop_schedule = stop;
                dag.restart_schedule = restart;
            }
        }
        Field::Params => {
            let compile = bctx.compile;
            let evaluator = Evaluator::new(
                compile.runner.as_ref(),
                &compile.cancel,
                bctx.opts.no_eval,
            );
            let spec_dir = bctx.file.and_then(Path::parent);
            let schema_ctx = if bctx.opts.skip_schema_validation {
                None
            } else {
                Some(SchemaContext {
                    fetcher: compile.fetcher.as_ref(),
                    working_dir: def.working_dir.as_deref(),
                    spec_dir,
                })
            };
            let resolved = params::resolve(
                &evaluator,
                &mut bctx.scope,
                def.params.as_ref(),
                bctx.opts.params.as_deref(),
                &bctx.opts.params_list,
                schema_ctx.as_ref(),
            )
            .await?;
            dag.params = resolved.params;
            dag.default_params = resolved.default_params;
            dag.params_json = resolved.params_json;
        }
        Field::WorkerSelector => {
            if let Some(selector) = &def.worker_selector {
                dag.worker_selector = selector.clone();
            }
        }
        Field::Timeout => {
            dag.timeout = fields::seconds(def.timeout_sec.unwrap_or(0));
        }
        Field::Delay => {
            dag.delay = fields::seconds(def.delay_sec.unwrap_or(0));
        }
        Field::RestartWait => {
            dag.restart_wait = fields::seconds(def.restart_wait_sec.unwrap_or(0));
        }
        Field::MaxActiveRuns => {
            dag.max_active_runs = match def.max_active_runs {
                None | Some(0) => DEFAULT_MAX_ACTIVE_RUNS,
                Some(n) => i32::try_from(n)
                    .map_err(|_| field_err_val("maxActiveRuns", n, "out of range"))?,
            };
        }
        Field::MaxActiveSteps => {
            dag.max_active_steps = match def.max_active_steps {
                None => 0,
                Some(n) => i32::try_from(n)
                    .map_err(|_| field_err_val("maxActiveSteps", n, "out of range"))?,
            };
        }
        Field::Queue => {
            if let Some(queue) = &def.queue {
                fields::validate_name("queue", queue)?;
                dag.queue = queue.clone();
            }
        }
        Field::MaxOutputSize => {
            if let Some(size) = def.max_output_size {
                if size < 0 {
                    return Err(field_err_val("maxOutputSize", size, "must be >= 0"));
                }
                dag.max_output_size = size;
            }
        }
        Field::SkipIfSuccessful => {
            dag.skip_if_successful = def.skip_if_successful.unwrap_or(false);
        }
        Field::LogDir => dag.log_dir = def.log_dir.clone().unwrap_or_default(),
        Field::LogOutput => dag.log_output = def.log_output.unwrap_or(false),
        Field::MailOn => {
            if let Some(mail_on) = &def.mail_on {
                dag.mail_on = Some(MailOn {
                    failure: mail_on.failure.unwrap_or(false),
                    success: mail_on.success.unwrap_or(false),
                });
            }
        }
        Field::RunConfig => {
            if let Some(rc) = &def.run_config {
                dag.run_config = Some(RunConfig {
                    disable_param_edit: rc.disable_param_edit.unwrap_or(false),
                    disable_run_id_edit: rc.disable_run_id_edit.unwrap_or(false),
                });
            }
        }
        Field::HistRetentionDays => {
            dag.hist_retention_days = def
                .hist_retention_days
                .unwrap_or(DEFAULT_HIST_RETENTION_DAYS);
        }
        Field::MaxCleanupTime => {
            dag.max_cleanup_time = fields::seconds(def.max_cleanup_time_sec.unwrap_or(0));
        }
        Field::Shell => {
            if let Some(shell) = &def.shell {
                let (command, args) = fields::build_shell(shell)?;
                dag.shell = command;
                dag.shell_args = args;
            }
        }
        Field::WorkingDir => {
            dag.working_dir = fields::build_working_dir(
                def.working_dir.as_deref(),
                bctx.spec_dir(),
                bctx.opts.default_working_dir.as_deref(),
            );
        }
        Field::Container => {
            if let Some(value) = &def.container {
                dag.container = Some(fields::build_container("container", value)?);
            }
        }
        Field::RegistryAuths => {
            if let Some(value) = &def.registry_auths {
                dag.registry_auths = fields::build_registry_auths(value)?;
            }
        }
        Field::Ssh => {
            if let Some(ssh) = &def.ssh {
                dag.ssh = Some(fields::build_ssh(ssh)?);
            }
        }
        Field::Llm => {
            if let Some(llm) = &def.llm {
                dag.llm = Some(fields::build_llm(llm)?);
            }
        }
        Field::Secrets => {
            if let Some(secrets) = &def.secrets {
                let mut out = Vec::with_capacity(secrets.len());
                for secret in secrets {
                    let name = secret
                        .name
                        .clone()
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| field_err("secrets", "secret requires a name"))?;
                    let provider = secret
                        .provider
                        .clone()
                        .filter(|p| !p.is_empty())
                        .ok_or_else(|| {
                            field_err_val("secrets", &name, "secret requires a provider")
                        })?;
                    let key = secret
                        .key
                        .clone()
                        .filter(|k| !k.is_empty())
                        .ok_or_else(|| field_err_val("secrets", &name, "secret requires a key"))?;
                    if out.iter().any(|s: &SecretRef| s.name == name) {
                        return Err(field_err_val("secrets", &name, "duplicate secret name"));
                    }
                    out.push(SecretRef {
                        name,
                        provider,
                        key,
                        version: secret.version.clone(),
                    });
                }
                dag.secrets = out;
            }
        }
        Field::Dotenv => {
            dag.dotenv = def
                .dotenv
                .clone()
                .map(StringOrList::into_vec)
                .unwrap_or_else(|| vec![".env".to_string()]);
        }
        Field::Smtp => {
            if let Some(smtp) = &def.smtp {
                dag.smtp = Some(fields::build_smtp(smtp));
            }
        }
        Field::ErrorMail => {
            if let Some(mail) = &def.error_mail {
                dag.error_mail = Some(fields::build_mail(mail));
            }
        }
        Field::InfoMail => {
            if let Some(mail) = &def.info_mail {
                dag.info_mail = Some(fields::build_mail(mail));
            }
        }
        Field::WaitMail => {
            if let Some(mail) = &def.wait_mail {
                dag.wait_mail = Some(fields::build_mail(mail));
            }
        }
        Field::Preconditions => {
            for value in [&def.precondition, &def.preconditions].into_iter().flatten() {
                dag.preconditions
                    .extend(fields::parse_preconditions("preconditions", value)?);
            }
        }
        Field::Otel => {
            if let Some(otel) = &def.otel {
                dag.otel = Some(trellis_core::dag::OtelConfig {
                    endpoint: otel.endpoint.clone().unwrap_or_default(),
                    headers: otel.headers.clone().unwrap_or_default(),
                    insecure: otel.insecure.unwrap_or(false),
                    timeout: otel
                        .timeout
                        .as_ref()
                        .map(|v| fields::yaml_duration("otel", v))
                        .transpose()?,
                });
            }
        }
    }
    Ok(())
}

/// Load declared dotenv files (default `.env`) into the scope without
/// touching the process environment. Missing files are not an error.
fn load_dotenv_layer(bctx: &mut BuildContext<'_>, def: &WorkflowDefinition) {
    let candidates = def
        .dotenv
        .clone()
        .map(StringOrList::into_vec)
        .unwrap_or_else(|| vec![".env".to_string()]);
    let mut vars = Vec::new();
    for candidate in candidates {
        let path = match bctx.spec_dir() {
            Some(dir) if !candidate.starts_with('/') && !candidate.starts_with('~') => {
                dir.join(&candidate)
            }
            _ => PathBuf::from(&candidate),
        };
        let Ok(iter) = dotenvy::from_path_iter(&path) else {
            continue;
        };
        debug!(path = %path.display(), "Loaded dotenv file");
        for item in iter.flatten() {
            vars.push(item);
        }
    }
    if !vars.is_empty() {
        bctx.scope.push_layer(VarSource::DotEnv, vars);
    }
}

const HANDLER_SLOTS: &[(&str, &str)] = &[
    ("init", "onInit"),
    ("success", "onSuccess"),
    ("failure", "onFailure"),
    ("abort", "onAbort"),
    ("wait", "onWait"),
    ("exit", "onExit"),
];

fn build_handlers(bctx: &mut BuildContext<'_>, def: &WorkflowDefinition, dag: &mut Dag) {
    let Some(handlers) = &def.handler_on else {
        return;
    };
    if handlers.abort.is_some() && handlers.cancel.is_some() {
        bctx.errors.push(field_err(
            "handlerOn",
            "abort and cancel are mutually exclusive",
        ));
        return;
    }
    let mut abort_value = handlers.abort.clone();
    if let Some(cancel) = &handlers.cancel {
        let notice = "handlerOn.cancel is deprecated, use handlerOn.abort instead".to_string();
        warn!("{}", notice);
        bctx.warnings.push(notice);
        abort_value = Some(cancel.clone());
    }

    let values = [
        handlers.init.clone(),
        handlers.success.clone(),
        handlers.failure.clone(),
        abort_value,
        handlers.wait.clone(),
        handlers.exit.clone(),
    ];
    for ((_, default_name), value) in HANDLER_SLOTS.iter().zip(values) {
        let Some(raw) = value else {
            continue;
        };
        match build_step(&raw, None, 0, dag, &StepDefaults::default(), &mut bctx.warnings) {
            Ok(mut step) => {
                if step.name.is_empty() {
                    step.name = default_name.to_string();
                }
                let slot = match *default_name {
                    "onInit" => &mut dag.handler_on.init,
                    "onSuccess" => &mut dag.handler_on.success,
                    "onFailure" => &mut dag.handler_on.failure,
                    "onAbort" => &mut dag.handler_on.abort,
                    "onWait" => &mut dag.handler_on.wait,
                    _ => &mut dag.handler_on.exit,
                };
                *slot = Some(step);
            }
            Err(e) => bctx.errors.push(e),
        }
    }
}

fn build_dag_steps(bctx: &mut BuildContext<'_>, def: &WorkflowDefinition, dag: &mut Dag) {
    let Some(value) = &def.steps else {
        return;
    };
    let built = build_steps(
        value,
        dag,
        &StepDefaults::default(),
        &mut bctx.warnings,
        &mut bctx.errors,
    );
    let mut steps = built.steps;
    if built.ordered && dag.dag_type == trellis_core::dag::DagType::Chain {
        inject_chain_dependencies(&mut steps, &built.groups);
    }
    dag.steps = steps;
}

/// Whole-workflow validations that need the finished step list.
fn global_validations(dag: &Dag) -> Vec<BuildError> {
    let mut errors = Vec::new();
    if dag.has_hitl_steps() && !dag.worker_selector.is_empty() {
        errors.push(field_err(
            "workerSelector",
            "workflows with human-in-the-loop steps cannot use a worker selector",
        ));
    }
    errors.extend(validate_dependencies(&dag.steps));
    errors
}

/// Dependency well-formedness: every referenced identifier exists and the
/// graph is acyclic.
fn validate_dependencies(steps: &[Step]) -> Vec<BuildError> {
    let mut errors = Vec::new();
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index_of = HashMap::new();
    for step in steps {
        let idx = graph.add_node(step.name.as_str());
        index_of.insert(step.name.as_str(), idx);
        if !step.id.is_empty() {
            index_of.insert(step.id.as_str(), idx);
        }
    }
    for step in steps {
        let step_idx = index_of[step.name.as_str()];
        for dep in &step.depends {
            match index_of.get(dep.as_str()) {
                Some(&dep_idx) => {
                    graph.add_edge(dep_idx, step_idx, ());
                }
                None => errors.push(field_err_val(
                    "steps",
                    dep,
                    format!("unknown dependency for step {}", step.name),
                )),
            }
        }
    }
    if toposort(&graph, None).is_err() {
        errors.push(field_err("steps", "dependency cycle detected"));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(name: &str, depends: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_unknown_dependency_reported() {
        let errors = validate_dependencies(&[step("a", &["missing"])]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unknown dependency"));
    }

    #[test]
    fn test_cycle_reported() {
        let errors = validate_dependencies(&[step("a", &["b"]), step("b", &["a"])]);
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("dependency cycle")));
    }

    #[test]
    fn test_dependency_by_alternate_id() {
        let mut a = step("a", &[]);
        a.id = "first".to_string();
        let errors = validate_dependencies(&[a, step("b", &["first"])]);
        assert!(errors.is_empty());
    }
}
