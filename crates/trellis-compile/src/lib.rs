//! Trellis Workflow Compiler
//!
//! Compiles declarative workflow YAML into a fully-resolved, validated
//! [`Dag`] for the execution engine. The compiler owns parsing, staged
//! variable expansion, parameter resolution (including JSON Schema
//! validation), the per-field transformer pipeline, step building with
//! implicit chain dependencies, base-config merging, and multi-document
//! assembly. It performs no execution and holds no background resources;
//! external effects go through the [`trellis_core::ports`] capabilities.

mod build;
mod chain;
mod errors;
pub mod eval;
mod exec;
mod fields;
mod merge;
mod params;
mod raw;
mod schema;
pub mod scope;
mod spec;
mod steps;

pub use build::{CompileContext, LoadOptions};
pub use errors::{BuildError, ErrorList, Result};
pub use exec::{HttpSchemaFetcher, ShellCommandRunner};

use std::path::Path;
use tracing::debug;
use trellis_core::dag::Dag;

/// Load a workflow from a name or path.
///
/// The reference is resolved against the current directory, the configured
/// DAGs directory, and with a `.yaml`/`.yml` suffix appended. When a base
/// config is set it is compiled first and merged underneath every
/// document. Document 0 becomes the main workflow; the rest become
/// [`Dag::local_dags`] entries keyed by their mandatory unique names.
pub async fn load(ctx: &CompileContext, name_or_path: &str, opts: LoadOptions) -> Result<Dag> {
    let path = match raw::resolve_path(name_or_path, opts.dags_dir.as_deref()) {
        Ok(path) => path,
        Err(err) => return stub_or_err(err, &opts, name_or_path),
    };
    debug!(path = %path.display(), "Loading workflow");
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) => return stub_or_err(BuildError::Io(err), &opts, name_or_path),
    };

    let base = match &opts.base_config {
        Some(base_path) => Some(load_base(ctx, base_path, opts.clone()).await?),
        None => None,
    };

    compile_documents(ctx, &opts, &data, Some(&path), base.as_ref()).await
}

/// Compile a workflow from in-memory bytes.
///
/// Skips path resolution, base merging, and sub-DAG assembly: only
/// document 0 is compiled.
pub async fn load_yaml(ctx: &CompileContext, data: &[u8], opts: LoadOptions) -> Result<Dag> {
    let docs = match raw::read_documents(data) {
        Ok(docs) => docs,
        Err(err) => return stub_or_err(err, &opts, ""),
    };
    let def = match docs.first() {
        Some(doc) => match spec::decode_document(doc.index, doc.value.clone()) {
            Ok(def) => def,
            Err(err) => return stub_or_err(err, &opts, ""),
        },
        None => Default::default(),
    };
    let mut dag = build::build_dag(ctx, &opts, &def, None, None).await?;
    dag.yaml_data = data.to_vec();
    Ok(dag)
}

/// Compile a shared base config on its own. Caller params and name
/// overrides do not apply to the base.
pub async fn load_base(ctx: &CompileContext, path: &Path, opts: LoadOptions) -> Result<Dag> {
    let data = tokio::fs::read(path).await?;
    let docs = raw::read_documents(&data)?;
    let def = match docs.first() {
        Some(doc) => spec::decode_document(doc.index, doc.value.clone())?,
        None => Default::default(),
    };
    let base_opts = LoadOptions {
        base_config: None,
        params: None,
        params_list: Vec::new(),
        name: None,
        ..opts
    };
    let fallback = raw::default_name(path);
    let mut dag = build::build_dag(ctx, &base_opts, &def, Some(path), Some(&fallback)).await?;
    dag.location = path.display().to_string();
    dag.yaml_data = data;
    Ok(dag)
}

async fn compile_documents(
    ctx: &CompileContext,
    opts: &LoadOptions,
    data: &[u8],
    path: Option<&Path>,
    base: Option<&Dag>,
) -> Result<Dag> {
    let display_name = path
        .map(|p| raw::default_name(p))
        .unwrap_or_default();
    let docs = match raw::read_documents(data) {
        Ok(docs) => docs,
        Err(err) => return stub_or_err(err, opts, &display_name),
    };

    // Document 0 is the main workflow; it alone may omit a name.
    let main_def = match docs.first() {
        Some(doc) => match spec::decode_document(doc.index, doc.value.clone()) {
            Ok(def) => def,
            Err(err) => return stub_or_err(err, opts, &display_name),
        },
        None => Default::default(),
    };
    let fallback = path.map(raw::default_name);
    let mut main = build::build_dag(ctx, opts, &main_def, path, fallback.as_deref()).await?;
    if let Some(base) = base {
        main = merge::merge_base(base, main, opts.skip_base_handlers);
    }
    if let Some(path) = path {
        main.location = path.display().to_string();
    }
    main.yaml_data = data.to_vec();

    // Remaining documents become local sub-DAGs. Overrides from the
    // caller apply to the main workflow only.
    let sub_opts = LoadOptions {
        params: None,
        params_list: Vec::new(),
        name: None,
        ..opts.clone()
    };
    for doc in docs.iter().skip(1) {
        let def = match spec::decode_document(doc.index, doc.value.clone()) {
            Ok(def) => def,
            Err(err) => {
                if opts.allow_build_errors {
                    main.build_errors.push(err.to_diagnostic());
                    continue;
                }
                return Err(err);
            }
        };
        if def.name.as_deref().unwrap_or("").is_empty() {
            let err = BuildError::MissingName(doc.index);
            if opts.allow_build_errors {
                main.build_errors.push(err.to_diagnostic());
                continue;
            }
            return Err(err);
        }

        let mut sub = build::build_dag(ctx, &sub_opts, &def, path, None).await?;
        if let Some(base) = base {
            sub = merge::merge_base(base, sub, opts.skip_base_handlers);
        }
        if let Some(path) = path {
            sub.location = path.display().to_string();
        }
        // Sub-DAGs carry their own re-marshalled bytes.
        sub.yaml_data = serde_yaml::to_string(&doc.value)
            .map(String::into_bytes)
            .unwrap_or_default();

        if main.local_dags.contains_key(&sub.name) {
            let err = BuildError::DuplicateName(sub.name.clone());
            if opts.allow_build_errors {
                main.build_errors.push(err.to_diagnostic());
                continue;
            }
            return Err(err);
        }
        main.local_dags.insert(sub.name.clone(), sub);
    }

    Ok(main)
}

/// Under errors-allowed mode a loader failure still yields a stub DAG
/// carrying the diagnostic.
fn stub_or_err(err: BuildError, opts: &LoadOptions, name_hint: &str) -> Result<Dag> {
    if matches!(err, BuildError::Cancelled) || !opts.allow_build_errors {
        return Err(err);
    }
    let mut dag = Dag {
        name: opts
            .name
            .clone()
            .unwrap_or_else(|| name_hint.to_string()),
        ..Default::default()
    };
    dag.build_errors.push(err.to_diagnostic());
    Ok(dag)
}
