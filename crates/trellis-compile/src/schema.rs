//! Parameter schema resolution, defaults, and validation.
//!
//! A params record may reference a JSON Schema by URL or by path. Remote
//! schemas go through the [`SchemaFetcher`] port; local ones are probed
//! against several base directories in a fixed order. Schema `default`s
//! are applied before validation so unset keys carry their declared
//! defaults into the output.

use crate::errors::{field_err, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use trellis_core::ports::SchemaFetcher;
use trellis_core::step::ParamPair;
use url::Url;

/// Inputs for resolving a schema reference.
pub(crate) struct SchemaContext<'a> {
    pub fetcher: &'a dyn SchemaFetcher,
    /// The workflow's `workingDir`, when set.
    pub working_dir: Option<&'a str>,
    /// Directory of the workflow file, when loaded from disk.
    pub spec_dir: Option<&'a Path>,
}

/// Resolve a schema reference into its parsed JSON document.
pub(crate) async fn resolve_schema(
    ctx: &SchemaContext<'_>,
    schema_ref: &str,
) -> Result<serde_json::Value> {
    if schema_ref.contains("://") {
        let url = Url::parse(schema_ref)
            .map_err(|e| field_err("params", format!("invalid schema URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(field_err(
                "params",
                format!("unsupported schema URL scheme: {}", url.scheme()),
            ));
        }
        debug!(url = %url, "Fetching remote parameter schema");
        return Ok(ctx.fetcher.fetch(&url).await?);
    }

    let mut candidates: Vec<PathBuf> = vec![PathBuf::from(expand_path(schema_ref))];
    if let Some(dir) = ctx.working_dir {
        candidates.push(Path::new(dir).join(schema_ref));
    }
    if let Some(dir) = ctx.spec_dir {
        candidates.push(dir.join(schema_ref));
    }

    let mut tried = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        match std::fs::read(candidate) {
            Ok(bytes) => {
                debug!(path = %candidate.display(), "Resolved parameter schema");
                return serde_json::from_slice(&bytes)
                    .map_err(|e| field_err("params", format!("schema JSON invalid: {}", e)));
            }
            Err(_) => tried.push(candidate.display().to_string()),
        }
    }
    Err(field_err(
        "params",
        format!("schema not found; tried: {}", tried.join(", ")),
    ))
}

/// Expand `~` and `${VAR}` in a schema path. Reads the process
/// environment but never writes it.
fn expand_path(raw: &str) -> String {
    let mut path = raw.to_string();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            path = dirs.home_dir().join(rest).display().to_string();
        }
    }
    while let Some(start) = path.find("${") {
        let Some(end) = path[start..].find('}') else {
            break;
        };
        let name = &path[start + 2..start + end];
        let value = std::env::var(name).unwrap_or_default();
        path.replace_range(start..start + end + 1, &value);
    }
    path
}

/// Append defaults for schema properties not already present, in sorted
/// property order. Returns the appended pairs.
pub(crate) fn apply_defaults(
    schema: &serde_json::Value,
    pairs: &mut Vec<ParamPair>,
) -> Vec<ParamPair> {
    let Some(props) = schema.get("properties").and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    let mut added = Vec::new();
    for (key, prop) in props {
        if pairs.iter().any(|p| &p.name == key) {
            continue;
        }
        if let Some(default) = prop.get("default") {
            let pair = ParamPair::new(key.clone(), json_scalar_to_string(default));
            pairs.push(pair.clone());
            added.push(pair);
        }
    }
    added
}

fn json_scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reinterpret a resolved string value as the matching JSON scalar so
/// typed schema constraints apply.
pub(crate) fn coerce_scalar(value: &str) -> serde_json::Value {
    if let Ok(n) = value.parse::<i64>() {
        return serde_json::Value::Number(n.into());
    }
    if let Ok(f) = value.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return serde_json::Value::Number(n);
        }
    }
    match value {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        other => serde_json::Value::String(other.to_string()),
    }
}

/// Validate the resolved parameter map against the schema.
pub(crate) fn validate(schema: &serde_json::Value, pairs: &[ParamPair]) -> Result<()> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| field_err("params", format!("invalid schema: {}", e)))?;

    let mut instance = serde_json::Map::new();
    for pair in pairs {
        instance.insert(pair.name.clone(), coerce_scalar(&pair.value));
    }
    let instance = serde_json::Value::Object(instance);

    let messages: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(field_err("params", messages.join("; ")))
    }
}
