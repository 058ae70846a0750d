//! Parameter parsing, override application, and evaluation.
//!
//! Declared parameters arrive in any of several YAML shapes: nothing, a
//! single string, a list of strings, a list of keyed records, one keyed
//! record, or a keyed record with `schema:`/`values:` sub-keys. The
//! resolver normalises everything into an ordered list of named pairs,
//! applies caller overrides, evaluates values left-to-right (earlier pairs
//! visible to later ones), and derives the positional and `KEY=VALUE`
//! views.

use crate::errors::{field_err, BuildError, Result};
use crate::eval::Evaluator;
use crate::schema::{self, SchemaContext};
use crate::scope::EnvScope;
use regex::Regex;
use std::sync::LazyLock;
use trellis_core::step::ParamPair;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:([^\s=]+)=)?("(?:\\"|[^"])*"|`(?:\\`|[^`])*`|[^"\s]+)"#).expect("valid regex")
});

/// A parsed-but-unevaluated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawParam {
    pub name: Option<String>,
    pub value: String,
}

/// Outcome of parsing a params value.
#[derive(Debug, Clone, Default)]
pub struct ParsedParams {
    pub pairs: Vec<RawParam>,
    /// Set when the input was a verbatim JSON payload.
    pub json: Option<String>,
    /// Set when the params record carried a `schema:` reference.
    pub schema_ref: Option<String>,
}

/// Fully-resolved parameters and their derived views.
#[derive(Debug, Clone, Default)]
pub struct ResolvedParams {
    pub pairs: Vec<ParamPair>,
    /// `KEY=VALUE` strings, positional slots auto-named `1`, `2`, ….
    pub params: Vec<String>,
    /// Shell-escaped join of the originally-declared set.
    pub default_params: String,
    pub params_json: Option<String>,
}

/// Parse one params string: `key=value`, bare values, double-quoted
/// values, and backtick substrings. A leading/trailing JSON object or
/// array short-circuits into a single verbatim payload.
pub fn parse_string(input: &str) -> ParsedParams {
    let trimmed = input.trim();
    if looks_like_json(trimmed) && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return ParsedParams {
            pairs: vec![RawParam {
                name: None,
                value: trimmed.to_string(),
            }],
            json: Some(trimmed.to_string()),
            schema_ref: None,
        };
    }

    let mut pairs = Vec::new();
    for caps in TOKEN_RE.captures_iter(input) {
        let name = caps.get(1).map(|m| m.as_str().to_string());
        let raw_value = caps.get(2).map_or("", |m| m.as_str());
        pairs.push(RawParam {
            name,
            value: unquote(raw_value),
        });
    }
    ParsedParams {
        pairs,
        json: None,
        schema_ref: None,
    }
}

fn looks_like_json(s: &str) -> bool {
    s.starts_with('{') || s.starts_with('[') || s.ends_with('}') || s.ends_with(']')
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        return inner.replace("\\\"", "\"").replace("\\\\", "\\");
    }
    raw.to_string()
}

fn scalar_to_string(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => {
            let json = serde_json::to_value(other)
                .map_err(|e| field_err("params", e.to_string()))?;
            Ok(json.to_string())
        }
    }
}

/// Keyed records iterate keys in sorted order for determinism.
fn parse_mapping(map: &serde_yaml::Mapping) -> Result<Vec<RawParam>> {
    let mut keys: Vec<String> = Vec::with_capacity(map.len());
    for key in map.keys() {
        match key.as_str() {
            Some(k) => keys.push(k.to_string()),
            None => return Err(field_err("params", "parameter names must be strings")),
        }
    }
    keys.sort();
    let mut pairs = Vec::with_capacity(keys.len());
    for key in keys {
        let value = map
            .get(key.as_str())
            .map(scalar_to_string)
            .transpose()?
            .unwrap_or_default();
        pairs.push(RawParam {
            name: Some(key),
            value,
        });
    }
    Ok(pairs)
}

/// Parse a declared params value in any of its accepted shapes.
pub fn parse_value(value: &serde_yaml::Value) -> Result<ParsedParams> {
    match value {
        serde_yaml::Value::Null => Ok(ParsedParams::default()),
        serde_yaml::Value::String(s) => Ok(parse_string(s)),
        serde_yaml::Value::Number(n) => Ok(ParsedParams {
            pairs: vec![RawParam {
                name: None,
                value: n.to_string(),
            }],
            ..Default::default()
        }),
        serde_yaml::Value::Sequence(items) => {
            let mut pairs = Vec::new();
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => pairs.extend(parse_string(s).pairs),
                    serde_yaml::Value::Mapping(map) => pairs.extend(parse_mapping(map)?),
                    serde_yaml::Value::Number(n) => pairs.push(RawParam {
                        name: None,
                        value: n.to_string(),
                    }),
                    serde_yaml::Value::Bool(b) => pairs.push(RawParam {
                        name: None,
                        value: b.to_string(),
                    }),
                    _ => return Err(field_err("params", "unsupported parameter entry")),
                }
            }
            Ok(ParsedParams {
                pairs,
                ..Default::default()
            })
        }
        serde_yaml::Value::Mapping(map) => {
            if let Some(schema_value) = map.get("schema") {
                let schema_ref = match schema_value.as_str() {
                    Some(s) => s.to_string(),
                    None => return Err(field_err("params", "schema must be a string")),
                };
                if let Some(unknown) = map.keys().find_map(|k| match k.as_str() {
                    Some("schema") | Some("values") => None,
                    other => Some(other.unwrap_or("<non-string>").to_string()),
                }) {
                    return Err(field_err(
                        "params",
                        format!("unknown key beside schema/values: {}", unknown),
                    ));
                }
                let pairs = match map.get("values") {
                    Some(serde_yaml::Value::Mapping(values)) => parse_mapping(values)?,
                    Some(serde_yaml::Value::Null) | None => Vec::new(),
                    Some(_) => return Err(field_err("params", "values must be a keyed record")),
                };
                return Ok(ParsedParams {
                    pairs,
                    json: None,
                    schema_ref: Some(schema_ref),
                });
            }
            Ok(ParsedParams {
                pairs: parse_mapping(map)?,
                ..Default::default()
            })
        }
        _ => Err(field_err("params", "unsupported params shape")),
    }
}

/// Apply caller overrides: named overrides replace by name, unnamed
/// overrides replace positional slots in order, excess positionals append.
pub fn apply_overrides(declared: &mut Vec<RawParam>, overrides: &[RawParam]) {
    let mut positional_cursor = 0;
    for over in overrides {
        match &over.name {
            Some(name) => {
                match declared.iter_mut().find(|p| p.name.as_deref() == Some(name)) {
                    Some(existing) => existing.value = over.value.clone(),
                    None => declared.push(over.clone()),
                }
            }
            None => {
                let slot = declared
                    .iter_mut()
                    .filter(|p| p.name.is_none())
                    .nth(positional_cursor);
                match slot {
                    Some(existing) => existing.value = over.value.clone(),
                    None => declared.push(over.clone()),
                }
                positional_cursor += 1;
            }
        }
    }
}

/// Shell-escaped join of declared pairs, used for sub-DAG invocation.
pub fn join_declared(pairs: &[RawParam]) -> String {
    let rendered: Vec<String> = pairs
        .iter()
        .map(|p| match &p.name {
            Some(name) => format!("{}={}", name, p.value),
            None => p.value.clone(),
        })
        .collect();
    shell_words::join(rendered.iter().map(String::as_str))
}

/// Evaluate pairs left-to-right. The accumulator carries `$1..$i` and all
/// prior named pairs; named results are also published to the scope so
/// step-level references see them.
async fn evaluate_pairs(
    evaluator: &Evaluator<'_>,
    scope: &mut EnvScope,
    raw: Vec<RawParam>,
) -> Result<Vec<ParamPair>> {
    let mut accumulated: Vec<(String, String)> = Vec::new();
    let mut out = Vec::with_capacity(raw.len());
    for (i, pair) in raw.into_iter().enumerate() {
        let value = evaluator
            .evaluate_strict(&pair.value, scope, &accumulated)
            .await
            .map_err(|e| match e {
                trellis_core::Error::Cancelled => BuildError::Cancelled,
                other => field_err("params", other.to_string()),
            })?;
        let index_name = (i + 1).to_string();
        accumulated.push((index_name.clone(), value.clone()));
        let name = match pair.name {
            Some(name) => {
                accumulated.push((name.clone(), value.clone()));
                scope.define_param(name.clone(), value.clone());
                name
            }
            None => index_name,
        };
        out.push(ParamPair::new(name, value));
    }
    Ok(out)
}

/// Resolve declared params plus caller overrides into the final views.
///
/// `schema_ctx` is `None` when schema validation is skipped entirely.
pub(crate) async fn resolve(
    evaluator: &Evaluator<'_>,
    scope: &mut EnvScope,
    declared: Option<&serde_yaml::Value>,
    override_string: Option<&str>,
    override_list: &[String],
    schema_ctx: Option<&SchemaContext<'_>>,
) -> Result<ResolvedParams> {
    let parsed = match declared {
        Some(value) => parse_value(value)?,
        None => ParsedParams::default(),
    };
    let default_params = join_declared(&parsed.pairs);

    let mut pairs = parsed.pairs;
    let mut params_json = parsed.json;

    let mut overrides: Vec<RawParam> = Vec::new();
    if let Some(s) = override_string {
        let parsed_override = parse_string(s);
        if let Some(json) = parsed_override.json {
            params_json = Some(json);
        }
        overrides.extend(parsed_override.pairs);
    }
    for entry in override_list {
        overrides.extend(parse_string(entry).pairs);
    }
    apply_overrides(&mut pairs, &overrides);

    let mut evaluated = evaluate_pairs(evaluator, scope, pairs).await?;

    if let (Some(schema_ref), Some(ctx)) = (&parsed.schema_ref, schema_ctx) {
        let schema_doc = schema::resolve_schema(ctx, schema_ref).await?;
        let added = schema::apply_defaults(&schema_doc, &mut evaluated);
        for pair in added {
            scope.define_param(pair.name.clone(), pair.value.clone());
        }
        schema::validate(&schema_doc, &evaluated)?;
    }

    let params: Vec<String> = evaluated.iter().map(ParamPair::as_env).collect();
    if params_json.is_none() && !evaluated.is_empty() {
        let mut object = serde_json::Map::new();
        for pair in &evaluated {
            object.insert(pair.name.clone(), schema::coerce_scalar(&pair.value));
        }
        params_json = Some(serde_json::Value::Object(object).to_string());
    }

    Ok(ResolvedParams {
        pairs: evaluated,
        params,
        default_params,
        params_json,
    })
}

/// Parse step-level params without evaluating them; positional entries
/// get index names. Used by the step builder, which defers expansion to
/// run time.
pub fn parse_only(value: &serde_yaml::Value) -> Result<Vec<ParamPair>> {
    let parsed = parse_value(value)?;
    if parsed.schema_ref.is_some() {
        return Err(field_err("params", "schema is not allowed on step params"));
    }
    Ok(parsed
        .pairs
        .into_iter()
        .enumerate()
        .map(|(i, p)| ParamPair::new(p.name.unwrap_or_else(|| (i + 1).to_string()), p.value))
        .collect())
}

/// Render step params back into a single string for sub-DAG invocation.
pub fn stringify(value: &serde_yaml::Value) -> Result<String> {
    if let serde_yaml::Value::String(s) = value {
        return Ok(s.clone());
    }
    let parsed = parse_value(value)?;
    Ok(join_declared(&parsed.pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokenise_key_value_and_positional() {
        let parsed = parse_string(r#"k1=v1 k2="v with spaces" positional"#);
        assert_eq!(parsed.pairs.len(), 3);
        assert_eq!(parsed.pairs[0].name.as_deref(), Some("k1"));
        assert_eq!(parsed.pairs[0].value, "v1");
        assert_eq!(parsed.pairs[1].value, "v with spaces");
        assert_eq!(parsed.pairs[2].name, None);
        assert_eq!(parsed.pairs[2].value, "positional");
    }

    #[test]
    fn test_tokenise_backtick_value_preserved() {
        let parsed = parse_string("STAMP=`date +%Y`");
        assert_eq!(parsed.pairs[0].value, "`date +%Y`");
    }

    #[test]
    fn test_escaped_quote() {
        let parsed = parse_string(r#"msg="say \"hi\"""#);
        assert_eq!(parsed.pairs[0].value, r#"say "hi""#);
    }

    #[test]
    fn test_json_first_parse() {
        let parsed = parse_string(r#"{"batch": 10}"#);
        assert_eq!(parsed.pairs.len(), 1);
        assert_eq!(parsed.json.as_deref(), Some(r#"{"batch": 10}"#));
    }

    #[test]
    fn test_malformed_json_falls_back_to_tokens() {
        let parsed = parse_string("{not json");
        assert!(parsed.json.is_none());
        assert!(!parsed.pairs.is_empty());
    }

    #[test]
    fn test_mapping_iterates_sorted() {
        let value: serde_yaml::Value = serde_yaml::from_str("zeta: 1\nalpha: 2\n").unwrap();
        let parsed = parse_value(&value).unwrap();
        let names: Vec<_> = parsed
            .pairs
            .iter()
            .map(|p| p.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_list_of_records_preserves_list_order() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("- BASE: /opt\n- PATH_VAR: ${BASE}/bin\n").unwrap();
        let parsed = parse_value(&value).unwrap();
        let names: Vec<_> = parsed
            .pairs
            .iter()
            .map(|p| p.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["BASE", "PATH_VAR"]);
    }

    #[test]
    fn test_schema_values_split() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("schema: s.json\nvalues:\n  batch_size: 75\n").unwrap();
        let parsed = parse_value(&value).unwrap();
        assert_eq!(parsed.schema_ref.as_deref(), Some("s.json"));
        assert_eq!(parsed.pairs.len(), 1);
        assert_eq!(parsed.pairs[0].value, "75");
    }

    #[test]
    fn test_named_override_replaces_by_name() {
        let mut declared = vec![
            RawParam {
                name: Some("A".into()),
                value: "1".into(),
            },
            RawParam {
                name: None,
                value: "pos".into(),
            },
        ];
        apply_overrides(
            &mut declared,
            &[RawParam {
                name: Some("A".into()),
                value: "9".into(),
            }],
        );
        assert_eq!(declared[0].value, "9");
        assert_eq!(declared[1].value, "pos");
    }

    #[test]
    fn test_positional_override_replaces_slot_and_appends_excess() {
        let mut declared = vec![
            RawParam {
                name: None,
                value: "one".into(),
            },
            RawParam {
                name: None,
                value: "two".into(),
            },
        ];
        apply_overrides(
            &mut declared,
            &[
                RawParam {
                    name: None,
                    value: "ONE".into(),
                },
                RawParam {
                    name: None,
                    value: "TWO".into(),
                },
                RawParam {
                    name: None,
                    value: "THREE".into(),
                },
            ],
        );
        let values: Vec<_> = declared.iter().map(|p| p.value.clone()).collect();
        assert_eq!(values, vec!["ONE", "TWO", "THREE"]);
    }

    #[test]
    fn test_join_declared_escapes_spaces() {
        let pairs = vec![RawParam {
            name: Some("MSG".into()),
            value: "hello world".into(),
        }];
        assert_eq!(join_declared(&pairs), "'MSG=hello world'");
    }

    #[test]
    fn test_parse_only_assigns_positional_names() {
        let value: serde_yaml::Value = serde_yaml::from_str("\"first second\"").unwrap();
        let pairs = parse_only(&value).unwrap();
        assert_eq!(pairs[0].name, "1");
        assert_eq!(pairs[1].name, "2");
    }
}
