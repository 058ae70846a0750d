//! Raw workflow loading: path resolution and multi-document YAML.

use crate::errors::{BuildError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One untyped YAML document and its position in the source file.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub index: usize,
    pub value: serde_yaml::Value,
}

/// Resolve a workflow name or path to an existing file.
///
/// Candidates are tried in order: the reference as given, the reference
/// with a `.yaml`/`.yml` suffix appended, then the same three joined
/// against the configured DAGs directory. A leading `~` expands to the
/// user home directory.
pub fn resolve_path(name_or_path: &str, dags_dir: Option<&Path>) -> Result<PathBuf> {
    let given = expand_home(name_or_path);
    let mut candidates: Vec<PathBuf> = Vec::new();

    push_with_suffixes(&mut candidates, PathBuf::from(&given));
    if let Some(dir) = dags_dir {
        push_with_suffixes(&mut candidates, dir.join(&given));
    }

    for candidate in &candidates {
        if candidate.is_file() {
            debug!(path = %candidate.display(), "Resolved workflow file");
            return Ok(candidate.clone());
        }
    }
    Err(BuildError::FileNotFound {
        path: name_or_path.to_string(),
    })
}

fn push_with_suffixes(candidates: &mut Vec<PathBuf>, base: PathBuf) {
    let has_yaml_suffix = matches!(
        base.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if has_yaml_suffix {
        candidates.push(base);
        return;
    }
    // Append rather than replace: a dotted name like `etl.daily` must
    // probe `etl.daily.yaml`.
    let mut yaml = base.clone().into_os_string();
    yaml.push(".yaml");
    let mut yml = base.clone().into_os_string();
    yml.push(".yml");
    candidates.push(base);
    candidates.push(PathBuf::from(yaml));
    candidates.push(PathBuf::from(yml));
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest).display().to_string();
        }
    }
    path.to_string()
}

/// Stream every non-empty document out of a multi-document YAML source.
///
/// Decode failures are tagged with the document index. The returned
/// indices refer to positions in the original stream, so error messages
/// line up with the file even when empty documents are skipped.
pub fn read_documents(data: &[u8]) -> Result<Vec<RawDocument>> {
    let mut documents = Vec::new();
    for (index, de) in serde_yaml::Deserializer::from_slice(data).enumerate() {
        let value =
            serde_yaml::Value::deserialize(de).map_err(|e| BuildError::Decode {
                index,
                message: e.to_string(),
            })?;
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        documents.push(RawDocument { index, value });
    }
    Ok(documents)
}

/// The base name of a workflow file without its extension, used as the
/// default name for document 0.
pub fn default_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_read_multi_document() {
        let data = b"name: main\n---\nname: child\n";
        let docs = read_documents(data).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].index, 0);
        assert_eq!(docs[1].index, 1);
    }

    #[test]
    fn test_empty_documents_skipped() {
        let data = b"---\n---\nname: only\n";
        let docs = read_documents(data).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].index, 2);
    }

    #[test]
    fn test_empty_input_yields_no_documents() {
        assert!(read_documents(b"").unwrap().is_empty());
    }

    #[test]
    fn test_decode_error_tagged_with_index() {
        let data = b"name: ok\n---\n{ broken\n";
        let err = read_documents(data).unwrap_err();
        assert!(err.to_string().starts_with("Document 1"));
    }

    #[test]
    fn test_resolve_appends_yaml_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "name: wf").unwrap();

        let resolved = resolve_path("wf", Some(dir.path())).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn test_resolve_missing_file() {
        let err = resolve_path("nope-does-not-exist", None).unwrap_err();
        assert!(matches!(err, BuildError::FileNotFound { .. }));
    }

    #[test]
    fn test_default_name_strips_extension() {
        assert_eq!(default_name(Path::new("/tmp/etl_daily.yaml")), "etl_daily");
    }
}
