//! Build error types and aggregation.
//!
//! The compiler runs in one of two error modes. Fail-fast is the default:
//! the first phase that cannot recover turns the accumulated diagnostics
//! into a single composite [`BuildError::List`]. Under the errors-allowed
//! mode, the same diagnostics are attached to the (partially built) DAG
//! instead and the build returns it.

use thiserror::Error;
use trellis_core::dag::Diagnostic;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Document {index}: {message}")]
    Decode { index: usize, message: String },

    #[error("{0}")]
    Field(Diagnostic),

    #[error("{0}")]
    List(ErrorList),

    #[error("Duplicate workflow name: {0}")]
    DuplicateName(String),

    #[error("Document {0} must declare a workflow name")]
    MissingName(usize),

    #[error("Build cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] trellis_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Build a field-tagged error.
pub fn field_err(field: impl Into<String>, message: impl Into<String>) -> BuildError {
    BuildError::Field(Diagnostic::new(field, message))
}

/// Build a field-tagged error carrying the offending value.
pub fn field_err_val(
    field: impl Into<String>,
    value: impl ToString,
    message: impl Into<String>,
) -> BuildError {
    BuildError::Field(Diagnostic::new(field, message).with_value(value.to_string()))
}

impl BuildError {
    /// Convert into the diagnostic form carried on a compiled DAG.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            BuildError::Field(d) => d.clone(),
            BuildError::Decode { index, message } => {
                Diagnostic::new(format!("document {}", index), message.clone())
            }
            other => Diagnostic::new("build", other.to_string()),
        }
    }
}

/// Ordered collection of build errors.
///
/// Insertion order is preserved; the composite message enumerates every
/// entry on its own line.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<BuildError>);

impl std::error::Error for ErrorList {}

impl ErrorList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: BuildError) {
        // Flatten nested lists so the composite stays one level deep.
        match err {
            BuildError::List(list) => self.0.extend(list.0),
            other => self.0.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildError> {
        self.0.iter()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.0.iter().map(BuildError::to_diagnostic).collect()
    }

    /// Collapse into a result: `Ok` when empty, the composite error
    /// otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(BuildError::List(self))
        }
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
