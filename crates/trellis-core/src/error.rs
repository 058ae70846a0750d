//! Error types for Trellis.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // Command substitution errors
    #[error("Command failed: {command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Command exited with code {code}: {stderr}")]
    CommandExited { code: i32, stderr: String },

    // Schema fetch errors
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Schema fetch failed with status {status}: {url}")]
    SchemaFetchStatus { status: u16, url: String },

    #[error("Schema fetch failed: {url}: {message}")]
    SchemaFetch { url: String, message: String },

    // Cancellation
    #[error("Operation cancelled")]
    Cancelled,

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
