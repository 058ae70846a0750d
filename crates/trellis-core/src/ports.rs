//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the compiler and external
//! adapters. The compiler consumes a command runner (for backtick and
//! `$(...)` substitutions during evaluation) and a schema fetcher (for
//! remote parameter schemas); it never talks to the outside world directly.

use crate::Result;
use async_trait::async_trait;
use std::path::Path;
use url::Url;

/// Executes shell commands for value substitution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command under `sh -c` and return its stdout.
    ///
    /// The returned output is used verbatim (the caller trims trailing
    /// whitespace); a non-zero exit is an error.
    async fn run(&self, command: &str, working_dir: Option<&Path>) -> Result<String>;
}

/// Fetches remote JSON Schemas.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    /// Fetch and parse the schema document at `url`.
    async fn fetch(&self, url: &Url) -> Result<serde_json::Value>;
}
