//! Default port adapters: shell command substitution and HTTP schema
//! fetching.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;
use trellis_core::ports::{CommandRunner, SchemaFetcher};
use trellis_core::{Error, Result};
use url::Url;

/// Runs substitution commands under `sh -c` and captures stdout.
#[derive(Debug, Default)]
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, working_dir: Option<&Path>) -> Result<String> {
        debug!(command = %command, "Running substitution command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await.map_err(|e| Error::CommandFailed {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(Error::CommandExited {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Fetches remote parameter schemas over HTTP(S).
#[derive(Debug)]
pub struct HttpSchemaFetcher {
    client: reqwest::Client,
}

impl HttpSchemaFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSchemaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaFetcher for HttpSchemaFetcher {
    async fn fetch(&self, url: &Url) -> Result<serde_json::Value> {
        debug!(url = %url, "Fetching schema");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::SchemaFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::SchemaFetchStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        response.json().await.map_err(|e| Error::SchemaFetch {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}
