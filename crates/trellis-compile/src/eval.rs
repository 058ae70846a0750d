//! Build-time value evaluation.
//!
//! Expands `${NAME}` references against an [`EnvScope`] and replaces
//! backtick / `$(...)` spans with the trimmed stdout of running them
//! through the configured [`CommandRunner`]. Evaluation is pure with
//! respect to the process environment: scopes are passed in as immutable
//! snapshots and nothing is written back.

use crate::scope::EnvScope;
use regex::Regex;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use trellis_core::ports::CommandRunner;
use trellis_core::{Error, Result};

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*|[0-9]+)\}").expect("valid regex"));

static SUBST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`]+`|\$\([^()]+\)").expect("valid regex"));

/// Expands variables and command substitutions in raw values.
pub struct Evaluator<'a> {
    runner: &'a dyn CommandRunner,
    cancel: &'a CancellationToken,
    no_eval: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cancel: &'a CancellationToken, no_eval: bool) -> Self {
        Self {
            runner,
            cancel,
            no_eval,
        }
    }

    /// Evaluate a raw value. Failed command substitutions keep their
    /// literal form.
    pub async fn evaluate(
        &self,
        raw: &str,
        scope: &EnvScope,
        extra: &[(String, String)],
    ) -> Result<String> {
        self.eval_inner(raw, scope, extra, false).await
    }

    /// Evaluate a raw value, treating a failed command substitution as a
    /// fatal error. Used by the parameter resolver.
    pub async fn evaluate_strict(
        &self,
        raw: &str,
        scope: &EnvScope,
        extra: &[(String, String)],
    ) -> Result<String> {
        self.eval_inner(raw, scope, extra, true).await
    }

    async fn eval_inner(
        &self,
        raw: &str,
        scope: &EnvScope,
        extra: &[(String, String)],
        strict: bool,
    ) -> Result<String> {
        if self.no_eval {
            return Ok(raw.to_string());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let expanded = expand_vars(raw, scope, extra);
        let substituted = self.substitute_commands(&expanded, strict).await?;
        // One extra pass so substitution output may reference accumulated
        // params; anything still unresolved stays literal.
        Ok(expand_vars(&substituted, scope, extra))
    }

    async fn substitute_commands(&self, input: &str, strict: bool) -> Result<String> {
        if !SUBST_RE.is_match(input) {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for m in SUBST_RE.find_iter(input) {
            out.push_str(&input[last..m.start()]);
            let literal = m.as_str();
            let command = strip_substitution_markers(literal);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = self.runner.run(command, None) => result,
            };
            match result {
                Ok(stdout) => out.push_str(stdout.trim()),
                Err(e) if strict => {
                    return Err(Error::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(command = %command, error = %e, "Command substitution failed, keeping literal");
                    out.push_str(literal);
                }
            }
            last = m.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }
}

fn strip_substitution_markers(literal: &str) -> &str {
    if let Some(inner) = literal.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        return inner;
    }
    literal
        .strip_prefix("$(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(literal)
}

fn expand_vars(input: &str, scope: &EnvScope, extra: &[(String, String)]) -> String {
    VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            if let Some((_, v)) = extra.iter().rev().find(|(k, _)| k == name) {
                return v.clone();
            }
            match scope.lookup(name) {
                Some(v) => v.to_string(),
                None => caps[0].to_string(),
            }
        })
        .to_string()
}
