//! Merging a shared base workflow into per-document results.
//!
//! Scalar and struct fields keep the document's value when it is non-zero
//! and fall back to the base otherwise. String-list fields append: base
//! entries first, document entries after. `mail_on` has pointer-override
//! semantics: a document value wins even when all its flags are false.

use trellis_core::dag::{Dag, HandlerOn};

fn pick_string(doc: String, base: &str) -> String {
    if doc.is_empty() {
        base.to_string()
    } else {
        doc
    }
}

fn append_dedup(base: &[String], doc: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = base.to_vec();
    for entry in doc {
        if !out.contains(&entry) {
            out.push(entry);
        }
    }
    out
}

/// Merge `base` underneath `doc`, returning the combined workflow.
pub(crate) fn merge_base(base: &Dag, mut doc: Dag, skip_base_handlers: bool) -> Dag {
    doc.group = pick_string(doc.group, &base.group);
    doc.description = pick_string(doc.description, &base.description);
    doc.queue = pick_string(doc.queue, &base.queue);
    doc.shell = pick_string(doc.shell, &base.shell);
    if doc.shell_args.is_empty() {
        doc.shell_args = base.shell_args.clone();
    }
    doc.working_dir = pick_string(doc.working_dir, &base.working_dir);
    doc.log_dir = pick_string(doc.log_dir, &base.log_dir);
    doc.log_output = doc.log_output || base.log_output;
    doc.skip_if_successful = doc.skip_if_successful || base.skip_if_successful;

    if doc.schedule.is_empty() {
        doc.schedule = base.schedule.clone();
    }
    if doc.stop_schedule.is_empty() {
        doc.stop_schedule = base.stop_schedule.clone();
    }
    if doc.restart_schedule.is_empty() {
        doc.restart_schedule = base.restart_schedule.clone();
    }

    // String lists append: base first, then the document.
    doc.env = {
        let mut env = base.env.clone();
        env.extend(doc.env);
        env
    };
    doc.tags = append_dedup(&base.tags, doc.tags);
    doc.dotenv = append_dedup(&base.dotenv, doc.dotenv);
    doc.preconditions = {
        let mut conds = base.preconditions.clone();
        conds.extend(doc.preconditions);
        conds
    };

    if doc.params.is_empty() {
        doc.params = base.params.clone();
        doc.default_params = base.default_params.clone();
        doc.params_json = base.params_json.clone();
    }
    if doc.steps.is_empty() {
        doc.steps = base.steps.clone();
    }

    if doc.timeout.is_zero() {
        doc.timeout = base.timeout;
    }
    if doc.delay.is_zero() {
        doc.delay = base.delay;
    }
    if doc.restart_wait.is_zero() {
        doc.restart_wait = base.restart_wait;
    }
    if doc.max_cleanup_time.is_zero() {
        doc.max_cleanup_time = base.max_cleanup_time;
    }
    if doc.max_active_runs == 0 {
        doc.max_active_runs = base.max_active_runs;
    }
    if doc.max_active_steps == 0 {
        doc.max_active_steps = base.max_active_steps;
    }
    if doc.max_output_size == 0 {
        doc.max_output_size = base.max_output_size;
    }
    if doc.hist_retention_days == 0 {
        doc.hist_retention_days = base.hist_retention_days;
    }

    doc.smtp = doc.smtp.or_else(|| base.smtp.clone());
    doc.error_mail = doc.error_mail.or_else(|| base.error_mail.clone());
    doc.info_mail = doc.info_mail.or_else(|| base.info_mail.clone());
    doc.wait_mail = doc.wait_mail.or_else(|| base.wait_mail.clone());
    // Pointer-override semantics: a document mail_on wins even when all
    // its flags are zero.
    doc.mail_on = doc.mail_on.or(base.mail_on);
    doc.ssh = doc.ssh.or_else(|| base.ssh.clone());
    doc.container = doc.container.or_else(|| base.container.clone());
    doc.llm = doc.llm.or_else(|| base.llm.clone());
    doc.otel = doc.otel.or_else(|| base.otel.clone());
    doc.run_config = doc.run_config.or(base.run_config);
    if doc.secrets.is_empty() {
        doc.secrets = base.secrets.clone();
    }
    if doc.registry_auths.is_empty() {
        doc.registry_auths = base.registry_auths.clone();
    }
    if doc.worker_selector.is_empty() {
        doc.worker_selector = base.worker_selector.clone();
    }

    if !skip_base_handlers {
        doc.handler_on = merge_handlers(&base.handler_on, doc.handler_on);
    }

    doc
}

fn merge_handlers(base: &HandlerOn, doc: HandlerOn) -> HandlerOn {
    HandlerOn {
        init: doc.init.or_else(|| base.init.clone()),
        success: doc.success.or_else(|| base.success.clone()),
        failure: doc.failure.or_else(|| base.failure.clone()),
        abort: doc.abort.or_else(|| base.abort.clone()),
        wait: doc.wait.or_else(|| base.wait.clone()),
        exit: doc.exit.or_else(|| base.exit.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use trellis_core::dag::MailOn;
    use trellis_core::step::Step;

    fn base() -> Dag {
        Dag {
            group: "shared".to_string(),
            env: vec!["BASE=1".to_string()],
            timeout: Duration::from_secs(600),
            mail_on: Some(MailOn {
                failure: true,
                success: true,
            }),
            handler_on: HandlerOn {
                failure: Some(Step {
                    name: "notify".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_scalar_override_when_non_zero() {
        let doc = Dag {
            group: "mine".to_string(),
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let merged = merge_base(&base(), doc, false);
        assert_eq!(merged.group, "mine");
        assert_eq!(merged.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_scalar_falls_back_to_base() {
        let merged = merge_base(&base(), Dag::default(), false);
        assert_eq!(merged.group, "shared");
        assert_eq!(merged.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_env_appends_base_first() {
        let doc = Dag {
            env: vec!["DOC=1".to_string()],
            ..Default::default()
        };
        let merged = merge_base(&base(), doc, false);
        assert_eq!(merged.env, vec!["BASE=1", "DOC=1"]);
    }

    #[test]
    fn test_mail_on_pointer_override_with_zero_value() {
        let doc = Dag {
            mail_on: Some(MailOn::default()),
            ..Default::default()
        };
        let merged = merge_base(&base(), doc, false);
        assert_eq!(merged.mail_on, Some(MailOn::default()));
    }

    #[test]
    fn test_base_handlers_suppressed_on_flag() {
        let merged = merge_base(&base(), Dag::default(), true);
        assert!(merged.handler_on.failure.is_none());
        let merged = merge_base(&base(), Dag::default(), false);
        assert_eq!(merged.handler_on.failure.unwrap().name, "notify");
    }
}
