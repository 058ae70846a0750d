//! End-to-end compiler scenarios.

use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use trellis_compile::{load, load_yaml, CompileContext, LoadOptions};
use trellis_core::dag::DagType;

fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

async fn compile(yaml: &str) -> trellis_core::dag::Dag {
    load_yaml(&CompileContext::new(), yaml.as_bytes(), LoadOptions::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_chain_injection() {
    let dag = compile(
        "type: chain\nsteps:\n  - name: a\n    command: 'echo 1'\n  - name: b\n    command: 'echo 2'\n",
    )
    .await;
    assert!(dag.steps[0].depends.is_empty());
    assert_eq!(dag.steps[1].depends, vec!["a"]);
}

#[tokio::test]
async fn test_nested_sibling_groups() {
    let dag = compile(
        "type: chain\nsteps:\n  - - name: a\n      command: x\n    - name: b\n      command: y\n  - - name: c\n      command: z\n",
    )
    .await;
    assert!(dag.steps[0].depends.is_empty());
    assert!(dag.steps[1].depends.is_empty());
    assert_eq!(dag.steps[2].depends, vec!["a", "b"]);
}

#[tokio::test]
async fn test_graph_type_has_no_implicit_deps() {
    let dag = compile(
        "type: graph\nsteps:\n  - name: a\n    command: x\n  - name: b\n    command: y\n",
    )
    .await;
    assert!(dag.steps[1].depends.is_empty());
}

#[tokio::test]
async fn test_param_eval_chain() {
    let dag = compile("params:\n  - BASE: /opt\n  - PATH_VAR: \"${BASE}/bin\"\n").await;
    assert_eq!(dag.params, vec!["BASE=/opt", "PATH_VAR=/opt/bin"]);
}

#[tokio::test]
async fn test_shorthand_step_normalisation() {
    let dag = compile("steps:\n  - echo hello\n").await;
    assert_eq!(dag.steps.len(), 1);
    assert_eq!(dag.steps[0].cmd_with_args, "echo hello");
    assert_eq!(dag.steps[0].name, "cmd_1");
}

#[tokio::test]
async fn test_empty_yaml_gets_defaults() {
    let dag = compile("").await;
    assert!(dag.name.is_empty());
    assert!(dag.steps.is_empty());
    assert!(dag.local_dags.is_empty());
    assert_eq!(dag.dag_type, DagType::Chain);
    assert_eq!(dag.max_active_runs, 1);
    assert_eq!(dag.hist_retention_days, 30);
    assert_eq!(dag.dotenv, vec![".env"]);
}

#[tokio::test]
async fn test_name_defaults_to_file_basename() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "etl_daily.yaml", "steps:\n  - echo hi\n");
    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.name, "etl_daily");
    assert_eq!(dag.location, path.display().to_string());
    assert!(!dag.yaml_data.is_empty());
}

#[tokio::test]
async fn test_multi_doc_sub_dags() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.yaml",
        "name: main\nsteps:\n  - echo main\n---\nname: child\nsteps:\n  - echo child\n",
    );
    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.name, "main");
    assert!(dag.local_dags.contains_key("child"));
    let child = &dag.local_dags["child"];
    assert!(!child.yaml_data.is_empty());
    assert_ne!(child.yaml_data, dag.yaml_data);
}

#[tokio::test]
async fn test_sub_dag_without_name_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.yaml",
        "name: main\nsteps:\n  - echo main\n---\nsteps:\n  - echo child\n",
    );
    let err = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("must declare a workflow name"));
}

#[tokio::test]
async fn test_duplicate_sub_dag_names_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.yaml",
        "name: main\n---\nname: child\n---\nname: child\n",
    );
    let err = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Duplicate workflow name"));
}

#[tokio::test]
async fn test_schema_defaults_fill_unset_keys() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "s.json",
        r#"{
            "type": "object",
            "properties": {
                "batch_size": {"type": "integer", "default": 25},
                "environment": {"type": "string", "default": "dev"},
                "debug": {"type": "boolean", "default": true}
            }
        }"#,
    );
    let path = write_file(
        dir.path(),
        "wf.yaml",
        "params:\n  schema: s.json\n  values:\n    batch_size: 75\n",
    );
    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.params.len(), 3);
    assert!(dag.params.contains(&"batch_size=75".to_string()));
    assert!(dag.params.contains(&"environment=dev".to_string()));
    assert!(dag.params.contains(&"debug=true".to_string()));
}

#[tokio::test]
async fn test_schema_working_dir_candidate_wins_over_spec_dir() {
    let work_dir = tempfile::tempdir().unwrap();
    let spec_dir = tempfile::tempdir().unwrap();
    write_file(
        work_dir.path(),
        "s.json",
        r#"{"type": "object", "properties": {"from_working_dir": {"type": "string", "default": "yes"}}}"#,
    );
    write_file(
        spec_dir.path(),
        "s.json",
        r#"{"type": "object", "properties": {"from_spec_dir": {"type": "string", "default": "yes"}}}"#,
    );
    let path = write_file(
        spec_dir.path(),
        "wf.yaml",
        &format!(
            "workingDir: {}\nparams:\n  schema: s.json\n  values: {{}}\n",
            work_dir.path().display()
        ),
    );
    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.params, vec!["from_working_dir=yes"]);
}

#[tokio::test]
async fn test_schema_validation_failure_reports_params() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "s.json",
        r#"{"type": "object", "properties": {"count": {"type": "integer"}}, "required": ["count"]}"#,
    );
    let path = write_file(
        dir.path(),
        "wf.yaml",
        "params:\n  schema: s.json\n  values:\n    count: nope\n",
    );
    let err = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("params"));
}

#[tokio::test]
async fn test_skip_schema_validation_flag() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"params:\n  schema: missing-everywhere.json\n  values:\n    a: 1\n",
        LoadOptions::new().skip_schema_validation(),
    )
    .await
    .unwrap();
    assert_eq!(dag.params, vec!["a=1"]);
}

#[tokio::test]
async fn test_remote_schema_fetch() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/schema.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "type": "object",
            "properties": {"region": {"type": "string", "default": "eu-west-1"}}
        })))
        .mount(&server)
        .await;

    let yaml = format!(
        "params:\n  schema: {}/schema.json\n  values: {{}}\n",
        server.uri()
    );
    let dag = load_yaml(
        &CompileContext::new(),
        yaml.as_bytes(),
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.params, vec!["region=eu-west-1"]);
}

#[tokio::test]
async fn test_remote_schema_non_200_is_error() {
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let yaml = format!(
        "params:\n  schema: {}/schema.json\n  values: {{}}\n",
        server.uri()
    );
    let err = load_yaml(
        &CompileContext::new(),
        yaml.as_bytes(),
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_unsupported_schema_scheme_rejected() {
    let err = load_yaml(
        &CompileContext::new(),
        b"params:\n  schema: ftp://example.com/s.json\n  values: {}\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("unsupported schema URL scheme"));
}

#[tokio::test]
async fn test_named_and_positional_overrides() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"params: \"ENV=dev first\"\n",
        LoadOptions::new().with_params("ENV=prod second extra"),
    )
    .await
    .unwrap();
    assert_eq!(dag.params, vec!["ENV=prod", "2=second", "3=extra"]);
    // The declared set is preserved for sub-DAG invocation.
    assert_eq!(dag.default_params, "ENV=dev first");
}

#[tokio::test]
async fn test_unknown_top_level_key_is_decode_error() {
    let err = load_yaml(
        &CompileContext::new(),
        b"name: x\nbogusKey: 1\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Document 0"));
}

#[tokio::test]
async fn test_unknown_step_key_is_decode_error() {
    let err = load_yaml(
        &CompileContext::new(),
        b"steps:\n  - name: a\n    commandz: x\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("steps[0]"));
}

#[tokio::test]
async fn test_allow_build_errors_returns_stub_for_missing_file() {
    let dag = load(
        &CompileContext::new(),
        "no-such-workflow-anywhere",
        LoadOptions::new().allow_build_errors(),
    )
    .await
    .unwrap();
    assert!(!dag.build_errors.is_empty());
}

#[tokio::test]
async fn test_allow_build_errors_collects_field_diagnostics() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"type: agent\nschedule: 'not a cron'\nsteps:\n  - command: x\n    timeoutSec: -3\n",
        LoadOptions::new().allow_build_errors(),
    )
    .await
    .unwrap();
    assert!(dag.build_errors.len() >= 3);
    let rendered: Vec<String> = dag.build_errors.iter().map(|d| d.to_string()).collect();
    assert!(rendered.iter().any(|m| m.contains("reserved")));
    assert!(rendered.iter().any(|m| m.contains("timeoutSec must be >= 0")));
}

#[tokio::test]
async fn test_fail_fast_composite_error_enumerates_all() {
    let err = load_yaml(
        &CompileContext::new(),
        b"type: agent\nschedule: 'not a cron'\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("type"));
    assert!(message.contains("schedule"));
}

#[tokio::test]
async fn test_handler_abort_cancel_conflict() {
    let err = load_yaml(
        &CompileContext::new(),
        b"handlerOn:\n  abort: echo a\n  cancel: echo c\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("mutually exclusive"));
}

#[tokio::test]
async fn test_deprecated_cancel_handler_maps_to_abort() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"handlerOn:\n  cancel: echo c\n",
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert!(dag.handler_on.abort.is_some());
    assert!(dag
        .build_warnings
        .iter()
        .any(|w| w.contains("deprecated")));
}

#[tokio::test]
async fn test_hitl_step_conflicts_with_worker_selector() {
    let err = load_yaml(
        &CompileContext::new(),
        b"workerSelector:\n  zone: eu\nsteps:\n  - name: approve\n    executor: hitl\n",
        LoadOptions::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("human-in-the-loop"));
}

#[tokio::test]
async fn test_env_command_substitution_and_layering() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"env:\n  - GREETING: \"`echo hello`\"\n  - MESSAGE: \"${GREETING} world\"\n",
        LoadOptions::new(),
    )
    .await
    .unwrap();
    assert_eq!(dag.env, vec!["GREETING=hello", "MESSAGE=hello world"]);
}

#[tokio::test]
async fn test_no_eval_keeps_values_verbatim() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"env:\n  - GREETING: \"`echo hello`\"\nparams: \"V=${GREETING}\"\n",
        LoadOptions::new().no_eval(),
    )
    .await
    .unwrap();
    assert_eq!(dag.env, vec!["GREETING=`echo hello`"]);
    assert_eq!(dag.params, vec!["V=${GREETING}"]);
}

#[tokio::test]
async fn test_process_env_not_mutated() {
    let before: Vec<(String, String)> = std::env::vars().collect();
    let _ = compile(
        "env:\n  - INTERNAL_ONLY_VAR: set-by-build\nparams: \"P=${INTERNAL_ONLY_VAR}\"\n",
    )
    .await;
    let after: Vec<(String, String)> = std::env::vars().collect();
    assert_eq!(before, after);
    assert!(std::env::var("INTERNAL_ONLY_VAR").is_err());
}

#[tokio::test]
async fn test_determinism_across_repeated_compilations() {
    let yaml = "name: det\nparams:\n  zeta: 1\n  alpha: 2\ntags: \"B, a\"\nsteps:\n  - name: s1\n    command: x\n";
    let first = compile(yaml).await;
    let second = compile(yaml).await;
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn test_only_metadata_skips_full_tier_and_steps() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"name: meta\nlogDir: /var/log/wf\nsteps:\n  - echo hi\n",
        LoadOptions::new().only_metadata(),
    )
    .await
    .unwrap();
    assert_eq!(dag.name, "meta");
    assert!(dag.log_dir.is_empty());
    assert!(dag.steps.is_empty());
}

#[tokio::test]
async fn test_base_config_merge() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_file(
        dir.path(),
        "base.yaml",
        "env:\n  - SHARED: base\nmailOn:\n  failure: true\nhandlerOn:\n  failure: echo failed\n",
    );
    let path = write_file(
        dir.path(),
        "wf.yaml",
        "name: app\nenv:\n  - OWN: doc\n",
    );

    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new().with_base_config(&base),
    )
    .await
    .unwrap();
    assert_eq!(dag.env, vec!["SHARED=base", "OWN=doc"]);
    assert!(dag.mail_on.unwrap().failure);
    assert!(dag.handler_on.failure.is_some());

    let dag = load(
        &CompileContext::new(),
        path.to_str().unwrap(),
        LoadOptions::new()
            .with_base_config(&base)
            .skip_base_handlers(),
    )
    .await
    .unwrap();
    assert!(dag.handler_on.failure.is_none());
}

#[tokio::test]
async fn test_cancelled_context_aborts_build() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = CompileContext::new().with_cancellation(cancel);
    let err = load_yaml(&ctx, b"name: x\n", LoadOptions::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

#[tokio::test]
async fn test_dags_dir_resolution_with_name_only() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "nightly.yaml", "steps:\n  - echo hi\n");
    let dag = load(
        &CompileContext::new(),
        "nightly",
        LoadOptions::new().with_dags_dir(dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(dag.name, "nightly");
}

#[tokio::test]
async fn test_build_env_layer_visible_to_params() {
    let dag = load_yaml(
        &CompileContext::new(),
        b"params: \"TARGET=${DEPLOY_TARGET}\"\n",
        LoadOptions::new().with_build_env(vec![(
            "DEPLOY_TARGET".to_string(),
            "staging".to_string(),
        )]),
    )
    .await
    .unwrap();
    assert_eq!(dag.params, vec!["TARGET=staging"]);
}
