//! End-to-end pipeline tests.
//!
//! Run with: `cargo test -p stagehand-tests --test pipeline_tests`

use pretty_assertions::assert_eq;
use stagehand_cache::CacheStore;
use stagehand_core::pipeline::PipelineDocument;
use stagehand_core::run::{JobStatus, PipelineState};
use stagehand_runner::SandboxMode;
use stagehand_scheduler::{ControllerConfig, PipelineEvent};
use stagehand_tests::{TestWorkspace, fixtures, init_test_logging};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_merge_request_runs_only_admitted_jobs() {
    init_test_logging();
    let ws = TestWorkspace::new();
    ws.write("junit-source.xml", fixtures::JUNIT_REPORT);

    let result = ws
        .run(fixtures::LINT_AND_TEST, &fixtures::merge_request())
        .await
        .expect("Pipeline should run");

    assert_eq!(result.state, PipelineState::Succeeded);
    assert_eq!(result.jobs.len(), 1);
    assert_eq!(result.jobs[0].job, "test");
    assert!(result.was_skipped("lint"));
    assert!(!ws.exists("linted"));

    let test = result.job("test").unwrap();
    assert_eq!(test.reports.len(), 1);
    assert!(test.reports[0].path.exists());
    assert_eq!(result.test_summary.tests, 3);
    assert_eq!(result.test_summary.failures, 1);
    assert_eq!(result.test_summary.skipped, 1);
}

#[tokio::test]
async fn test_push_runs_both_stages() {
    let ws = TestWorkspace::new();
    ws.write("junit-source.xml", fixtures::JUNIT_REPORT);

    let result = ws
        .run(fixtures::LINT_AND_TEST, &fixtures::push())
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.jobs.len(), 2);
    assert!(result.skipped.is_empty());
    assert!(ws.exists("linted"));
}

#[tokio::test]
async fn test_unreachable_include_runs_no_jobs() {
    init_test_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ci/shared.yml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let ws = TestWorkspace::new();
    let yaml = format!(
        "include: {}/ci/shared.yml\nbuild:\n  script: touch built\n",
        server.uri()
    );
    let (tx, mut rx) = mpsc::channel(1024);
    let controller = ws.controller(ControllerConfig::default()).with_events(tx);

    let err = controller
        .run(PipelineDocument::from_yaml(&yaml).unwrap(), &fixtures::push())
        .await
        .unwrap_err();
    drop(controller);

    assert!(err.is_resolution());
    assert!(!ws.exists("built"));

    let events = drain(&mut rx);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, PipelineEvent::JobStarted { .. }))
    );
    let states: Vec<PipelineState> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Validated,
            PipelineState::Resolving,
            PipelineState::Failed
        ]
    );
}

#[tokio::test]
async fn test_failing_sibling_waits_for_stage_before_failing() {
    let ws = TestWorkspace::new();
    let (tx, mut rx) = mpsc::channel(1024);
    let controller = ws.controller(ControllerConfig::default()).with_events(tx);

    let result = controller
        .run(
            PipelineDocument::from_yaml(fixtures::FAILING_SIBLING).unwrap(),
            &fixtures::push(),
        )
        .await
        .unwrap();
    drop(controller);

    assert_eq!(result.state, PipelineState::Failed);
    assert_eq!(result.jobs.len(), 2);

    let broken = result.job("broken").unwrap();
    assert_eq!(broken.status, JobStatus::Failed);
    assert_eq!(broken.exit_code, Some(3));
    assert_eq!(result.job("steady").unwrap().status, JobStatus::Success);
    assert!(ws.exists("steady.done"));

    assert_eq!(result.not_run, vec!["ship"]);
    assert!(!ws.exists("shipped"));

    // Both siblings report before the pipeline leaves Running.
    let events = drain(&mut rx);
    let failed_at = events
        .iter()
        .position(|e| {
            matches!(
                e,
                PipelineEvent::StateChanged {
                    state: PipelineState::Failed,
                    ..
                }
            )
        })
        .unwrap();
    let finished: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, PipelineEvent::JobFinished(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|&i| i < failed_at));
}

#[tokio::test]
async fn test_rule_false_job_never_fails_pipeline() {
    let ws = TestWorkspace::new();
    let result = ws
        .run(
            r#"
nightly:
  script: exit 1
  rules:
    - if: $CI_PIPELINE_SOURCE == "schedule"
check:
  script: 'true'
"#,
            &fixtures::push(),
        )
        .await
        .unwrap();

    assert!(result.success());
    assert!(result.job("nightly").is_none());
    assert!(result.was_skipped("nightly"));
}

#[tokio::test]
async fn test_artifact_policies_on_failure() {
    let ws = TestWorkspace::new();
    let result = ws
        .run(fixtures::ARTIFACT_POLICIES, &fixtures::push())
        .await
        .unwrap();

    assert_eq!(result.state, PipelineState::Failed);

    let always = result.job("always").unwrap();
    assert_eq!(always.status, JobStatus::Failed);
    let set = always.artifacts.as_ref().expect("always uploads on failure");
    assert_eq!(set.files.len(), 1);
    assert!(set.root.join("logs/always.txt").exists());

    let on_success = result.job("on_success").unwrap();
    assert_eq!(on_success.status, JobStatus::Failed);
    assert!(on_success.artifacts.is_none());
}

#[tokio::test]
async fn test_local_job_shadows_included_job() {
    let ws = TestWorkspace::new();
    ws.write(
        "ci/shared.yml",
        "build:\n  script: touch from_include\nlint:\n  script: touch linted\n",
    );

    let result = ws
        .run(
            "include: ci/shared.yml\nbuild:\n  script: touch from_local\n",
            &fixtures::push(),
        )
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.jobs.len(), 2);
    assert!(ws.exists("from_local"));
    assert!(!ws.exists("from_include"));
    assert!(ws.exists("linted"));
}

#[tokio::test]
async fn test_template_include_with_extends() {
    let ws = TestWorkspace::new();
    ws.write(
        "templates/prepare.yml",
        ".prepared:\n  before_script:\n    - touch prepared\n",
    );

    let result = ws
        .run(
            r#"
include:
  - template: prepare
check:
  extends: .prepared
  script: test -f prepared
"#,
            &fixtures::push(),
        )
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.job("check").unwrap().status, JobStatus::Success);
}

#[tokio::test]
async fn test_trigger_variables_override_pipeline_variables() {
    let ws = TestWorkspace::new();
    let yaml = r#"
variables:
  GREETING: pipeline
  AUDIENCE: world
greet:
  variables:
    AUDIENCE: job
  script: echo "$GREETING $AUDIENCE" > greeting.txt
"#;
    let trigger = fixtures::push().with_variable("GREETING", "trigger");

    let result = ws.run(yaml, &trigger).await.unwrap();

    assert!(result.success());
    let greeting = std::fs::read_to_string(ws.path().join("greeting.txt")).unwrap();
    assert_eq!(greeting.trim(), "trigger job");
}

#[tokio::test]
async fn test_cancel_keeps_completed_artifacts_and_caches() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (tx, mut rx) = mpsc::channel(1024);
    let controller = ws.controller(ControllerConfig::default()).with_events(tx);

    let handle = controller.cancellation_handle();
    let watcher = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let PipelineEvent::JobStarted { job, .. } = &event
                && job == "slow"
            {
                handle.cancel();
            }
        }
    });

    let result = controller
        .run(
            PipelineDocument::from_yaml(fixtures::CACHED_THEN_SLOW).unwrap(),
            &fixtures::push(),
        )
        .await
        .unwrap();
    drop(controller);
    watcher.await.unwrap();

    assert_eq!(result.state, PipelineState::Cancelled);
    assert_eq!(result.history.last(), Some(&PipelineState::Cancelled));

    let deps = result.job("deps").unwrap();
    assert_eq!(deps.status, JobStatus::Success);
    let set = deps.artifacts.as_ref().unwrap();
    assert!(set.root.join("vendor/lib.txt").exists());
    assert_eq!(result.job("slow").unwrap().status, JobStatus::Cancelled);

    let entries = ws
        .cache()
        .list("", Some(&ws.cache_scope()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "deps");
}

#[tokio::test]
async fn test_cache_restored_by_next_run() {
    let ws = TestWorkspace::new();
    let yaml = r#"
stages: [build]
deps:
  stage: build
  cache:
    key: deps
    paths: [vendor]
  script:
    - test -f vendor/lib.txt || (mkdir -p vendor && echo lib > vendor/lib.txt && touch fetched)
"#;

    let first = ws.run(yaml, &fixtures::push()).await.unwrap();
    assert!(first.success());
    assert!(ws.exists("fetched"));

    std::fs::remove_dir_all(ws.path().join("vendor")).unwrap();
    std::fs::remove_file(ws.path().join("fetched")).unwrap();

    let second = ws.run(yaml, &fixtures::push()).await.unwrap();
    assert!(second.success());
    assert!(ws.exists("vendor/lib.txt"));
    assert!(!ws.exists("fetched"));
}

#[tokio::test]
async fn test_keyless_caches_keep_separate_entries() {
    let ws = TestWorkspace::new();

    let first = ws.run(fixtures::KEYLESS_CACHES, &fixtures::push()).await.unwrap();
    assert!(first.success());
    assert!(ws.exists("py_miss"));
    assert!(ws.exists("node_miss"));

    let entries = ws
        .cache()
        .list("", Some(&ws.cache_scope()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_ne!(entries[0].key, entries[1].key);

    for dir in [".pip", "node_modules"] {
        std::fs::remove_dir_all(ws.path().join(dir)).unwrap();
    }
    for marker in ["py_miss", "node_miss"] {
        std::fs::remove_file(ws.path().join(marker)).unwrap();
    }

    let second = ws.run(fixtures::KEYLESS_CACHES, &fixtures::push()).await.unwrap();
    assert!(second.success());
    assert!(!ws.exists("py_miss"));
    assert!(!ws.exists("node_miss"));
    assert!(ws.exists(".pip/pkg.whl"));
    assert!(ws.exists("node_modules/pkg.js"));
}

#[tokio::test]
async fn test_siblings_writing_same_file_are_isolated_by_default() {
    let ws = TestWorkspace::new().with_sandbox(SandboxMode::default());

    let result = ws
        .run(fixtures::SAME_FILE_SIBLINGS, &fixtures::push())
        .await
        .unwrap();

    assert!(result.success());
    for job in ["left", "right"] {
        let set = result.job(job).unwrap().artifacts.as_ref().unwrap();
        let written = std::fs::read_to_string(set.root.join("out.txt")).unwrap();
        assert_eq!(written.trim(), job);
    }
    assert!(!ws.exists("out.txt"));
}
