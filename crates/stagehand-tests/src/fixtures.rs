//! Pipeline documents and trigger contexts shared by the end-to-end tests.

use stagehand_core::context::{PipelineSource, TriggerContext};

/// `lint` runs on pushes only; `test` always runs and writes a JUnit report.
pub const LINT_AND_TEST: &str = r#"
stages: [lint, test]

lint:
  stage: lint
  script: touch linted
  rules:
    - if: $CI_PIPELINE_SOURCE == "push"

test:
  stage: test
  script:
    - cp junit-source.xml report.xml
  artifacts:
    reports:
      junit: report.xml
"#;

/// Two siblings in `test`, one failing after its sibling has started, and
/// a `deploy` stage that must never run.
pub const FAILING_SIBLING: &str = r#"
stages: [test, deploy]

broken:
  stage: test
  script:
    - sleep 0.1
    - exit 3

steady:
  stage: test
  script:
    - sleep 0.5
    - touch steady.done

ship:
  stage: deploy
  script: touch shipped
"#;

/// One job declaring `when: always` artifacts and one `on_success`, both
/// failing after producing their files.
pub const ARTIFACT_POLICIES: &str = r#"
stages: [test]

always:
  stage: test
  script:
    - mkdir -p logs && echo trace > logs/always.txt
    - exit 1
  artifacts:
    when: always
    paths: [logs/always.txt]

on_success:
  stage: test
  script:
    - mkdir -p logs && echo trace > logs/on_success.txt
    - exit 1
  artifacts:
    paths: [logs/on_success.txt]
"#;

/// A cached job in `build`, then a long-running job in `test`.
pub const CACHED_THEN_SLOW: &str = r#"
stages: [build, test]

deps:
  stage: build
  cache:
    key: deps
    paths: [vendor]
  script:
    - mkdir -p vendor && echo lib > vendor/lib.txt
  artifacts:
    paths: [vendor/lib.txt]

slow:
  stage: test
  script: sleep 30
"#;

/// Two jobs caching different directories, neither declaring a key. Each
/// leaves a `*_miss` marker when its directory had to be rebuilt.
pub const KEYLESS_CACHES: &str = r#"
stages: [python, node]

py:
  stage: python
  cache:
    paths: [.pip]
  script:
    - test -d .pip || (mkdir -p .pip && echo wheel > .pip/pkg.whl && touch py_miss)

node:
  stage: node
  cache:
    paths: [node_modules/]
  script:
    - test -d node_modules || (mkdir -p node_modules && echo mod > node_modules/pkg.js && touch node_miss)
"#;

/// Two siblings writing different contents to the same relative file and
/// reading it back after the other has had time to write.
pub const SAME_FILE_SIBLINGS: &str = r#"
stages: [test]

left:
  stage: test
  script:
    - echo left > out.txt
    - sleep 0.5
    - test "$(cat out.txt)" = left
  artifacts:
    paths: [out.txt]

right:
  stage: test
  script:
    - sleep 0.2
    - echo right > out.txt
    - sleep 0.5
    - test "$(cat out.txt)" = right
  artifacts:
    paths: [out.txt]
"#;

/// Well-formed JUnit report with three cases, one failing and one skipped.
pub const JUNIT_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="unit" tests="3">
    <testcase classname="math" name="adds"/>
    <testcase classname="math" name="divides">
      <failure message="division by zero"/>
    </testcase>
    <testcase classname="math" name="later">
      <skipped/>
    </testcase>
  </testsuite>
</testsuites>
"#;

pub fn push() -> TriggerContext {
    TriggerContext::new(PipelineSource::Push, "main")
}

pub fn merge_request() -> TriggerContext {
    TriggerContext::new(PipelineSource::MergeRequestEvent, "feature/login")
        .with_target_branch("main")
}
