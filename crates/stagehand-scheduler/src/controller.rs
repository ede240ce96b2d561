//! Pipeline controller: drives one run from document to result.
//!
//! A run moves through `Created -> Validated -> Resolving -> Scheduled ->
//! Running` and ends in `Succeeded`, `Failed` or `Cancelled`. Configuration
//! and resolution errors are returned to the caller before any job starts;
//! job failures are reported through the [`PipelineResult`].

use crate::events::PipelineEvent;
use crate::graph::{StageGraph, StageGraphBuilder};
use crate::include::{BundleFetcher, IncludeResolver, MAX_INCLUDE_DEPTH};
use chrono::{DateTime, Utc};
use stagehand_core::context::TriggerContext;
use stagehand_core::pipeline::{IncludeRef, PipelineDocument, PipelineSpec};
use stagehand_core::rules::{JobDecision, RuleClause, RuleError, decide};
use stagehand_core::run::{
    ArtifactSet, JobResult, JobStatus, PipelineResult, PipelineState, SkippedJob, TestSummary,
};
use stagehand_core::{Error, Result, RunId};
use stagehand_runner::{CancellationHandle, JobContext, JobExecutor, OutputLine};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Keep running later stages after a blocking failure.
    pub continue_on_failure: bool,
    pub max_include_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            max_include_depth: MAX_INCLUDE_DEPTH,
        }
    }
}

impl ControllerConfig {
    pub fn with_continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }
}

/// What a run would execute for a given trigger.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub spec: PipelineSpec,
    /// Stage graph of the jobs whose rules admitted them.
    pub graph: StageGraph,
    pub skipped: Vec<SkippedJob>,
    /// Includes merged into the pipeline, in precedence order.
    pub includes: Vec<IncludeRef>,
    allow_failure: BTreeMap<String, bool>,
}

impl PipelinePlan {
    /// Effective allow-failure of a scheduled job, after rule clauses.
    pub fn allow_failure(&self, job: &str) -> bool {
        self.allow_failure.get(job).copied().unwrap_or(false)
    }

    fn job_names(&self) -> Vec<String> {
        self.graph
            .stages()
            .iter()
            .flat_map(|s| s.job_names())
            .map(str::to_string)
            .collect()
    }
}

/// Records state transitions of one run.
struct RunTracker {
    run_id: RunId,
    state: PipelineState,
    history: Vec<PipelineState>,
    started_at: DateTime<Utc>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl RunTracker {
    fn new(events: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self {
            run_id: RunId::new(),
            state: PipelineState::Created,
            history: vec![PipelineState::Created],
            started_at: Utc::now(),
            events,
        }
    }

    async fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        info!(run_id = %self.run_id, from = %self.state, to = %next, "Pipeline state changed");
        self.state = next;
        self.history.push(next);
        self.emit(PipelineEvent::StateChanged {
            run_id: self.run_id,
            state: next,
        })
        .await;
        Ok(())
    }

    /// Move to `Failed` and hand back the error that caused it.
    async fn fail(&mut self, err: Error) -> Error {
        error!(run_id = %self.run_id, state = %self.state, error = %err, "Pipeline aborted");
        if let Err(e) = self.advance(PipelineState::Failed).await {
            warn!(run_id = %self.run_id, error = %e, "Could not record failure");
        }
        err
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn finish(self, execution: Execution) -> PipelineResult {
        let mut test_summary = TestSummary::default();
        for job in &execution.jobs {
            test_summary += job.test_summary();
        }
        PipelineResult {
            run_id: self.run_id,
            state: self.state,
            history: self.history,
            jobs: execution.jobs,
            skipped: execution.skipped,
            not_run: execution.not_run,
            test_summary,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct Execution {
    jobs: Vec<JobResult>,
    skipped: Vec<SkippedJob>,
    not_run: Vec<String>,
}

/// Drives pipeline runs.
pub struct PipelineController {
    config: ControllerConfig,
    fetcher: Arc<dyn BundleFetcher>,
    executor: Arc<JobExecutor>,
    cancel: CancellationHandle,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineController {
    pub fn new(
        config: ControllerConfig,
        fetcher: Arc<dyn BundleFetcher>,
        executor: Arc<JobExecutor>,
    ) -> Self {
        Self {
            config,
            fetcher,
            executor,
            cancel: CancellationHandle::new(),
            events: None,
        }
    }

    /// Report progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Handle that cancels the current run from any state.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    /// Validate, resolve and schedule without executing anything.
    pub async fn plan(
        &self,
        document: PipelineDocument,
        trigger: &TriggerContext,
    ) -> Result<PipelinePlan> {
        validate_local(&document, trigger)?;
        let (spec, includes) = self.resolve(document).await?;
        schedule(spec, includes, trigger)
    }

    /// Execute a pipeline for `trigger`.
    pub async fn run(
        &self,
        document: PipelineDocument,
        trigger: &TriggerContext,
    ) -> Result<PipelineResult> {
        let mut tracker = RunTracker::new(self.events.clone());
        info!(
            run_id = %tracker.run_id,
            source = %trigger.source,
            ref_name = %trigger.ref_name,
            "Pipeline created"
        );

        if self.cancel.is_cancelled() {
            return self.cancelled(tracker, Execution::default()).await;
        }

        if let Err(e) = validate_local(&document, trigger) {
            return Err(tracker.fail(e).await);
        }
        tracker.advance(PipelineState::Validated).await?;
        if self.cancel.is_cancelled() {
            return self.cancelled(tracker, Execution::default()).await;
        }

        tracker.advance(PipelineState::Resolving).await?;
        let mut signal = self.cancel.signal();
        let resolved = tokio::select! {
            resolved = self.resolve(document) => resolved,
            _ = signal.cancelled() => {
                return self.cancelled(tracker, Execution::default()).await;
            }
        };
        let (spec, includes) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => return Err(tracker.fail(e).await),
        };

        let plan = match schedule(spec, includes, trigger) {
            Ok(plan) => plan,
            Err(e) => return Err(tracker.fail(e).await),
        };
        tracker.advance(PipelineState::Scheduled).await?;
        for skipped in &plan.skipped {
            info!(run_id = %tracker.run_id, job = %skipped.job, "Job skipped by rules");
            tracker.emit(PipelineEvent::JobSkipped(skipped.clone())).await;
        }
        if self.cancel.is_cancelled() {
            let execution = Execution {
                skipped: plan.skipped.clone(),
                not_run: plan.job_names(),
                ..Default::default()
            };
            return self.cancelled(tracker, execution).await;
        }

        tracker.advance(PipelineState::Running).await?;
        let execution = self.execute(&plan, trigger, &tracker).await;

        let final_state = if self.cancel.is_cancelled() {
            PipelineState::Cancelled
        } else if execution.jobs.iter().any(JobResult::blocks_pipeline) {
            PipelineState::Failed
        } else {
            PipelineState::Succeeded
        };
        tracker.advance(final_state).await?;

        let result = tracker.finish(execution);
        info!(
            run_id = %result.run_id,
            state = %result.state,
            jobs = result.jobs.len(),
            skipped = result.skipped.len(),
            not_run = result.not_run.len(),
            "Pipeline finished"
        );
        Ok(result)
    }

    async fn cancelled(
        &self,
        mut tracker: RunTracker,
        execution: Execution,
    ) -> Result<PipelineResult> {
        warn!(run_id = %tracker.run_id, state = %tracker.state, "Pipeline cancelled");
        tracker.advance(PipelineState::Cancelled).await?;
        Ok(tracker.finish(execution))
    }

    /// Merge includes and materialize the merged document.
    async fn resolve(
        &self,
        mut document: PipelineDocument,
    ) -> Result<(PipelineSpec, Vec<IncludeRef>)> {
        let resolver = IncludeResolver::new(Arc::clone(&self.fetcher))
            .with_max_depth(self.config.max_include_depth);
        let includes = resolver.resolve_document(&mut document).await?;
        let spec = document.materialize()?;
        Ok((spec, includes.refs().cloned().collect()))
    }

    /// Run stages in order. A stage starts only after every job of the
    /// previous stage has finished.
    async fn execute(
        &self,
        plan: &PipelinePlan,
        trigger: &TriggerContext,
        tracker: &RunTracker,
    ) -> Execution {
        let run_id = tracker.run_id;
        let mut execution = Execution {
            skipped: plan.skipped.clone(),
            ..Default::default()
        };

        let mut overrides = trigger.variables.clone();
        overrides.extend(trigger.predefined_variables());
        let mut inputs: Vec<ArtifactSet> = Vec::new();
        let mut halted = false;

        let (output_tx, mut output_rx) = mpsc::channel::<OutputLine>(1024);
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = output_rx.recv().await {
                if let Some(tx) = &events {
                    let _ = tx.send(PipelineEvent::Output(line)).await;
                }
            }
        });

        for stage in plan.graph.stages() {
            if stage.is_empty() {
                continue;
            }
            if halted || self.cancel.is_cancelled() {
                execution
                    .not_run
                    .extend(stage.jobs.iter().map(|j| j.name.clone()));
                continue;
            }

            let job_names: Vec<String> = stage.jobs.iter().map(|j| j.name.clone()).collect();
            info!(run_id = %run_id, stage = %stage.name, jobs = ?job_names, "Starting stage");
            tracker
                .emit(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                    jobs: job_names,
                })
                .await;

            let mut join_set = JoinSet::new();
            let mut spawned = HashMap::new();
            for job in &stage.jobs {
                let ctx = JobContext {
                    run_id,
                    variables: plan.spec.variables.clone(),
                    overrides: overrides.clone(),
                    allow_failure: plan.allow_failure(&job.name),
                    inputs: inputs.clone(),
                };
                tracker
                    .emit(PipelineEvent::JobStarted {
                        job: job.name.clone(),
                        stage: stage.name.clone(),
                    })
                    .await;

                let allow_failure = ctx.allow_failure;
                let executor = Arc::clone(&self.executor);
                let descriptor = job.clone();
                let tx = output_tx.clone();
                let signal = self.cancel.signal();
                let handle = join_set.spawn(async move {
                    executor.run(&descriptor, &ctx, tx, signal).await
                });
                spawned.insert(handle.id(), (job.name.clone(), allow_failure));
            }

            let mut results = Vec::with_capacity(stage.jobs.len());
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        let (job, allow_failure) = spawned
                            .remove(&e.id())
                            .unwrap_or_else(|| ("<unknown>".to_string(), false));
                        error!(run_id = %run_id, job = %job, error = %e, "Job task aborted");
                        results.push(aborted_result(job, &stage.name, allow_failure, &e));
                    }
                }
            }
            results.sort_by(|a, b| a.job.cmp(&b.job));

            let stage_ok = !results.iter().any(JobResult::blocks_pipeline);
            for result in &results {
                if let Some(artifacts) = &result.artifacts {
                    inputs.push(artifacts.clone());
                }
                tracker
                    .emit(PipelineEvent::JobFinished(Box::new(result.clone())))
                    .await;
            }
            tracker
                .emit(PipelineEvent::StageFinished {
                    stage: stage.name.clone(),
                    success: stage_ok,
                })
                .await;
            execution.jobs.extend(results);

            if !stage_ok {
                if self.config.continue_on_failure {
                    warn!(run_id = %run_id, stage = %stage.name, "Stage failed, continuing");
                } else {
                    warn!(run_id = %run_id, stage = %stage.name, "Stage failed, halting pipeline");
                    halted = true;
                }
            }
        }

        drop(output_tx);
        let _ = forwarder.await;
        execution
    }
}

fn aborted_result(
    job: String,
    stage: &str,
    allow_failure: bool,
    err: &tokio::task::JoinError,
) -> JobResult {
    let now = Utc::now();
    JobResult {
        job,
        stage: stage.to_string(),
        status: JobStatus::Failed,
        allow_failure,
        exit_code: None,
        failed_step: Some(format!("job task aborted: {}", err)),
        started_at: now,
        finished_at: now,
        duration_ms: 0,
        artifacts: None,
        reports: Vec::new(),
        warnings: Vec::new(),
        log: Vec::new(),
    }
}

/// The context rules are evaluated against: pipeline variables overlaid
/// with the trigger's own.
fn evaluation_context(
    pipeline_variables: &BTreeMap<String, String>,
    trigger: &TriggerContext,
) -> TriggerContext {
    let mut ctx = trigger.clone();
    let mut variables = pipeline_variables.clone();
    variables.extend(trigger.variables.clone());
    ctx.variables = variables;
    ctx
}

fn rule_error(job: &str, clause: usize, err: RuleError) -> Error {
    Error::InvalidRule {
        job: job.to_string(),
        field: err.subject(),
        message: format!("rule #{}: {}", clause + 1, err),
    }
}

/// Check the local document before includes are fetched: stage order and
/// the syntax of every rule. Fields are checked once the merged variables
/// are known.
fn validate_local(document: &PipelineDocument, trigger: &TriggerContext) -> Result<()> {
    if let Some(stages) = &document.stages {
        let mut seen = HashSet::new();
        for stage in stages {
            if !seen.insert(stage.as_str()) {
                return Err(Error::DuplicateStage(stage.clone()));
            }
        }
    }

    let ctx = evaluation_context(&document.variables, trigger);
    let bodies = document.jobs.iter().chain(document.templates.iter());
    for (name, body) in bodies {
        let Some(rules) = body.get("rules") else {
            continue;
        };
        let clauses: Vec<RuleClause> =
            serde_yaml::from_value(rules.clone()).map_err(|e| Error::InvalidRule {
                job: name.clone(),
                field: "rules".to_string(),
                message: e.to_string(),
            })?;

        for (idx, clause) in clauses.iter().enumerate() {
            let Some(source) = &clause.condition else {
                continue;
            };
            let rule = source.compile().map_err(|e| rule_error(name, idx, e))?;
            match rule.validate(&ctx) {
                Ok(()) | Err(RuleError::UndefinedField(_)) => {}
                Err(e) => return Err(rule_error(name, idx, e)),
            }
        }
    }
    Ok(())
}

/// Evaluate every job's rules and build the stage graph of the admitted
/// jobs.
fn schedule(
    spec: PipelineSpec,
    includes: Vec<IncludeRef>,
    trigger: &TriggerContext,
) -> Result<PipelinePlan> {
    let ctx = evaluation_context(&spec.variables, trigger);
    let mut eligible = Vec::new();
    let mut skipped = Vec::new();
    let mut allow_failure = BTreeMap::new();

    for job in spec.jobs.values() {
        match decide(&job.rules, &ctx).map_err(|(idx, e)| rule_error(&job.name, idx, e))? {
            JobDecision::Run {
                allow_failure: overridden,
            } => {
                allow_failure.insert(job.name.clone(), overridden.unwrap_or(job.allow_failure));
                eligible.push(job);
            }
            JobDecision::Skip => skipped.push(SkippedJob {
                job: job.name.clone(),
                stage: job.stage.clone(),
            }),
        }
    }

    let graph = StageGraphBuilder::new().build(&spec.stages, eligible)?;
    Ok(PipelinePlan {
        spec,
        graph,
        skipped,
        includes,
        allow_failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::include::LocalFetcher;
    use stagehand_core::context::PipelineSource;
    use stagehand_runner::{ExecutorConfig, SandboxMode, ShellRunner};
    use std::time::Duration;

    fn controller(workspace: &std::path::Path, config: ControllerConfig) -> PipelineController {
        let state = workspace.join(".stagehand");
        let executor = JobExecutor::with_runner(
            ExecutorConfig::new(workspace)
                .with_sandbox(SandboxMode::Shared)
                .with_work_root(state.join("work"))
                .with_artifacts_root(state.join("artifacts")),
            Arc::new(ShellRunner::new()),
            None,
        );
        PipelineController::new(
            config,
            Arc::new(LocalFetcher::new(workspace)),
            Arc::new(executor),
        )
    }

    fn push() -> TriggerContext {
        TriggerContext::new(PipelineSource::Push, "main")
    }

    fn doc(yaml: &str) -> PipelineDocument {
        PipelineDocument::from_yaml(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_success_records_full_history() {
        let ws = tempfile::tempdir().unwrap();
        let result = controller(ws.path(), ControllerConfig::default())
            .run(doc("stages: [build]\nb:\n  stage: build\n  script: 'true'\n"), &push())
            .await
            .unwrap();

        use PipelineState::*;
        assert_eq!(
            result.history,
            vec![Created, Validated, Resolving, Scheduled, Running, Succeeded]
        );
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_stage_barrier() {
        let ws = tempfile::tempdir().unwrap();
        let result = controller(ws.path(), ControllerConfig::default())
            .run(
                doc(r#"
stages: [build, test]
slow:
  stage: build
  script: sleep 0.3 && touch built
fast:
  stage: build
  script: 'true'
check:
  stage: test
  script: test -f built
"#),
                &push(),
            )
            .await
            .unwrap();

        assert!(result.success());
        let check = result.job("check").unwrap();
        for name in ["slow", "fast"] {
            assert!(result.job(name).unwrap().finished_at <= check.started_at);
        }
    }

    #[tokio::test]
    async fn test_blocking_failure_halts_later_stages() {
        let ws = tempfile::tempdir().unwrap();
        let result = controller(ws.path(), ControllerConfig::default())
            .run(
                doc(r#"
stages: [test, deploy]
broken:
  stage: test
  script: exit 1
fine:
  stage: test
  script: sleep 0.2
ship:
  stage: deploy
  script: 'true'
"#),
                &push(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.jobs.len(), 2);
        assert_eq!(result.job("fine").unwrap().status, JobStatus::Success);
        assert_eq!(result.not_run, vec!["ship"]);
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_later_stages() {
        let ws = tempfile::tempdir().unwrap();
        let result = controller(
            ws.path(),
            ControllerConfig::default().with_continue_on_failure(true),
        )
        .run(
            doc("stages: [test, deploy]\nbroken:\n  stage: test\n  script: exit 1\nship:\n  stage: deploy\n  script: 'true'\n"),
            &push(),
        )
        .await
        .unwrap();

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.job("ship").unwrap().status, JobStatus::Success);
        assert!(result.not_run.is_empty());
    }

    #[tokio::test]
    async fn test_allow_failure_from_rule_clause() {
        let ws = tempfile::tempdir().unwrap();
        let result = controller(ws.path(), ControllerConfig::default())
            .run(
                doc(r#"
stages: [test, deploy]
flaky:
  stage: test
  script: exit 1
  rules:
    - if: $CI_COMMIT_REF_NAME == "main"
      allow_failure: true
ship:
  stage: deploy
  script: 'true'
"#),
                &push(),
            )
            .await
            .unwrap();

        assert!(result.success());
        let flaky = result.job("flaky").unwrap();
        assert_eq!(flaky.status, JobStatus::Failed);
        assert!(flaky.allow_failure);
        assert!(result.job("ship").is_some());
    }

    #[tokio::test]
    async fn test_undefined_rule_field_is_configuration_error() {
        let ws = tempfile::tempdir().unwrap();
        let marker = ws.path().join("ran");
        let yaml = format!(
            "a:\n  script: touch {}\nb:\n  script: 'true'\n  rules:\n    - if: $DEPLOY_TARGET == \"prod\"\n",
            marker.display()
        );

        let err = controller(ws.path(), ControllerConfig::default())
            .run(doc(&yaml), &push())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, Error::InvalidRule { ref job, .. } if job == "b"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_rule_syntax_error_caught_before_resolution() {
        let ws = tempfile::tempdir().unwrap();
        let err = controller(ws.path(), ControllerConfig::default())
            .run(
                doc("include: missing.yml\nb:\n  script: 'true'\n  rules:\n    - if: $CI_PIPELINE_SOURCE ==\n"),
                &push(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRule { .. }));
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let ws = tempfile::tempdir().unwrap();
        let controller = controller(ws.path(), ControllerConfig::default());
        let handle = controller.cancellation_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.cancel();
        });

        let result = controller
            .run(
                doc("stages: [build, test]\nslow:\n  stage: build\n  script: sleep 30\nlater:\n  stage: test\n  script: 'true'\n"),
                &push(),
            )
            .await
            .unwrap();

        assert_eq!(result.state, PipelineState::Cancelled);
        assert_eq!(result.job("slow").unwrap().status, JobStatus::Cancelled);
        assert_eq!(result.not_run, vec!["later"]);
    }

    #[tokio::test]
    async fn test_plan_lists_skipped_jobs() {
        let ws = tempfile::tempdir().unwrap();
        let plan = controller(ws.path(), ControllerConfig::default())
            .plan(
                doc(r#"
mr_only:
  script: 'true'
  rules:
    - if: $CI_PIPELINE_SOURCE == "merge_request_event"
always:
  script: 'true'
"#),
                &push(),
            )
            .await
            .unwrap();

        assert_eq!(plan.graph.job_count(), 1);
        assert_eq!(plan.skipped[0].job, "mr_only");
        assert!(!plan.allow_failure("always"));
    }
}
