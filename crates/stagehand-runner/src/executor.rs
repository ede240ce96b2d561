//! Runs one job: sandbox, cache lease, steps, artifacts.

use crate::cancel::CancellationSignal;
use crate::collector::{ArtifactCollector, Collection};
use crate::container::{CONTAINER_WORKDIR, ContainerRunner};
use crate::runner::{
    OutputLine, OutputStream, RunnerConfig, StepContext, StepRunner, Termination,
};
use crate::sandbox::{Sandbox, SandboxMode};
use crate::shell::ShellRunner;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stagehand_cache::{CacheLease, CacheStore};
use stagehand_core::pipeline::JobDescriptor;
use stagehand_core::run::{ArtifactSet, JobResult, JobStatus};
use stagehand_core::{Result, RunId};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Teardown steps get their own budget, separate from the job timeout.
const AFTER_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Where job steps execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    #[default]
    Host,
    Docker,
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerMode::Host => f.write_str("host"),
            RunnerMode::Docker => f.write_str("docker"),
        }
    }
}

impl FromStr for RunnerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "host" | "shell" => Ok(RunnerMode::Host),
            "docker" => Ok(RunnerMode::Docker),
            other => Err(format!("Unknown runner mode: {}", other)),
        }
    }
}

/// Configuration for job execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Project directory the pipeline runs against.
    pub workspace: PathBuf,
    /// Parent of per-job sandboxes in copy mode.
    pub work_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub sandbox: SandboxMode,
    pub runner_mode: RunnerMode,
    pub runner: RunnerConfig,
    pub cache_scope: Option<String>,
    pub keep_sandboxes: bool,
}

impl ExecutorConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let state_dir = workspace.join(".stagehand");
        Self {
            work_root: state_dir.join("work"),
            artifacts_root: state_dir.join("artifacts"),
            workspace,
            sandbox: SandboxMode::default(),
            runner_mode: RunnerMode::default(),
            runner: RunnerConfig::default(),
            cache_scope: None,
            keep_sandboxes: false,
        }
    }

    pub fn with_sandbox(mut self, mode: SandboxMode) -> Self {
        self.sandbox = mode;
        self
    }

    pub fn with_runner_mode(mut self, mode: RunnerMode) -> Self {
        self.runner_mode = mode;
        self
    }

    pub fn with_work_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_root = path.into();
        self
    }

    pub fn with_artifacts_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts_root = path.into();
        self
    }

    pub fn with_cache_scope(mut self, scope: impl Into<String>) -> Self {
        self.cache_scope = Some(scope.into());
        self
    }

    pub fn with_keep_sandboxes(mut self, keep: bool) -> Self {
        self.keep_sandboxes = keep;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: Option<u64>) -> Self {
        self.runner.timeout_seconds = seconds;
        self
    }
}

/// Per-run inputs for one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: RunId,
    /// Base environment: pipeline variables. Job variables override these.
    pub variables: BTreeMap<String, String>,
    /// Invocation variables and predefined `CI_*` values. Override job
    /// variables.
    pub overrides: BTreeMap<String, String>,
    /// Effective allow-failure for this run, after rule clauses.
    pub allow_failure: bool,
    /// Artifacts of earlier stages.
    pub inputs: Vec<ArtifactSet>,
}

/// Executes jobs.
pub struct JobExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn StepRunner>,
    cache: Option<Arc<dyn CacheStore>>,
    collector: ArtifactCollector,
}

impl JobExecutor {
    /// Create an executor with the runner selected by `config.runner_mode`.
    pub fn new(config: ExecutorConfig, cache: Option<Arc<dyn CacheStore>>) -> Result<Self> {
        let runner: Arc<dyn StepRunner> = match config.runner_mode {
            RunnerMode::Host => Arc::new(ShellRunner::new()),
            RunnerMode::Docker => Arc::new(ContainerRunner::new(config.runner.clone())?),
        };
        Ok(Self::with_runner(config, runner, cache))
    }

    pub fn with_runner(
        config: ExecutorConfig,
        runner: Arc<dyn StepRunner>,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        let collector = ArtifactCollector::new(config.artifacts_root.clone());
        Self {
            config,
            runner,
            cache,
            collector,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn collector(&self) -> &ArtifactCollector {
        &self.collector
    }

    /// Run a job to a terminal status. Never fails: infrastructure errors
    /// are recorded as a failed job.
    pub async fn run(
        &self,
        job: &JobDescriptor,
        ctx: &JobContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancellationSignal,
    ) -> JobResult {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(run_id = %ctx.run_id, job = %job.name, stage = %job.stage, "Starting job");

        // Capture every line for the result while forwarding it on
        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(256);
        let forwarder = tokio::spawn(async move {
            let mut log = Vec::new();
            while let Some(line) = line_rx.recv().await {
                log.push(line.content.clone());
                let _ = output_tx.send(line).await;
            }
            log
        });

        let mut outcome = StepsOutcome::default();
        let mut collection = Collection::default();

        match self.prepare_sandbox(job, ctx).await {
            Ok(sandbox) => {
                let lease = self.acquire_cache(job, &sandbox).await;
                let env = self.environment(job, ctx, &sandbox);

                outcome = self
                    .run_steps(job, &sandbox, &env, &line_tx, cancel.clone())
                    .await;

                if !cancel.is_cancelled() && !job.after_script.is_empty() {
                    self.run_after_script(job, &sandbox, &env, &line_tx, cancel.clone())
                        .await;
                }

                if let Some(lease) = lease {
                    lease.release().await;
                }

                collection = self
                    .collector
                    .collect(ctx.run_id, job, sandbox.dir(), outcome.status.is_success())
                    .await;

                if !self.config.keep_sandboxes {
                    sandbox.cleanup().await;
                }
            }
            Err(e) => {
                error!(job = %job.name, error = %e, "Failed to prepare sandbox");
                outcome.status = JobStatus::Failed;
                outcome.failed_step = Some(format!("prepare sandbox: {}", e));
            }
        }

        drop(line_tx);
        let log = forwarder.await.unwrap_or_default();

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %ctx.run_id,
            job = %job.name,
            status = %outcome.status,
            duration_ms,
            "Job finished"
        );

        JobResult {
            job: job.name.clone(),
            stage: job.stage.clone(),
            status: outcome.status,
            allow_failure: ctx.allow_failure,
            exit_code: outcome.exit_code,
            failed_step: outcome.failed_step,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            artifacts: collection.artifacts,
            reports: collection.reports,
            warnings: collection.warnings,
            log,
        }
    }

    async fn prepare_sandbox(&self, job: &JobDescriptor, ctx: &JobContext) -> Result<Sandbox> {
        Sandbox::prepare(
            self.config.sandbox,
            &self.config.workspace,
            &self.config.work_root,
            ctx.run_id,
            &job.name,
            &ctx.inputs,
            vec![
                self.config.work_root.clone(),
                self.config.artifacts_root.clone(),
            ],
        )
        .await
    }

    async fn acquire_cache(&self, job: &JobDescriptor, sandbox: &Sandbox) -> Option<CacheLease> {
        let store = self.cache.as_ref()?;
        let config = job.cache.as_ref().filter(|c| !c.paths.is_empty())?;
        let lease = CacheLease::acquire(
            Arc::clone(store),
            config,
            self.config.cache_scope.clone(),
            sandbox.dir().to_path_buf(),
        )
        .await;
        info!(job = %job.name, key = %lease.key(), hit = lease.is_hit(), "Cache acquired");
        Some(lease)
    }

    fn environment(
        &self,
        job: &JobDescriptor,
        ctx: &JobContext,
        sandbox: &Sandbox,
    ) -> BTreeMap<String, String> {
        let mut env = ctx.variables.clone();
        env.extend(job.variables.clone());
        env.extend(ctx.overrides.clone());

        let project_dir = match self.config.runner_mode {
            RunnerMode::Host => sandbox.dir().display().to_string(),
            RunnerMode::Docker => CONTAINER_WORKDIR.to_string(),
        };
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CI_JOB_NAME".to_string(), job.name.clone());
        env.insert("CI_JOB_STAGE".to_string(), job.stage.clone());
        env.insert("CI_PIPELINE_ID".to_string(), ctx.run_id.to_string());
        env.insert("CI_PROJECT_DIR".to_string(), project_dir);
        env
    }

    fn job_timeout(&self, job: &JobDescriptor) -> Option<Duration> {
        match job.timeout_minutes {
            Some(minutes) => Some(Duration::from_secs(u64::from(minutes) * 60)),
            None => self.config.runner.timeout_seconds.map(Duration::from_secs),
        }
    }

    /// Setup and script steps in order, stopping at the first failure.
    async fn run_steps(
        &self,
        job: &JobDescriptor,
        sandbox: &Sandbox,
        env: &BTreeMap<String, String>,
        line_tx: &mpsc::Sender<OutputLine>,
        cancel: CancellationSignal,
    ) -> StepsOutcome {
        let deadline = self.job_timeout(job).map(|t| Instant::now() + t);

        for command in job.main_steps() {
            if cancel.is_cancelled() {
                return StepsOutcome::cancelled(command);
            }

            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if timeout == Some(Duration::ZERO) {
                return StepsOutcome::failed(command, None, "job timed out");
            }

            echo(line_tx, &job.name, command).await;
            let ctx = StepContext {
                job: job.name.clone(),
                workspace: sandbox.dir().to_path_buf(),
                image: job.image.clone(),
                variables: env.clone(),
                command: command.clone(),
                timeout,
            };

            match self.runner.execute(&ctx, line_tx.clone(), cancel.clone()).await {
                Ok(result) if result.success => {}
                Ok(result) => {
                    return match result.terminated {
                        Some(Termination::Cancelled) => StepsOutcome::cancelled(command),
                        Some(Termination::TimedOut) => {
                            StepsOutcome::failed(command, None, "job timed out")
                        }
                        None => {
                            warn!(job = %job.name, exit_code = result.exit_code, command = %command, "Step failed");
                            StepsOutcome::failed(command, Some(result.exit_code), "")
                        }
                    };
                }
                Err(e) => {
                    error!(job = %job.name, error = %e, runner = self.runner.name(), "Step could not run");
                    return StepsOutcome::failed(command, None, &e.to_string());
                }
            }
        }

        StepsOutcome {
            status: JobStatus::Success,
            exit_code: Some(0),
            failed_step: None,
        }
    }

    /// Teardown steps; every step runs and failures are only logged.
    async fn run_after_script(
        &self,
        job: &JobDescriptor,
        sandbox: &Sandbox,
        env: &BTreeMap<String, String>,
        line_tx: &mpsc::Sender<OutputLine>,
        cancel: CancellationSignal,
    ) {
        let deadline = Instant::now() + AFTER_SCRIPT_TIMEOUT;
        for command in &job.after_script {
            echo(line_tx, &job.name, command).await;
            let ctx = StepContext {
                job: job.name.clone(),
                workspace: sandbox.dir().to_path_buf(),
                image: job.image.clone(),
                variables: env.clone(),
                command: command.clone(),
                timeout: Some(deadline.saturating_duration_since(Instant::now())),
            };
            match self.runner.execute(&ctx, line_tx.clone(), cancel.clone()).await {
                Ok(result) if !result.success => {
                    warn!(job = %job.name, exit_code = result.exit_code, command = %command, "after_script step failed");
                }
                Err(e) => warn!(job = %job.name, error = %e, "after_script step could not run"),
                _ => {}
            }
        }
    }
}

#[derive(Debug)]
struct StepsOutcome {
    status: JobStatus,
    exit_code: Option<i32>,
    failed_step: Option<String>,
}

impl Default for StepsOutcome {
    fn default() -> Self {
        Self {
            status: JobStatus::Failed,
            exit_code: None,
            failed_step: None,
        }
    }
}

impl StepsOutcome {
    fn failed(command: &str, exit_code: Option<i32>, reason: &str) -> Self {
        let failed_step = if reason.is_empty() {
            command.to_string()
        } else {
            format!("{} ({})", command, reason)
        };
        Self {
            status: JobStatus::Failed,
            exit_code,
            failed_step: Some(failed_step),
        }
    }

    fn cancelled(command: &str) -> Self {
        Self {
            status: JobStatus::Cancelled,
            exit_code: None,
            failed_step: Some(command.to_string()),
        }
    }
}

async fn echo(tx: &mpsc::Sender<OutputLine>, job: &str, command: &str) {
    let _ = tx
        .send(OutputLine {
            job: job.to_string(),
            stream: OutputStream::Stdout,
            content: format!("$ {}", command),
            line_number: 0,
            timestamp: Utc::now(),
        })
        .await;
}
