//! Test helper functions and utilities.

use stagehand_cache::{CacheStore, FilesystemCacheStore, project_scope};
use stagehand_core::context::TriggerContext;
use stagehand_core::pipeline::PipelineDocument;
use stagehand_core::run::PipelineResult;
use stagehand_runner::{ExecutorConfig, JobExecutor, SandboxMode, ShellRunner};
use stagehand_scheduler::{
    BundleFetcher, ControllerConfig, DefaultFetcher, HttpFetcher, LocalFetcher, PipelineController,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A throwaway project directory with its own cache store.
///
/// Jobs run in the shared project directory unless another sandbox mode is
/// requested, so tests can inspect what scripts wrote.
pub struct TestWorkspace {
    project: TempDir,
    cache_root: TempDir,
    store: Arc<FilesystemCacheStore>,
    sandbox: SandboxMode,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let project = tempfile::tempdir().expect("Failed to create project dir");
        let cache_root = tempfile::tempdir().expect("Failed to create cache dir");
        let store = Arc::new(FilesystemCacheStore::new(cache_root.path()));
        Self {
            project,
            cache_root,
            store,
            sandbox: SandboxMode::Shared,
        }
    }

    pub fn with_sandbox(mut self, mode: SandboxMode) -> Self {
        self.sandbox = mode;
        self
    }

    pub fn path(&self) -> &Path {
        self.project.path()
    }

    pub fn cache_root(&self) -> &Path {
        self.cache_root.path()
    }

    pub fn cache(&self) -> Arc<FilesystemCacheStore> {
        Arc::clone(&self.store)
    }

    /// Store scope the executor files this project's caches under.
    pub fn cache_scope(&self) -> String {
        project_scope(self.path())
    }

    /// Write a file relative to the project root, creating parents.
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.project.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, contents).expect("Failed to write file");
        path
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.project.path().join(relative).exists()
    }

    /// Include fetcher for local, template and remote includes.
    pub fn fetcher(&self) -> Arc<dyn BundleFetcher> {
        let local = LocalFetcher::new(self.path()).with_templates_dir(self.path().join("templates"));
        Arc::new(DefaultFetcher::new(local, Some(HttpFetcher::new(None))))
    }

    pub fn executor(&self) -> JobExecutor {
        let state = self.path().join(".stagehand");
        let cache: Arc<dyn CacheStore> = self.cache();
        JobExecutor::with_runner(
            ExecutorConfig::new(self.path())
                .with_sandbox(self.sandbox)
                .with_work_root(state.join("work"))
                .with_artifacts_root(state.join("artifacts"))
                .with_cache_scope(self.cache_scope()),
            Arc::new(ShellRunner::new()),
            Some(cache),
        )
    }

    pub fn controller(&self, config: ControllerConfig) -> PipelineController {
        PipelineController::new(config, self.fetcher(), Arc::new(self.executor()))
    }

    /// Parse `yaml` and run it with the default controller configuration.
    pub async fn run(
        &self,
        yaml: &str,
        trigger: &TriggerContext,
    ) -> stagehand_core::Result<PipelineResult> {
        let document = PipelineDocument::from_yaml(yaml)?;
        self.controller(ControllerConfig::default())
            .run(document, trigger)
            .await
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
