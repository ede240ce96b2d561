//! Command handlers.

use crate::commands::PipelineArgs;
use crate::config::CliConfig;
use crate::output;
use anyhow::{Context, Result, anyhow};
use console::style;
use stagehand_cache::{CacheStore, FilesystemCacheStore, project_scope};
use stagehand_core::context::{PipelineSource, TriggerContext};
use stagehand_core::pipeline::PipelineDocument;
use stagehand_core::run::PipelineState;
use stagehand_runner::{ExecutorConfig, JobExecutor, RunnerMode, SandboxMode};
use stagehand_scheduler::{
    BundleFetcher, ControllerConfig, DefaultFetcher, HttpFetcher, LocalFetcher, PipelineController,
    PipelineEvent,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Exit code for an interrupted run.
pub const EXIT_CANCELLED: u8 = 130;

const STARTER_PIPELINE: &str = r#"stages:
  - build
  - test

variables:
  APP_NAME: my-app

cache:
  key:
    files: [Cargo.lock]
  paths:
    - target/

build:
  stage: build
  script:
    - echo "Building $APP_NAME"
  artifacts:
    paths:
      - dist/

test:
  stage: test
  script:
    - echo "Testing $APP_NAME"
  artifacts:
    when: always
    reports:
      junit: report.xml
  rules:
    - if: $CI_PIPELINE_SOURCE == "merge_request_event"
    - if: $CI_COMMIT_REF_NAME == "main"
"#;

/// Options of the `run` command beyond the pipeline arguments.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub shared: bool,
    pub keep_sandboxes: bool,
    pub docker: bool,
    pub continue_on_failure: bool,
    pub timeout: Option<u64>,
    pub no_cache: bool,
    pub json: bool,
}

/// Initialize a new pipeline.
pub fn init(path: &Path) -> Result<()> {
    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, STARTER_PIPELINE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a pipeline file and its includes.
pub async fn validate(config: &CliConfig, args: &PipelineArgs) -> Result<()> {
    let (document, project) = load_document(&args.file)?;
    let controller = controller(config, &project, &RunOptions::default(), None)?;
    let plan = controller.plan(document, &trigger_context(args)?).await?;

    println!(
        "{} {} is valid",
        style("✓").green(),
        style(args.file.display()).bold()
    );
    println!("  Stages: {}", plan.spec.stages.join(" → "));
    println!("  Jobs: {}", plan.spec.jobs.len());
    if !plan.includes.is_empty() {
        println!("  Includes:");
        for include in &plan.includes {
            println!("    - {}", include);
        }
    }
    Ok(())
}

/// Print the stage graph for a trigger context.
pub async fn plan(config: &CliConfig, args: &PipelineArgs) -> Result<()> {
    let (document, project) = load_document(&args.file)?;
    let trigger = trigger_context(args)?;
    let controller = controller(config, &project, &RunOptions::default(), None)?;
    let plan = controller.plan(document, &trigger).await?;

    println!(
        "Plan for {} on {}\n",
        style(trigger.source).bold(),
        style(&trigger.ref_name).bold()
    );
    output::print_plan(&plan);
    Ok(())
}

/// Run a pipeline locally.
pub async fn run_pipeline(
    config: &CliConfig,
    args: &PipelineArgs,
    options: &RunOptions,
) -> Result<ExitCode> {
    let (document, project) = load_document(&args.file)?;
    let trigger = trigger_context(args)?;

    let (tx, mut rx) = mpsc::channel(1024);
    let controller = controller(config, &project, options, Some(tx))?;

    let quiet = options.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !quiet {
                output::print_event(&event);
            }
        }
    });

    let handle = controller.cancellation_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Cancelling pipeline...", style("■").yellow());
            handle.cancel();
        }
    });

    let result = controller.run(document, &trigger).await;
    drop(controller);
    let _ = printer.await;
    let result = result?;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        output::print_summary(&result);
    }

    Ok(match result.state {
        PipelineState::Succeeded => ExitCode::SUCCESS,
        PipelineState::Cancelled => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::from(1),
    })
}

/// List a project's cache entries.
pub async fn list_cache(config: &CliConfig, project: &Path, prefix: &str) -> Result<()> {
    let store = FilesystemCacheStore::new(config.cache_root());
    let entries = store.list(prefix, Some(&cache_scope(project)?)).await?;

    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }

    println!("{:<40} {:>12} {:<8} {}", "KEY", "SIZE", "FORMAT", "UPDATED");
    for entry in entries {
        println!(
            "{:<40} {:>12} {:<8} {}",
            entry.key,
            entry.size_bytes,
            entry.compression,
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Clear a project's cache.
pub async fn clear_cache(config: &CliConfig, project: &Path) -> Result<()> {
    let store = FilesystemCacheStore::new(config.cache_root());
    let removed = store.clear(Some(&cache_scope(project)?)).await?;
    println!("{} Removed {} cache entries", style("✓").green(), removed);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<()> {
    println!("Current configuration:");
    for line in serde_yaml::to_string(config)?.lines() {
        println!("  {}", line);
    }
    println!("  cache root: {}", config.cache_root().display());

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
    Ok(())
}

/// Set configuration.
pub fn set_config(path: Option<&Path>, key: &str, value: &str) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => CliConfig::config_path()?,
    };
    let mut config = CliConfig::load_from(&path)?;
    config.set(key, value)?;
    config.save_to(&path)?;

    println!("{} Set {} = {} ({})", style("✓").green(), key, value, path.display());
    Ok(())
}

fn load_document(file: &Path) -> Result<(PipelineDocument, PathBuf)> {
    let file = std::path::absolute(file)
        .with_context(|| format!("resolving {}", file.display()))?;
    let document = PipelineDocument::from_path(&file)
        .with_context(|| format!("loading {}", file.display()))?;
    let project = file
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("{} has no parent directory", file.display()))?;
    debug!(
        file = %file.display(),
        jobs = document.jobs.len(),
        includes = document.include.len(),
        "Loaded pipeline"
    );
    Ok((document, project))
}

/// Store scope of a project's caches, keyed by its absolute path.
fn cache_scope(project: &Path) -> Result<String> {
    let project = std::path::absolute(project)
        .with_context(|| format!("resolving {}", project.display()))?;
    Ok(project_scope(&project))
}

fn trigger_context(args: &PipelineArgs) -> Result<TriggerContext> {
    let source: PipelineSource = args.source.parse().map_err(|e: String| anyhow!(e))?;
    let mut trigger = TriggerContext::new(source, args.ref_name.clone());
    if let Some(target) = &args.target_branch {
        trigger = trigger.with_target_branch(target.clone());
    }
    for (key, value) in &args.vars {
        trigger = trigger.with_variable(key.clone(), value.clone());
    }
    Ok(trigger)
}

fn fetcher(config: &CliConfig, project: &Path) -> Arc<dyn BundleFetcher> {
    let mut local = LocalFetcher::new(project);
    if let Some(dir) = &config.templates_dir {
        local = local.with_templates_dir(dir);
    }
    if let Some(dir) = &config.projects_dir {
        local = local.with_projects_dir(dir);
    }
    let mut http = HttpFetcher::new(config.include_base_url.clone());
    if let Some(token) = &config.include_token {
        http = http.with_auth_token(token.clone());
    }
    Arc::new(DefaultFetcher::new(local, Some(http)))
}

fn controller(
    config: &CliConfig,
    project: &Path,
    options: &RunOptions,
    events: Option<mpsc::Sender<PipelineEvent>>,
) -> Result<PipelineController> {
    let runner_mode = if options.docker {
        RunnerMode::Docker
    } else {
        config.runner
    };
    let sandbox = if options.shared {
        SandboxMode::Shared
    } else {
        config.sandbox
    };

    let mut executor_config = ExecutorConfig::new(project)
        .with_runner_mode(runner_mode)
        .with_sandbox(sandbox)
        .with_work_root(config.work_root(project))
        .with_artifacts_root(config.artifacts_root(project))
        .with_cache_scope(project_scope(project))
        .with_keep_sandboxes(options.keep_sandboxes)
        .with_timeout_seconds(options.timeout.or(config.timeout_seconds));
    executor_config.runner.default_image = config.default_image.clone();

    let cache: Option<Arc<dyn CacheStore>> = if options.no_cache {
        None
    } else {
        Some(Arc::new(
            FilesystemCacheStore::new(config.cache_root()).with_compression(config.cache_compression),
        ))
    };

    let executor = JobExecutor::new(executor_config, cache)?;
    let controller_config = ControllerConfig::default()
        .with_continue_on_failure(options.continue_on_failure || config.continue_on_failure);

    let controller = PipelineController::new(
        controller_config,
        fetcher(config, project),
        Arc::new(executor),
    );
    Ok(match events {
        Some(tx) => controller.with_events(tx),
        None => controller,
    })
}
