//! Core runner trait and types.

use crate::cancel::CancellationSignal;
use async_trait::async_trait;
use stagehand_core::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Why a step stopped before its process exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    TimedOut,
    Cancelled,
}

/// Result of step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub terminated: Option<Termination>,
}

impl StepResult {
    pub fn exited(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
            terminated: None,
        }
    }

    pub fn terminated(reason: Termination, duration_ms: u64) -> Self {
        Self {
            exit_code: -1,
            success: false,
            duration_ms,
            terminated: Some(reason),
        }
    }
}

/// Context for one step: a single command line of a job.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job: String,
    pub workspace: PathBuf,
    pub image: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub command: String,
    /// Time left in the job's budget.
    pub timeout: Option<Duration>,
}

/// Trait for step execution.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel. The step
    /// stops early, with its process killed, on timeout or cancellation.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: CancellationSignal,
    ) -> Result<StepResult>;

    fn name(&self) -> &'static str;
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Job timeout when the job sets none.
    pub timeout_seconds: Option<u64>,
    /// Image for container jobs that declare none.
    pub default_image: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Some(3600), // 1 hour default
            default_image: "alpine:latest".to_string(),
        }
    }
}

/// Sleep for the remaining budget, or forever without one.
pub(crate) async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
