//! Run and execution result types.

use crate::ids::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use std::path::PathBuf;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Validated,
    Resolving,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Failed | PipelineState::Cancelled
        )
    }

    /// Legal forward transitions. Any non-terminal state may fail or be
    /// cancelled.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Created, Validated)
            | (Validated, Resolving)
            | (Resolving, Scheduled)
            | (Scheduled, Running)
            | (Running, Succeeded) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Created => "created",
            PipelineState::Validated => "validated",
            PipelineState::Resolving => "resolving",
            PipelineState::Scheduled => "scheduled",
            PipelineState::Running => "running",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one executed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: String,
    pub stage: String,
    pub status: JobStatus,
    pub allow_failure: bool,
    pub exit_code: Option<i32>,
    pub failed_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Present only when the artifact policy matched the outcome.
    pub artifacts: Option<ArtifactSet>,
    pub reports: Vec<TestReport>,
    pub warnings: Vec<ArtifactWarning>,
    /// Captured output, one entry per line.
    pub log: Vec<String>,
}

impl JobResult {
    /// A failed job halts the pipeline unless it is allowed to fail.
    pub fn blocks_pipeline(&self) -> bool {
        self.status == JobStatus::Failed && !self.allow_failure
    }

    pub fn test_summary(&self) -> TestSummary {
        let mut summary = TestSummary::default();
        for report in &self.reports {
            summary += report.summary;
        }
        summary
    }
}

/// Files collected for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub job: String,
    pub root: PathBuf,
    pub files: Vec<CollectedArtifact>,
}

impl ArtifactSet {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// A parsed JUnit report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub path: PathBuf,
    pub summary: TestSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
}

impl TestSummary {
    pub fn passed(&self) -> u64 {
        self.tests
            .saturating_sub(self.failures + self.errors + self.skipped)
    }
}

impl AddAssign for TestSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.tests += rhs.tests;
        self.failures += rhs.failures;
        self.errors += rhs.errors;
        self.skipped += rhs.skipped;
    }
}

/// A declared path or report that could not be collected. Never fails the
/// job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactWarning {
    pub job: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedJob {
    pub job: String,
    pub stage: String,
}

/// Final report of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub state: PipelineState,
    pub history: Vec<PipelineState>,
    pub jobs: Vec<JobResult>,
    /// Jobs excluded by their rules.
    pub skipped: Vec<SkippedJob>,
    /// Jobs in stages that never started because the run halted.
    pub not_run: Vec<String>,
    pub test_summary: TestSummary,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job == name)
    }

    pub fn was_skipped(&self, name: &str) -> bool {
        self.skipped.iter().any(|s| s.job == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Created.can_transition_to(Validated));
        assert!(Scheduled.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Created.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_summary_accumulates() {
        let mut total = TestSummary::default();
        total += TestSummary {
            tests: 10,
            failures: 1,
            errors: 0,
            skipped: 2,
        };
        total += TestSummary {
            tests: 5,
            failures: 0,
            errors: 1,
            skipped: 0,
        };
        assert_eq!(total.tests, 15);
        assert_eq!(total.passed(), 11);
    }

    #[test]
    fn test_blocks_pipeline() {
        let now = Utc::now();
        let mut result = JobResult {
            job: "lint".into(),
            stage: "test".into(),
            status: JobStatus::Failed,
            allow_failure: true,
            exit_code: Some(1),
            failed_step: Some("flake8".into()),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            artifacts: None,
            reports: vec![],
            warnings: vec![],
            log: vec![],
        };
        assert!(!result.blocks_pipeline());
        result.allow_failure = false;
        assert!(result.blocks_pipeline());
        result.status = JobStatus::Cancelled;
        assert!(!result.blocks_pipeline());
    }
}
