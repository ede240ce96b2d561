//! Progress events emitted while a pipeline runs.

use stagehand_core::RunId;
use stagehand_core::run::{JobResult, PipelineState, SkippedJob};
use stagehand_runner::OutputLine;

/// Everything the controller reports during a run, in order.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        run_id: RunId,
        state: PipelineState,
    },
    JobSkipped(SkippedJob),
    StageStarted {
        stage: String,
        jobs: Vec<String>,
    },
    JobStarted {
        job: String,
        stage: String,
    },
    Output(OutputLine),
    JobFinished(Box<JobResult>),
    StageFinished {
        stage: String,
        success: bool,
    },
}
