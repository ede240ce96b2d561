//! Job execution for Stagehand: step runners, sandboxes, artifacts.

pub mod cancel;
pub mod collector;
pub mod container;
pub mod executor;
mod files;
pub mod runner;
pub mod sandbox;
pub mod shell;

pub use cancel::{CancellationHandle, CancellationSignal};
pub use collector::{ArtifactCollector, Collection, parse_junit};
pub use container::ContainerRunner;
pub use executor::{ExecutorConfig, JobContext, JobExecutor, RunnerMode};
pub use runner::{
    OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner, Termination,
};
pub use sandbox::{Sandbox, SandboxMode};
pub use shell::ShellRunner;
