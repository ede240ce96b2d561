//! Pipeline orchestration for Stagehand: includes, stage graph, controller.

pub mod controller;
pub mod events;
pub mod graph;
pub mod include;

pub use controller::{ControllerConfig, PipelineController, PipelinePlan};
pub use events::PipelineEvent;
pub use graph::{StageGraph, StageGraphBuilder, StageNode};
pub use include::{
    BundleFetcher, DefaultFetcher, HttpFetcher, IncludeResolver, IncludeSet, LocalFetcher,
};
