//! Stage graph construction.

use stagehand_core::ids::StageId;
use stagehand_core::pipeline::{JobDescriptor, PipelineSpec};
use stagehand_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};

/// One stage and the jobs that run in it. Jobs within a stage have no
/// ordering between them.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub stage_id: StageId,
    pub name: String,
    pub jobs: Vec<JobDescriptor>,
}

impl StageNode {
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Stages in declared order. Stage N+1 depends on every job of stage N;
/// there are no job-to-job edges.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
    stages: Vec<StageNode>,
}

impl StageGraph {
    /// All stages, including empty ones, in execution order.
    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }
}

/// Builder for stage graphs.
#[derive(Debug, Default)]
pub struct StageGraphBuilder;

impl StageGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Group `jobs` by stage in the order of `stages`.
    pub fn build<'a>(
        &self,
        stages: &[String],
        jobs: impl IntoIterator<Item = &'a JobDescriptor>,
    ) -> Result<StageGraph> {
        let mut seen = HashSet::new();
        for stage in stages {
            if !seen.insert(stage.as_str()) {
                return Err(Error::DuplicateStage(stage.clone()));
            }
        }

        let mut grouped: BTreeMap<&str, Vec<JobDescriptor>> = BTreeMap::new();
        for job in jobs {
            if !seen.contains(job.stage.as_str()) {
                return Err(Error::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                });
            }
            grouped.entry(job.stage.as_str()).or_default().push(job.clone());
        }

        let stages = stages
            .iter()
            .map(|name| StageNode {
                stage_id: StageId::new(name.clone()),
                name: name.clone(),
                jobs: grouped.remove(name.as_str()).unwrap_or_default(),
            })
            .collect();

        Ok(StageGraph { stages })
    }

    /// Build the graph of every job in a materialized pipeline.
    pub fn build_spec(&self, spec: &PipelineSpec) -> Result<StageGraph> {
        self.build(&spec.stages, spec.jobs.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::pipeline::PipelineDocument;

    fn spec(yaml: &str) -> PipelineSpec {
        PipelineDocument::from_yaml(yaml).unwrap().materialize().unwrap()
    }

    #[test]
    fn test_groups_jobs_in_stage_order() {
        let spec = spec(r#"
stages: [build, test, deploy]
unit:
  stage: test
  script: cargo test
compile:
  stage: build
  script: cargo build
lint:
  stage: test
  script: cargo clippy
"#);
        let graph = StageGraphBuilder::new().build_spec(&spec).unwrap();

        let names: Vec<_> = graph.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
        let stages = graph.stages();
        assert_eq!(stages[0].job_names(), vec!["compile"]);
        assert_eq!(stages[1].job_names(), vec!["lint", "unit"]);
        assert!(stages[2].is_empty());
        assert_eq!(graph.job_count(), 3);
    }

    #[test]
    fn test_unknown_stage() {
        let spec = spec("stages: [build]\ncompile:\n  stage: build\n  script: make\n");
        let mut job = spec.jobs["compile"].clone();
        job.stage = "package".to_string();

        let err = StageGraphBuilder::new()
            .build(&spec.stages, [&job])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownStage { ref stage, .. } if stage == "package"));
    }

    #[test]
    fn test_duplicate_stage() {
        let stages = vec!["build".to_string(), "build".to_string()];
        let err = StageGraphBuilder::new()
            .build(&stages, std::iter::empty())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStage(ref s) if s == "build"));
    }
}
