//! Invocation-time facts a pipeline run is evaluated against.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// What caused the pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    MergeRequestEvent,
    Push,
    Schedule,
    Manual,
    WorkflowCall,
}

impl PipelineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSource::MergeRequestEvent => "merge_request_event",
            PipelineSource::Push => "push",
            PipelineSource::Schedule => "schedule",
            PipelineSource::Manual => "manual",
            PipelineSource::WorkflowCall => "workflow_call",
        }
    }
}

impl fmt::Display for PipelineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge_request_event" => Ok(PipelineSource::MergeRequestEvent),
            "push" => Ok(PipelineSource::Push),
            "schedule" => Ok(PipelineSource::Schedule),
            "manual" | "web" => Ok(PipelineSource::Manual),
            "workflow_call" => Ok(PipelineSource::WorkflowCall),
            other => Err(format!("Unknown pipeline source: {}", other)),
        }
    }
}

/// Immutable snapshot of the trigger, taken once at pipeline start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub source: PipelineSource,
    pub ref_name: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl TriggerContext {
    pub fn new(source: PipelineSource, ref_name: impl Into<String>) -> Self {
        Self {
            source,
            ref_name: ref_name.into(),
            target_branch: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_target_branch(mut self, branch: impl Into<String>) -> Self {
        self.target_branch = Some(branch.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Predefined variables exported to every job's environment.
    pub fn predefined_variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_str().to_string(),
        );
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.ref_name.clone());
        vars.insert("CI_COMMIT_BRANCH".to_string(), self.ref_name.clone());
        if let Some(target) = &self.target_branch {
            vars.insert(
                "CI_MERGE_REQUEST_TARGET_BRANCH_NAME".to_string(),
                target.clone(),
            );
        }
        vars
    }
}
