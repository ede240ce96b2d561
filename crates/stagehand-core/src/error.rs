//! Error types for Stagehand.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Invalid rule in job '{job}' ({field}): {message}")]
    InvalidRule {
        job: String,
        field: String,
        message: String,
    },

    #[error("Job '{job}' references unknown stage '{stage}'")]
    UnknownStage { job: String, stage: String },

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Job '{job}' extends unknown template '{template}'")]
    UnknownTemplate { job: String, template: String },

    #[error("Malformed include {include}: {message}")]
    MalformedInclude { include: String, message: String },

    // Resolution errors
    #[error("Failed to resolve include {include}: {message}")]
    IncludeResolution { include: String, message: String },

    // Run errors
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Cache errors
    #[error("Cache operation failed: {0}")]
    Cache(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error stems from the pipeline document itself and is
    /// detected before any job runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidPipeline(_)
                | Error::InvalidRule { .. }
                | Error::UnknownStage { .. }
                | Error::DuplicateStage(_)
                | Error::UnknownTemplate { .. }
                | Error::MalformedInclude { .. }
        )
    }

    /// Whether this error aborted include resolution.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Error::IncludeResolution { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidPipeline(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        let err = Error::UnknownStage {
            job: "lint".to_string(),
            stage: "qa".to_string(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_resolution());
        assert_eq!(err.to_string(), "Job 'lint' references unknown stage 'qa'");
    }

    #[test]
    fn test_resolution_classification() {
        let err = Error::IncludeResolution {
            include: "project:ci/templates@main:jobs.yml".to_string(),
            message: "404".to_string(),
        };
        assert!(err.is_resolution());
        assert!(!err.is_configuration());
        assert!(!Error::Cache("disk full".to_string()).is_configuration());
    }
}
