//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

pub const DEFAULT_PIPELINE_FILE: &str = "stagehand.yml";

#[derive(Subcommand)]
pub enum Commands {
    /// Create a starter pipeline file
    Init {
        /// Path of the pipeline file to create
        #[arg(default_value = DEFAULT_PIPELINE_FILE)]
        path: PathBuf,
    },

    /// Validate a pipeline file, resolving its includes
    Validate {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Show which jobs would run, stage by stage
    Plan {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Run a pipeline locally
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Run jobs directly in the project directory; sibling jobs are not isolated
        #[arg(long)]
        shared: bool,

        /// Leave job sandboxes under the work root after the run
        #[arg(long)]
        keep_sandboxes: bool,

        /// Execute steps in containers of each job's image
        #[arg(long)]
        docker: bool,

        /// Keep running later stages after a blocking failure
        #[arg(long)]
        continue_on_failure: bool,

        /// Default job timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Disable the job cache
        #[arg(long)]
        no_cache: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the job cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Pipeline file and trigger context.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Path to pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    pub file: PathBuf,

    /// What triggered the pipeline
    #[arg(long, default_value = "push")]
    pub source: String,

    /// Branch or tag being built
    #[arg(long = "ref", default_value = "main")]
    pub ref_name: String,

    /// Merge request target branch
    #[arg(long)]
    pub target_branch: Option<String>,

    /// Pipeline variable override (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List a project's cache entries
    List {
        /// Cache key prefix
        #[arg(short, long, default_value = "")]
        prefix: String,

        /// Project directory whose caches to list
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },

    /// Remove every cache entry of a project
    Clear {
        /// Project directory whose caches to remove
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("DEPLOY=prod=1").unwrap(),
            ("DEPLOY".to_string(), "prod=1".to_string())
        );
        assert!(parse_var("=x").is_err());
        assert!(parse_var("novalue").is_err());
    }
}
