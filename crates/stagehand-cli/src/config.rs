//! CLI configuration management.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use stagehand_cache::CompressionType;
use stagehand_runner::{RunnerMode, SandboxMode};
use std::path::{Path, PathBuf};

/// CLI configuration, stored as YAML in the platform config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Cache store root. Defaults to the platform cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_compression: CompressionType,
    /// Artifact store root. Defaults to `.stagehand/artifacts` in the project.
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    /// Parent of copied sandboxes. Defaults to `.stagehand/work` in the project.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerMode,
    #[serde(default)]
    pub sandbox: SandboxMode,
    #[serde(default = "default_image")]
    pub default_image: String,
    /// Base URL for `project` and `template` includes.
    #[serde(default)]
    pub include_base_url: Option<String>,
    #[serde(default)]
    pub include_token: Option<String>,
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    /// Local checkouts for `project` includes, as `<dir>/<project>/<ref>/<file>`.
    #[serde(default)]
    pub projects_dir: Option<PathBuf>,
    /// Job timeout when a job declares none.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_image() -> String {
    "alpine:latest".to_string()
}

fn default_timeout() -> Option<u64> {
    Some(3600)
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            cache_compression: CompressionType::default(),
            artifacts_dir: None,
            work_dir: None,
            runner: RunnerMode::default(),
            sandbox: SandboxMode::default(),
            default_image: default_image(),
            include_base_url: None,
            include_token: None,
            templates_dir: None,
            projects_dir: None,
            timeout_seconds: default_timeout(),
            continue_on_failure: false,
        }
    }
}

impl CliConfig {
    /// Load configuration from the default file, or defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "stagehand", "stagehand")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value. `none` clears optional values.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| (v != "none").then(|| v.to_string());
        match key {
            "cache_dir" => self.cache_dir = optional(value).map(PathBuf::from),
            "cache_compression" => {
                self.cache_compression = value.parse().map_err(|e: String| anyhow!(e))?
            }
            "artifacts_dir" => self.artifacts_dir = optional(value).map(PathBuf::from),
            "work_dir" => self.work_dir = optional(value).map(PathBuf::from),
            "runner" => self.runner = value.parse().map_err(|e: String| anyhow!(e))?,
            "sandbox" => self.sandbox = value.parse().map_err(|e: String| anyhow!(e))?,
            "default_image" => self.default_image = value.to_string(),
            "include_base_url" => self.include_base_url = optional(value),
            "include_token" => self.include_token = optional(value),
            "templates_dir" => self.templates_dir = optional(value).map(PathBuf::from),
            "projects_dir" => self.projects_dir = optional(value).map(PathBuf::from),
            "timeout_seconds" => {
                self.timeout_seconds = match value {
                    "none" => None,
                    v => Some(v.parse().with_context(|| format!("Invalid timeout: {}", v))?),
                }
            }
            "continue_on_failure" => {
                self.continue_on_failure = value
                    .parse()
                    .with_context(|| format!("Invalid boolean: {}", value))?
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(stagehand_cache::FilesystemCacheStore::default_root)
    }

    pub fn artifacts_root(&self, project: &Path) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| project.join(".stagehand").join("artifacts"))
    }

    pub fn work_root(&self, project: &Path) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| project.join(".stagehand").join("work"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = CliConfig::default();
        config.set("runner", "docker").unwrap();
        config.set("sandbox", "shared").unwrap();
        config.set("timeout_seconds", "120").unwrap();
        config.set("continue_on_failure", "true").unwrap();
        config.set("include_base_url", "https://git.example.com").unwrap();
        config.save_to(&path).unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.runner, RunnerMode::Docker);
        assert_eq!(loaded.sandbox, SandboxMode::Shared);
        assert_eq!(loaded.timeout_seconds, Some(120));
        assert!(loaded.continue_on_failure);

        config.set("include_base_url", "none").unwrap();
        assert!(config.include_base_url.is_none());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "runner: [docker\n").unwrap();

        let err = CliConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("parsing"));

        let missing = CliConfig::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(missing.sandbox, SandboxMode::Copy);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CliConfig::default();
        assert!(config.set("runner", "vm").is_err());
        assert!(config.set("timeout_seconds", "soon").is_err());
        assert!(config.set("nope", "1").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.timeout_seconds, Some(3600));
        assert_eq!(config.runner, RunnerMode::Host);
    }
}
