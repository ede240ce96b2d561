//! Per-job execution directories.

use crate::files;
use serde::{Deserialize, Serialize};
use stagehand_core::run::ArtifactSet;
use stagehand_core::{Error, Result, RunId};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// How a job's working directory is provided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Run directly in the project workspace. Not isolated: sibling jobs
    /// of a stage read and write the same directory concurrently.
    Shared,
    /// Run in a private copy of the workspace under the work root.
    #[default]
    Copy,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxMode::Shared => f.write_str("shared"),
            SandboxMode::Copy => f.write_str("copy"),
        }
    }
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "shared" => Ok(SandboxMode::Shared),
            "copy" => Ok(SandboxMode::Copy),
            other => Err(format!("Unknown sandbox mode: {}", other)),
        }
    }
}

/// The directory a job runs in.
#[derive(Debug)]
pub struct Sandbox {
    dir: PathBuf,
    owned: bool,
}

impl Sandbox {
    /// Prepare the sandbox for one job. In copy mode the workspace is
    /// copied (minus `exclude`) and artifacts of earlier stages are placed
    /// at their original relative paths.
    pub async fn prepare(
        mode: SandboxMode,
        workspace: &Path,
        work_root: &Path,
        run_id: RunId,
        job: &str,
        inputs: &[ArtifactSet],
        exclude: Vec<PathBuf>,
    ) -> Result<Self> {
        let sandbox = match mode {
            SandboxMode::Shared => Self {
                dir: workspace.to_path_buf(),
                owned: false,
            },
            SandboxMode::Copy => Self {
                dir: work_root.join(run_id.to_string()).join(sanitize(job)),
                owned: true,
            },
        };

        let workspace = workspace.to_path_buf();
        let dir = sandbox.dir.clone();
        let inputs = inputs.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if mode == SandboxMode::Copy {
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                let count = files::copy_tree(&workspace, &dir, &exclude)?;
                info!(path = %dir.display(), files = count, "Sandbox created");
            }
            for set in &inputs {
                for artifact in &set.files {
                    let src = set.root.join(&artifact.path);
                    let dst = dir.join(&artifact.path);
                    if src == dst {
                        continue;
                    }
                    files::copy_into(&src, &dst, &dir)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        Ok(sandbox)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove a copied sandbox. Shared workspaces are left untouched.
    pub async fn cleanup(&self) {
        if self.owned
            && self.dir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&self.dir).await
        {
            warn!(path = %self.dir.display(), error = %e, "Failed to cleanup sandbox");
        }
    }
}

fn sanitize(job: &str) -> String {
    job.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
