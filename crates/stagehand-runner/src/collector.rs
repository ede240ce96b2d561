//! Artifact and test report collection.

use crate::files;
use quick_xml::Reader;
use quick_xml::events::Event;
use stagehand_cache::archiver::expand_paths;
use stagehand_core::pipeline::JobDescriptor;
use stagehand_core::run::{ArtifactSet, ArtifactWarning, CollectedArtifact, TestReport, TestSummary};
use stagehand_core::{Error, RunId};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Everything gathered from one job's sandbox.
#[derive(Debug, Default)]
pub struct Collection {
    pub artifacts: Option<ArtifactSet>,
    pub reports: Vec<TestReport>,
    pub warnings: Vec<ArtifactWarning>,
}

/// Copies declared outputs into `<root>/<run_id>/<job>/`.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    root: PathBuf,
}

impl ArtifactCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, run_id: RunId, job: &str) -> PathBuf {
        self.root.join(run_id.to_string()).join(job)
    }

    /// Collect for a finished job. Artifact paths follow the job's upload
    /// policy; JUnit reports are collected whatever the outcome. Problems
    /// are returned as warnings.
    pub async fn collect(
        &self,
        run_id: RunId,
        job: &JobDescriptor,
        sandbox: &Path,
        succeeded: bool,
    ) -> Collection {
        let job_dir = self.job_dir(run_id, &job.name);
        let job_name = job.name.clone();
        let sandbox = sandbox.to_path_buf();
        let artifacts = job.artifacts.clone().unwrap_or_default();
        let upload = !artifacts.paths.is_empty() && artifacts.when.applies(succeeded);

        let result = tokio::task::spawn_blocking(move || {
            let mut collection = Collection::default();

            if upload {
                let files = copy_matches(&job_name, &sandbox, &job_dir, &artifacts.paths, &mut collection.warnings);
                collection.artifacts = Some(ArtifactSet {
                    job: job_name.clone(),
                    root: job_dir.clone(),
                    files,
                });
            } else if !artifacts.paths.is_empty() {
                debug!(job = %job_name, when = ?artifacts.when, "Artifact policy not met, skipping upload");
            }

            for pattern in &artifacts.reports.junit {
                let copied = copy_matches(
                    &job_name,
                    &sandbox,
                    &job_dir,
                    std::slice::from_ref(pattern),
                    &mut collection.warnings,
                );
                for file in copied {
                    let stored = job_dir.join(&file.path);
                    match parse_junit_file(&stored) {
                        Ok(summary) => collection.reports.push(TestReport {
                            path: stored,
                            summary,
                        }),
                        Err(message) => {
                            warn!(job = %job_name, report = %file.path.display(), error = %message, "Malformed test report");
                            collection.warnings.push(ArtifactWarning {
                                job: job_name.clone(),
                                path: file.path.display().to_string(),
                                message,
                            });
                        }
                    }
                }
            }

            collection
        })
        .await;

        match result {
            Ok(collection) => {
                if let Some(set) = &collection.artifacts {
                    info!(job = %job.name, files = set.files.len(), bytes = set.total_size(), "Artifacts collected");
                }
                collection
            }
            Err(e) => Collection {
                warnings: vec![ArtifactWarning {
                    job: job.name.clone(),
                    path: String::new(),
                    message: format!("Artifact collection aborted: {}", e),
                }],
                ..Default::default()
            },
        }
    }
}

fn copy_matches(
    job: &str,
    sandbox: &Path,
    job_dir: &Path,
    patterns: &[String],
    warnings: &mut Vec<ArtifactWarning>,
) -> Vec<CollectedArtifact> {
    let mut collected = Vec::new();

    for pattern in patterns {
        let matches = match expand_paths(sandbox, std::slice::from_ref(pattern)) {
            Ok(matches) => matches,
            Err(e) => {
                warnings.push(warning(job, pattern, e));
                continue;
            }
        };
        if matches.is_empty() {
            warn!(job = %job, path = %pattern, "Declared artifact path matched nothing");
            warnings.push(ArtifactWarning {
                job: job.to_string(),
                path: pattern.clone(),
                message: "no matching files".to_string(),
            });
            continue;
        }

        for relative in matches {
            match files::copy_into(&sandbox.join(&relative), &job_dir.join(&relative), job_dir) {
                Ok(copied) => {
                    for (path, size_bytes) in copied {
                        if !collected.iter().any(|c: &CollectedArtifact| c.path == path) {
                            collected.push(CollectedArtifact { path, size_bytes });
                        }
                    }
                }
                Err(e) => warnings.push(warning(job, pattern, Error::Io(e))),
            }
        }
    }

    collected
}

fn warning(job: &str, path: &str, error: Error) -> ArtifactWarning {
    ArtifactWarning {
        job: job.to_string(),
        path: path.to_string(),
        message: error.to_string(),
    }
}

fn parse_junit_file(path: &Path) -> Result<TestSummary, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    parse_junit(&content)
}

/// Check a JUnit XML document for well-formedness and count its test cases.
pub fn parse_junit(xml: &str) -> Result<TestSummary, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut summary = TestSummary::default();
    let mut depth = 0usize;
    let mut saw_root = false;
    // Outcome flags of the test case being read: failure, error, skipped
    let mut case: Option<(bool, bool, bool)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("invalid XML at byte {}: {}", reader.buffer_position(), e))?;

        match event {
            Event::Start(e) => {
                let name = e.local_name();
                check_root(&mut saw_root, depth, name.as_ref())?;
                depth += 1;
                match name.as_ref() {
                    b"testcase" => case = Some((false, false, false)),
                    other => mark(&mut case, other),
                }
            }
            Event::Empty(e) => {
                let name = e.local_name();
                check_root(&mut saw_root, depth, name.as_ref())?;
                match name.as_ref() {
                    b"testcase" => summary.tests += 1,
                    other => mark(&mut case, other),
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if e.local_name().as_ref() == b"testcase"
                    && let Some((failed, errored, skipped)) = case.take()
                {
                    summary.tests += 1;
                    summary.failures += u64::from(failed);
                    summary.errors += u64::from(errored);
                    summary.skipped += u64::from(skipped);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err("document has no <testsuite> or <testsuites> root".to_string());
    }
    if depth != 0 {
        return Err("unexpected end of document".to_string());
    }
    Ok(summary)
}

fn check_root(saw_root: &mut bool, depth: usize, name: &[u8]) -> Result<(), String> {
    if depth > 0 {
        return Ok(());
    }
    if *saw_root {
        return Err("document has more than one root element".to_string());
    }
    if name != b"testsuites" && name != b"testsuite" {
        return Err(format!(
            "unexpected root element <{}>",
            String::from_utf8_lossy(name)
        ));
    }
    *saw_root = true;
    Ok(())
}

fn mark(case: &mut Option<(bool, bool, bool)>, element: &[u8]) {
    if let Some((failed, errored, skipped)) = case {
        match element {
            b"failure" => *failed = true,
            b"error" => *errored = true,
            b"skipped" => *skipped = true,
            _ => {}
        }
    }
}
