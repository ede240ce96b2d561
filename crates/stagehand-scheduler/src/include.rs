//! Include resolution: fetch external bundles and merge them into the
//! local pipeline document.

use async_trait::async_trait;
use stagehand_core::pipeline::{IncludeRef, PipelineDocument};
use stagehand_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maximum nesting of includes inside included bundles.
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Source of include bundles.
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    /// Fetch the raw YAML text of a bundle.
    async fn fetch(&self, include: &IncludeRef) -> Result<String>;

    fn name(&self) -> &'static str;
}

fn unreachable_bundle(include: &IncludeRef, message: impl Into<String>) -> Error {
    Error::IncludeResolution {
        include: include.to_string(),
        message: message.into(),
    }
}

/// Reads bundles from disk.
///
/// `local` paths are relative to the project root, `template` names to the
/// templates directory (`.yml` is appended when the name has no extension),
/// and `project` includes to `<projects_dir>/<project>/<ref>/<file>`, one
/// checkout per ref.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    project_root: PathBuf,
    templates_dir: Option<PathBuf>,
    projects_dir: Option<PathBuf>,
}

impl LocalFetcher {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            templates_dir: None,
            projects_dir: None,
        }
    }

    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = Some(dir.into());
        self
    }

    pub fn with_projects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.projects_dir = Some(dir.into());
        self
    }

    fn locate(&self, include: &IncludeRef) -> Result<PathBuf> {
        match include {
            IncludeRef::Local(path) => Ok(self.project_root.join(path.trim_start_matches('/'))),
            IncludeRef::Template(name) => {
                let dir = self
                    .templates_dir
                    .as_ref()
                    .ok_or_else(|| unreachable_bundle(include, "no templates directory configured"))?;
                let mut path = dir.join(name);
                if path.extension().is_none() {
                    path.set_extension("yml");
                }
                Ok(path)
            }
            IncludeRef::Project {
                project,
                reference,
                file,
            } => {
                let dir = self
                    .projects_dir
                    .as_ref()
                    .ok_or_else(|| unreachable_bundle(include, "no projects directory configured"))?;
                Ok(dir
                    .join(project)
                    .join(reference)
                    .join(file.trim_start_matches('/')))
            }
            IncludeRef::Remote(_) => Err(unreachable_bundle(
                include,
                "remote includes need an HTTP fetcher",
            )),
        }
    }
}

#[async_trait]
impl BundleFetcher for LocalFetcher {
    async fn fetch(&self, include: &IncludeRef) -> Result<String> {
        let path = self.locate(include)?;
        debug!(include = %include, path = %path.display(), "Reading include bundle");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| unreachable_bundle(include, format!("{}: {}", path.display(), e)))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Fetches bundles over HTTP.
///
/// `project` includes are read from `{base_url}/{project}/-/raw/{ref}/{file}`,
/// `template` includes from `{base_url}/templates/{name}`, and `remote`
/// includes from their own URL.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<String>,
    auth_token: Option<String>,
}

impl HttpFetcher {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn url(&self, include: &IncludeRef) -> Result<String> {
        let base = || {
            self.base_url
                .as_deref()
                .ok_or_else(|| unreachable_bundle(include, "no include base URL configured"))
        };
        match include {
            IncludeRef::Project {
                project,
                reference,
                file,
            } => Ok(format!(
                "{}/{}/-/raw/{}/{}",
                base()?,
                project,
                reference,
                file.trim_start_matches('/')
            )),
            IncludeRef::Template(name) => Ok(format!("{}/templates/{}", base()?, name)),
            IncludeRef::Remote(url) => Ok(url.clone()),
            IncludeRef::Local(_) => Err(unreachable_bundle(
                include,
                "local includes are read from the project directory",
            )),
        }
    }
}

#[async_trait]
impl BundleFetcher for HttpFetcher {
    async fn fetch(&self, include: &IncludeRef) -> Result<String> {
        let url = self.url(include)?;
        debug!(include = %include, url = %url, "Downloading include bundle");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| unreachable_bundle(include, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(unreachable_bundle(
                include,
                format!("{} returned {}", url, response.status()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| unreachable_bundle(include, format!("failed to read body: {}", e)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Routes `local` includes to the filesystem and every other form to HTTP
/// when a base URL is set. Without HTTP, templates and projects are read
/// from disk.
pub struct DefaultFetcher {
    local: LocalFetcher,
    http: Option<HttpFetcher>,
}

impl DefaultFetcher {
    pub fn new(local: LocalFetcher, http: Option<HttpFetcher>) -> Self {
        Self { local, http }
    }
}

#[async_trait]
impl BundleFetcher for DefaultFetcher {
    async fn fetch(&self, include: &IncludeRef) -> Result<String> {
        match (include, &self.http) {
            (IncludeRef::Local(_), _) => self.local.fetch(include).await,
            (IncludeRef::Remote(_), Some(http)) => http.fetch(include).await,
            (IncludeRef::Remote(_), None) => self.local.fetch(include).await,
            (_, Some(http)) if http.base_url.is_some() => http.fetch(include).await,
            _ => self.local.fetch(include).await,
        }
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Bundles resolved for one run, in precedence order.
#[derive(Debug, Clone, Default)]
pub struct IncludeSet {
    bundles: Vec<(IncludeRef, Arc<PipelineDocument>)>,
}

impl IncludeSet {
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn refs(&self) -> impl Iterator<Item = &IncludeRef> {
        self.bundles.iter().map(|(r, _)| r)
    }

    /// Merge every bundle into `document`. Local definitions win; among
    /// bundles, the earlier one wins.
    pub fn merge_into(&self, document: &mut PipelineDocument) {
        for (include, bundle) in &self.bundles {
            debug!(include = %include, jobs = bundle.jobs.len(), "Merging include bundle");
            document.merge_included(bundle);
        }
    }
}

/// Resolves include references through a [`BundleFetcher`], fetching each
/// bundle at most once.
pub struct IncludeResolver {
    fetcher: Arc<dyn BundleFetcher>,
    max_depth: usize,
    memo: RwLock<HashMap<String, Arc<PipelineDocument>>>,
}

impl IncludeResolver {
    pub fn new(fetcher: Arc<dyn BundleFetcher>) -> Self {
        Self {
            fetcher,
            max_depth: MAX_INCLUDE_DEPTH,
            memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Resolve `refs` and every include nested in them. Bundles are ordered
    /// depth-first: a bundle is followed by its own includes before the
    /// next sibling. Any failure aborts the whole resolution.
    pub async fn resolve(&self, refs: &[IncludeRef]) -> Result<IncludeSet> {
        let mut set = IncludeSet::default();
        let mut visited = HashSet::new();
        let mut pending: Vec<(IncludeRef, usize)> =
            refs.iter().rev().map(|r| (r.clone(), 0)).collect();

        while let Some((include, depth)) = pending.pop() {
            if depth > self.max_depth {
                return Err(unreachable_bundle(
                    &include,
                    format!("includes nested deeper than {}", self.max_depth),
                ));
            }
            if !visited.insert(include.key()) {
                debug!(include = %include, "Include already merged");
                continue;
            }

            let bundle = self.load(&include).await?;
            pending.extend(bundle.include.iter().rev().map(|r| (r.clone(), depth + 1)));
            set.bundles.push((include, bundle));
        }

        if !set.is_empty() {
            info!(bundles = set.len(), "Includes resolved");
        }
        Ok(set)
    }

    /// Resolve the document's includes and merge them into it.
    pub async fn resolve_document(&self, document: &mut PipelineDocument) -> Result<IncludeSet> {
        let set = self.resolve(&document.include).await?;
        set.merge_into(document);
        Ok(set)
    }

    async fn load(&self, include: &IncludeRef) -> Result<Arc<PipelineDocument>> {
        let key = include.key();
        if let Some(bundle) = self.memo.read().await.get(&key) {
            return Ok(Arc::clone(bundle));
        }

        let content = self.fetcher.fetch(include).await.inspect_err(|e| {
            warn!(include = %include, fetcher = self.fetcher.name(), error = %e, "Include fetch failed");
        })?;
        let bundle = PipelineDocument::from_yaml(&content)
            .map_err(|e| unreachable_bundle(include, format!("malformed bundle: {}", e)))?;
        let bundle = Arc::new(bundle);

        self.memo.write().await.insert(key, Arc::clone(&bundle));
        Ok(bundle)
    }
}
