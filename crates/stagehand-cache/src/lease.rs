//! Scoped access to a job's cache paths.

use crate::keys::resolve_key;
use crate::provider::CacheStore;
use crate::types::CacheEntry;
use stagehand_core::pipeline::CacheConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// A cache held by one job for the duration of its run.
///
/// [`CacheLease::acquire`] restores the entry into the job's directory;
/// [`CacheLease::release`] persists the paths back. The executor releases
/// every lease it acquired, whatever the job outcome, including
/// cancellation. Store errors on either side are logged and never fail the
/// job.
pub struct CacheLease {
    store: Arc<dyn CacheStore>,
    key: String,
    scope: Option<String>,
    base_dir: PathBuf,
    paths: Vec<String>,
    restored: Option<CacheEntry>,
}

impl CacheLease {
    pub async fn acquire(
        store: Arc<dyn CacheStore>,
        config: &CacheConfig,
        scope: Option<String>,
        base_dir: PathBuf,
    ) -> Self {
        let key = resolve_key(config, &base_dir);
        let restored = match store.restore(&key, scope.as_deref(), &base_dir).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache restore failed, continuing without cache");
                None
            }
        };

        Self {
            store,
            key,
            scope,
            base_dir,
            paths: config.paths.clone(),
            restored,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_hit(&self) -> bool {
        self.restored.is_some()
    }

    /// Persist the cache paths. Returns the saved entry, if any was written.
    pub async fn release(self) -> Option<CacheEntry> {
        match self
            .store
            .save(&self.key, self.scope.as_deref(), &self.base_dir, &self.paths)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Cache persist failed");
                None
            }
        }
    }
}
