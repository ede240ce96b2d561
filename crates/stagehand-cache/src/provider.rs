//! Cache storage trait and the filesystem implementation.

use crate::archiver;
use crate::keys::sanitize_key;
use crate::types::{CacheEntry, CompressionType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stagehand_core::{Error, Result};
use std::path::{Path, PathBuf};

/// Trait for cache storage backends.
///
/// Entries are shared across pipeline runs. Concurrent saves to the same key
/// are not serialized: the last completed save is what later restores see.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Restore the entry for `key` into `dest`. Returns `None` on a miss.
    async fn restore(&self, key: &str, scope: Option<&str>, dest: &Path)
    -> Result<Option<CacheEntry>>;

    /// Archive `paths` (globs relative to `base_dir`) under `key`. Returns
    /// `None` when no declared path exists.
    async fn save(
        &self,
        key: &str,
        scope: Option<&str>,
        base_dir: &Path,
        paths: &[String],
    ) -> Result<Option<CacheEntry>>;

    /// List entries whose key starts with `prefix`.
    async fn list(&self, prefix: &str, scope: Option<&str>) -> Result<Vec<CacheEntry>>;

    /// Delete a single entry.
    async fn delete(&self, key: &str, scope: Option<&str>) -> Result<()>;

    /// Delete every entry in a scope, or the whole store. Returns the number
    /// of removed entries.
    async fn clear(&self, scope: Option<&str>) -> Result<usize>;
}

/// Filesystem-based cache store.
pub struct FilesystemCacheStore {
    root_dir: PathBuf,
    compression: CompressionType,
}

impl FilesystemCacheStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            compression: CompressionType::default(),
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Platform cache directory, e.g. `~/.cache/stagehand` on Linux.
    pub fn default_root() -> PathBuf {
        directories::ProjectDirs::from("dev", "stagehand", "stagehand")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".stagehand/cache"))
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn scope_dir(&self, scope: Option<&str>) -> PathBuf {
        match scope {
            Some(s) => self.root_dir.join(sanitize_key(s)),
            None => self.root_dir.clone(),
        }
    }

    fn key_path(&self, key: &str, scope: Option<&str>, compression: CompressionType) -> PathBuf {
        self.scope_dir(scope)
            .join(format!("{}.{}", sanitize_key(key), compression.extension()))
    }

    /// Find the archive for a key, whichever compression wrote it.
    async fn find(&self, key: &str, scope: Option<&str>) -> Option<(PathBuf, CompressionType)> {
        for compression in CompressionType::ALL {
            let path = self.key_path(key, scope, compression);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some((path, compression));
            }
        }
        None
    }

    async fn entry_for(
        &self,
        path: &Path,
        key: &str,
        scope: Option<&str>,
        compression: CompressionType,
    ) -> Result<CacheEntry> {
        let metadata = tokio::fs::metadata(path).await?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(CacheEntry {
            key: sanitize_key(key),
            scope: scope.map(str::to_string),
            size_bytes: metadata.len(),
            created_at,
            compression,
        })
    }
}

impl Default for FilesystemCacheStore {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

#[async_trait]
impl CacheStore for FilesystemCacheStore {
    async fn restore(
        &self,
        key: &str,
        scope: Option<&str>,
        dest: &Path,
    ) -> Result<Option<CacheEntry>> {
        let Some((archive_path, compression)) = self.find(key, scope).await else {
            tracing::debug!(key = %key, "Cache miss");
            return Ok(None);
        };

        let entry = self.entry_for(&archive_path, key, scope, compression).await?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&archive_path)?;
            archiver::extract_archive(std::io::BufReader::new(file), &dest, compression)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;

        tracing::info!(key = %key, size_bytes = entry.size_bytes, "Cache restored");
        Ok(Some(entry))
    }

    async fn save(
        &self,
        key: &str,
        scope: Option<&str>,
        base_dir: &Path,
        paths: &[String],
    ) -> Result<Option<CacheEntry>> {
        let matched = archiver::expand_paths(base_dir, paths)?;
        if matched.is_empty() {
            tracing::debug!(key = %key, "No cache paths exist, nothing to save");
            return Ok(None);
        }

        let scope_dir = self.scope_dir(scope);
        tokio::fs::create_dir_all(&scope_dir)
            .await
            .map_err(|e| Error::Cache(format!("Failed to create cache dir: {}", e)))?;

        let compression = self.compression;
        let final_path = self.key_path(key, scope, compression);
        let temp_path = scope_dir.join(format!(
            ".{}.{}.tmp",
            sanitize_key(key),
            uuid::Uuid::new_v4()
        ));

        let base_dir = base_dir.to_path_buf();
        let write_path = temp_path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&write_path)?;
            let mut writer = std::io::BufWriter::new(file);
            archiver::create_archive(&mut writer, &matched, &base_dir, compression)?;
            std::io::Write::flush(&mut writer)?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        // Publishing is a single rename: readers see either the previous
        // archive or this one, never a partial write.
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| Error::Cache(format!("Failed to publish cache entry: {}", e)))?;

        for other in CompressionType::ALL {
            if other != compression {
                let _ = tokio::fs::remove_file(self.key_path(key, scope, other)).await;
            }
        }

        let entry = self.entry_for(&final_path, key, scope, compression).await?;
        tracing::info!(key = %key, size_bytes = entry.size_bytes, "Cache saved");
        Ok(Some(entry))
    }

    async fn list(&self, prefix: &str, scope: Option<&str>) -> Result<Vec<CacheEntry>> {
        let search_dir = self.scope_dir(scope);
        if !tokio::fs::try_exists(&search_dir).await.unwrap_or(false) {
            return Ok(vec![]);
        }

        let sanitized_prefix = sanitize_key(prefix);
        let mut entries = vec![];
        let mut read_dir = tokio::fs::read_dir(&search_dir)
            .await
            .map_err(|e| Error::Cache(format!("Failed to read cache dir: {}", e)))?;

        while let Some(dir_entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::Cache(format!("Failed to read entry: {}", e)))?
        {
            let name = dir_entry.file_name().to_string_lossy().to_string();
            let Some((key, compression)) = CompressionType::from_file_name(&name) else {
                continue;
            };
            if key.starts_with('.') || !key.starts_with(&sanitized_prefix) {
                continue;
            }
            entries.push(
                self.entry_for(&dir_entry.path(), &key, scope, compression)
                    .await?,
            );
        }

        // Most recently written first
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.key.cmp(&b.key)));
        Ok(entries)
    }

    async fn delete(&self, key: &str, scope: Option<&str>) -> Result<()> {
        for compression in CompressionType::ALL {
            let path = self.key_path(key, scope, compression);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| Error::Cache(format!("Failed to delete cache: {}", e)))?;
            }
        }
        Ok(())
    }

    async fn clear(&self, scope: Option<&str>) -> Result<usize> {
        let entries = self.list("", scope).await?;
        for entry in &entries {
            self.delete(&entry.key, scope).await?;
        }
        Ok(entries.len())
    }
}
