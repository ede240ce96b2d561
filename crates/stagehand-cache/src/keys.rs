//! Cache key generation utilities.

use sha2::{Digest, Sha256};
use stagehand_core::pipeline::{CacheConfig, CacheKeySpec};
use std::path::Path;

/// Prefix of keys derived from declared paths.
pub const PATHS_KEY_PREFIX: &str = "paths";

/// Resolve the effective key for a cache declaration, relative to the
/// directory the job runs in. Without a declared key, the key follows the
/// declared paths, so caches of different paths never share an entry.
pub fn resolve_key(config: &CacheConfig, base_dir: &Path) -> String {
    match &config.key {
        None => format!("{}-{}", PATHS_KEY_PREFIX, fingerprint_paths(&config.paths)),
        Some(CacheKeySpec::Literal(key)) => sanitize_key(key),
        Some(CacheKeySpec::Files { files, prefix }) => {
            let fingerprint = fingerprint_files(base_dir, files);
            match prefix {
                Some(prefix) => sanitize_key(&format!("{}-{}", prefix, fingerprint)),
                None => fingerprint,
            }
        }
    }
}

/// Hash a set of declared paths, ignoring order and trailing slashes.
pub fn fingerprint_paths(paths: &[String]) -> String {
    let mut normalized: Vec<&str> = paths.iter().map(|p| p.trim_end_matches('/')).collect();
    normalized.sort_unstable();
    normalized.dedup();

    let mut hasher = Sha256::new();
    for path in normalized {
        hasher.update(path.as_bytes());
        hasher.update([0]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Cache scope of a project directory: its name plus a hash of its full
/// path, so equally named projects stay apart.
pub fn project_scope(project: &Path) -> String {
    let name = project
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    let hash = Sha256::digest(project.to_string_lossy().as_bytes());
    sanitize_key(&format!("{}-{}", name, hex::encode(&hash[..4])))
}

/// Hash the names and contents of the given files. Missing files contribute
/// only their name, so a key still changes when a lock file appears.
pub fn fingerprint_files(base_dir: &Path, files: &[String]) -> String {
    let mut hasher = Sha256::new();

    for file in files {
        hasher.update(file.as_bytes());
        match std::fs::read(base_dir.join(file)) {
            Ok(contents) => hasher.update(&contents),
            Err(e) => tracing::debug!(file = %file, error = %e, "Cache key file not readable"),
        }
    }

    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}
