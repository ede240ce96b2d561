//! Path-addressed job cache for Stagehand.

pub mod archiver;
pub mod keys;
pub mod lease;
pub mod provider;
pub mod types;

pub use keys::{fingerprint_files, fingerprint_paths, project_scope, resolve_key, sanitize_key};
pub use lease::CacheLease;
pub use provider::{CacheStore, FilesystemCacheStore};
pub use types::{CacheEntry, CompressionType};
