//! Cache types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compression algorithm for cache archives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
    Gzip,
}

impl CompressionType {
    pub const ALL: [CompressionType; 3] = [
        CompressionType::Zstd,
        CompressionType::Gzip,
        CompressionType::None,
    ];

    /// File extension of an archive written with this compression.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "tar",
            CompressionType::Zstd => "tar.zst",
            CompressionType::Gzip => "tar.gz",
        }
    }

    pub fn from_file_name(name: &str) -> Option<(String, CompressionType)> {
        Self::ALL.iter().find_map(|c| {
            name.strip_suffix(&format!(".{}", c.extension()))
                .map(|stem| (stem.to_string(), *c))
        })
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
            CompressionType::Gzip => "gzip",
        };
        f.write_str(s)
    }
}

impl FromStr for CompressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CompressionType::None),
            "zstd" => Ok(CompressionType::Zstd),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            other => Err(format!("Unknown compression: {}", other)),
        }
    }
}

/// A stored cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Sanitized cache key.
    pub key: String,
    pub scope: Option<String>,
    pub size_bytes: u64,
    /// Modification time of the archive, i.e. when the last writer finished.
    pub created_at: DateTime<Utc>,
    pub compression: CompressionType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_round_trip() {
        assert_eq!(
            CompressionType::from_file_name("deps-abc.tar.zst"),
            Some(("deps-abc".to_string(), CompressionType::Zstd))
        );
        assert_eq!(
            CompressionType::from_file_name("deps.tar"),
            Some(("deps".to_string(), CompressionType::None))
        );
        assert_eq!(CompressionType::from_file_name("deps.tmp"), None);
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("gz".parse::<CompressionType>(), Ok(CompressionType::Gzip));
        assert!("lz4".parse::<CompressionType>().is_err());
    }
}
