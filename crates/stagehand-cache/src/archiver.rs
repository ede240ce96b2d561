//! Tar archives of cached paths.

use crate::types::CompressionType;
use stagehand_core::{Error, Result};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// Expand path globs relative to `base_dir` into the relative paths that
/// exist. Patterns that match nothing are dropped; absolute patterns and
/// patterns climbing out with `..` are rejected.
pub fn expand_paths(base_dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let base = glob::Pattern::escape(&base_dir.to_string_lossy());
    let base = base.trim_end_matches('/');
    let mut paths = Vec::new();
    for pattern in patterns {
        check_contained(pattern)?;
        let full = format!("{}/{}", base, pattern.trim_end_matches('/'));
        let matches = glob::glob(&full)
            .map_err(|e| Error::Cache(format!("Invalid cache path '{}': {}", pattern, e)))?;
        for entry in matches.flatten() {
            if let Ok(relative) = entry.strip_prefix(base_dir) {
                let relative = relative.to_path_buf();
                if !paths.contains(&relative) {
                    paths.push(relative);
                }
            }
        }
    }
    Ok(paths)
}

fn check_contained(pattern: &str) -> Result<()> {
    let escapes = Path::new(pattern).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(Error::Cache(format!(
            "Path '{}' must stay inside the job directory",
            pattern
        )));
    }
    Ok(())
}

/// Create an archive from paths relative to `base_dir`.
pub fn create_archive<W: Write>(
    writer: W,
    paths: &[PathBuf],
    base_dir: &Path,
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, 3)
                .map_err(|e| Error::Cache(format!("Zstd init failed: {}", e)))?;
            append_paths(&mut encoder, paths, base_dir)?;
            encoder
                .finish()
                .map_err(|e| Error::Cache(format!("Zstd finish failed: {}", e)))?;
        }
        CompressionType::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
            append_paths(&mut encoder, paths, base_dir)?;
            encoder
                .finish()
                .map_err(|e| Error::Cache(format!("Gzip finish failed: {}", e)))?;
        }
        CompressionType::None => {
            let mut writer = writer;
            append_paths(&mut writer, paths, base_dir)?;
        }
    }
    Ok(())
}

fn append_paths<W: Write>(writer: W, paths: &[PathBuf], base_dir: &Path) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for path in paths {
        let abs_path = base_dir.join(path);
        if abs_path.is_dir() {
            builder
                .append_dir_all(path, &abs_path)
                .map_err(|e| Error::Cache(format!("Failed to pack dir: {}", e)))?;
        } else if abs_path.exists() {
            builder
                .append_path_with_name(&abs_path, path)
                .map_err(|e| Error::Cache(format!("Failed to pack file: {}", e)))?;
        }
    }

    builder
        .finish()
        .map_err(|e| Error::Cache(format!("Failed to finish tar: {}", e)))
}

/// Extract an archive to a destination.
pub fn extract_archive<R: Read>(reader: R, dest: &Path, compression: CompressionType) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::Cache(format!("Failed to create decoder: {}", e)))?;
            unpack(decoder, dest)
        }
        CompressionType::Gzip => unpack(flate2::read::GzDecoder::new(reader), dest),
        CompressionType::None => unpack(reader, dest),
    }
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive
        .unpack(dest)
        .map_err(|e| Error::Cache(format!("Failed to unpack archive: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join(".cache/pip/wheels")).unwrap();
        std::fs::write(dir.join(".cache/pip/wheels/a.whl"), b"wheel").unwrap();
        std::fs::write(dir.join("requirements.txt"), b"requests").unwrap();
    }

    #[test]
    fn test_archive_each_compression() {
        for compression in CompressionType::ALL {
            let src = tempfile::tempdir().unwrap();
            let dest = tempfile::tempdir().unwrap();
            populate(src.path());

            let mut buffer = Vec::new();
            let paths = vec![PathBuf::from(".cache/pip"), PathBuf::from("requirements.txt")];
            create_archive(&mut buffer, &paths, src.path(), compression).unwrap();
            extract_archive(buffer.as_slice(), dest.path(), compression).unwrap();

            assert_eq!(
                std::fs::read(dest.path().join(".cache/pip/wheels/a.whl")).unwrap(),
                b"wheel",
                "{compression}"
            );
            assert!(dest.path().join("requirements.txt").exists());
        }
    }

    #[test]
    fn test_expand_paths() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());

        let paths = expand_paths(
            src.path(),
            &[".cache/*/".to_string(), "missing/**".to_string(), "*.txt".to_string()],
        )
        .unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from(".cache/pip"), PathBuf::from("requirements.txt")]
        );
    }

    #[test]
    fn test_expand_paths_under_glob_characters() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("build [1] *");
        populate(&base);

        let paths = expand_paths(&base, &["*.txt".to_string()]).unwrap();
        assert_eq!(paths, vec![PathBuf::from("requirements.txt")]);
    }

    #[test]
    fn test_expand_paths_rejects_escapes() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("sandbox");
        populate(&base);
        std::fs::write(root.path().join("secret.txt"), "x").unwrap();

        for pattern in ["../secret.txt", "nested/../../secret.txt", "/etc/hostname"] {
            assert!(
                expand_paths(&base, &[pattern.to_string()]).is_err(),
                "{} should be rejected",
                pattern
            );
        }
    }
}
