//! Blocking file-tree copies used by sandboxes and the artifact store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Copy `src` (file or directory) to `dst`, creating parents. Returns each
/// copied file as a path relative to `dst_root` together with its size.
pub fn copy_into(src: &Path, dst: &Path, dst_root: &Path) -> io::Result<Vec<(PathBuf, u64)>> {
    let mut copied = Vec::new();
    copy_recursive(src, dst, dst_root, &[], &mut copied)?;
    Ok(copied)
}

/// Copy the contents of directory `src` into `dst`, skipping any path in
/// `exclude`.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[PathBuf]) -> io::Result<usize> {
    let mut copied = Vec::new();
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &dst.join(entry.file_name()), dst, exclude, &mut copied)?;
    }
    Ok(copied.len())
}

fn copy_recursive(
    src: &Path,
    dst: &Path,
    dst_root: &Path,
    exclude: &[PathBuf],
    copied: &mut Vec<(PathBuf, u64)>,
) -> io::Result<()> {
    if exclude.iter().any(|e| src.starts_with(e)) {
        return Ok(());
    }

    let metadata = fs::symlink_metadata(src)?;
    if metadata.file_type().is_symlink() {
        // Follow links to files; linked directories are skipped
        if src.is_file() {
            copy_file(src, dst, dst_root, copied)?;
        }
        return Ok(());
    }

    if metadata.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()), dst_root, exclude, copied)?;
        }
        return Ok(());
    }

    copy_file(src, dst, dst_root, copied)
}

fn copy_file(
    src: &Path,
    dst: &Path,
    dst_root: &Path,
    copied: &mut Vec<(PathBuf, u64)>,
) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let size = fs::copy(src, dst)?;
    let relative = dst.strip_prefix(dst_root).unwrap_or(dst).to_path_buf();
    copied.push((relative, size));
    Ok(())
}
