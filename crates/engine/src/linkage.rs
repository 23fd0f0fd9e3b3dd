//! File tree copying and hard-link deduplication.
//!
//! Copies fan out on the worker pool under the backup token bucket; the
//! link stage deduplicates an incremental backup against its parent by
//! hard-linking files whose manifest checksums match, falling back to the
//! already-written copy when the filesystem refuses links.

use crate::manifest::Manifest;
use pgharbor_core::{Error, Result};
use pgharbor_workflow::{TokenBucket, WorkerPool};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Copy one file, creating parent directories.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::copy(src, dst).map_err(|e| Error::io(src, e))
}

/// Hard-link a file where the filesystem allows, otherwise copy.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(0),
        Err(_) => copy_file(src, dst),
    }
}

/// Total size in bytes of all files under a tree.
pub fn tree_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let entries = std::fs::read_dir(path).map_err(|e| Error::io(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(path, e))?;
        let child = entry.path();
        if entry.file_type().map_err(|e| Error::io(&child, e))?.is_dir() {
            total += tree_size(&child)?;
        } else {
            total += entry.metadata().map_err(|e| Error::io(&child, e))?.len();
        }
    }
    Ok(total)
}

/// Relative paths of all files under a tree.
pub fn tree_files(root: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            if entry.file_type().map_err(|e| Error::io(&path, e))?.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|_| Error::format("walk escaped the tree root"))?;
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}

/// Recursively copy a tree, sequentially.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut total = 0;
    std::fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| Error::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type().map_err(|e| Error::io(&from, e))?.is_dir() {
            total += copy_tree(&from, &to)?;
        } else {
            total += copy_file(&from, &to)?;
        }
    }
    Ok(total)
}

/// Copy a list of relative paths from `src` to `dst` on the worker pool.
///
/// Each file is one job; throughput is bounded by the token bucket. The
/// pool's batch outcome reports failure.
pub fn copy_files_parallel(
    src: &Path,
    dst: &Path,
    files: &[String],
    pool: &WorkerPool,
    bucket: &Arc<TokenBucket>,
) -> Result<()> {
    pool.begin_batch();
    for rel in files {
        let from = src.join(rel);
        let to = dst.join(rel);
        let bucket = bucket.clone();
        pool.submit(format!("copy:{}", rel), move |ctx| {
            if ctx.stop_requested() {
                return Err(Error::Canceled);
            }
            let size = std::fs::metadata(&from).map(|m| m.len()).unwrap_or(0);
            bucket.consume(size, ctx.stop_flag())?;
            copy_file(&from, &to)?;
            Ok(())
        });
    }
    pool.join_all();
    if !pool.outcome() {
        return Err(Error::io(
            dst,
            std::io::Error::other("one or more copy jobs failed"),
        ));
    }
    Ok(())
}

/// Deduplicate a backup's data directory against its parent.
///
/// Files whose manifest checksums match are replaced by hard links into
/// the parent. Returns the number of files linked; individual link
/// failures keep the copy and log a warning.
pub fn dedup_against_parent(
    data_dir: &Path,
    parent_data_dir: &Path,
    manifest: &Manifest,
    parent_manifest: &Manifest,
) -> u64 {
    let mut linked = 0;
    for entry in &manifest.files {
        let Some(parent_entry) = parent_manifest.file(&entry.path) else {
            continue;
        };
        if parent_entry.checksum != entry.checksum || parent_entry.size != entry.size {
            continue;
        }
        let ours = data_dir.join(&entry.path);
        let theirs = parent_data_dir.join(&entry.path);
        if !theirs.exists() {
            continue;
        }
        if std::fs::remove_file(&ours)
            .and_then(|_| std::fs::hard_link(&theirs, &ours))
            .is_ok()
        {
            linked += 1;
            debug!(target: "pgharbor::engine", path = %entry.path, "linked against parent");
        } else {
            // Restore the copy so the backup stays complete.
            if let Err(e) = copy_file(&theirs, &ours) {
                warn!(
                    target: "pgharbor::engine",
                    path = %entry.path,
                    error = %e,
                    "link dedup failed and copy-back failed"
                );
            }
        }
    }
    linked
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a"), b"aaa").unwrap();
        std::fs::write(src.join("nested/b"), b"bb").unwrap();

        let dst = dir.path().join("dst");
        let total = copy_tree(&src, &dst).unwrap();
        assert_eq!(total, 5);
        assert_eq!(std::fs::read(dst.join("a")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(dst.join("nested/b")).unwrap(), b"bb");
    }

    #[test]
    fn test_parallel_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("base")).unwrap();
        let mut files = Vec::new();
        for i in 0..20 {
            let rel = format!("base/{}", i);
            std::fs::write(src.join(&rel), vec![i as u8; 100]).unwrap();
            files.push(rel);
        }

        let dst = dir.path().join("dst");
        let pool = WorkerPool::new(4);
        let bucket = Arc::new(TokenBucket::unlimited());
        copy_files_parallel(&src, &dst, &files, &pool, &bucket).unwrap();

        for (i, rel) in files.iter().enumerate() {
            assert_eq!(std::fs::read(dst.join(rel)).unwrap(), vec![i as u8; 100]);
        }
    }

    #[test]
    fn test_parallel_copy_missing_file_fails_batch() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("present"), b"x").unwrap();

        let files = vec!["present".to_string(), "missing".to_string()];
        let pool = WorkerPool::new(2);
        let bucket = Arc::new(TokenBucket::unlimited());
        let result =
            copy_files_parallel(&src, &dir.path().join("dst"), &files, &pool, &bucket);
        assert!(result.is_err());
    }

    #[test]
    fn test_dedup_links_identical_files() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("parent");
        let child = dir.path().join("child");
        std::fs::create_dir_all(&parent).unwrap();
        std::fs::create_dir_all(&child).unwrap();
        std::fs::write(parent.join("same"), b"identical").unwrap();
        std::fs::write(child.join("same"), b"identical").unwrap();
        std::fs::write(parent.join("differs"), b"old").unwrap();
        std::fs::write(child.join("differs"), b"new").unwrap();

        let parent_manifest = Manifest::build_from_dir(&parent, 1, "sha256").unwrap();
        let child_manifest = Manifest::build_from_dir(&child, 1, "sha256").unwrap();

        let linked =
            dedup_against_parent(&child, &parent, &child_manifest, &parent_manifest);
        assert_eq!(linked, 1);

        // Contents identical, and on unix the inode is shared.
        assert_eq!(std::fs::read(child.join("same")).unwrap(), b"identical");
        assert_eq!(std::fs::read(child.join("differs")).unwrap(), b"new");
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            assert_eq!(
                std::fs::metadata(parent.join("same")).unwrap().ino(),
                std::fs::metadata(child.join("same")).unwrap().ino()
            );
        }
    }
}
