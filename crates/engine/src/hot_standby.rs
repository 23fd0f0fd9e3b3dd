//! Hot-standby materialization.
//!
//! Produces an on-disk data directory mirroring the most recent valid
//! backup plus all archived WAL up to the tip. Hard links are used where
//! the filesystem allows, copies otherwise. The target is rebuilt into a
//! staging sibling and swapped in, so a crash mid-materialization never
//! leaves a half-written standby at the configured path.

use crate::info::{BackupInfo, Validity};
use crate::linkage::link_or_copy;
use pgharbor_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Find the most recent valid backup under a server's backup directory.
pub fn newest_valid_backup(backup_root: &Path) -> Result<Option<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(backup_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(backup_root, e)),
    };

    let mut labels = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(backup_root, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let label = entry.file_name().to_string_lossy().to_string();
        if let Ok(info) = BackupInfo::load(&entry.path()) {
            if info.validity == Validity::Valid {
                labels.push(label);
            }
        }
    }
    labels.sort();
    Ok(labels
        .pop()
        .map(|label| (label.clone(), backup_root.join(label))))
}

fn mirror_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
    let entries = std::fs::read_dir(src).map_err(|e| Error::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type().map_err(|e| Error::io(&from, e))?.is_dir() {
            mirror_tree(&from, &to)?;
        } else {
            link_or_copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Materialize a standby data directory at `target`.
///
/// `data_dir` is the (combined) backup data directory; `wal_dir` supplies
/// archived segments, mirrored into `pg_wal` so replay can reach the tip.
pub fn materialize(data_dir: &Path, wal_dir: &Path, target: &Path) -> Result<()> {
    let staging = target.with_extension("standby-staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| Error::io(&staging, e))?;
    }

    mirror_tree(data_dir, &staging)?;

    // Archived WAL lands in pg_wal for replay.
    let pg_wal = staging.join("pg_wal");
    std::fs::create_dir_all(&pg_wal).map_err(|e| Error::io(&pg_wal, e))?;
    if wal_dir.exists() {
        let entries = std::fs::read_dir(wal_dir).map_err(|e| Error::io(wal_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(wal_dir, e))?;
            if entry.path().is_file() {
                link_or_copy(&entry.path(), &pg_wal.join(entry.file_name()))?;
            }
        }
    }

    if target.exists() {
        std::fs::remove_dir_all(target).map_err(|e| Error::io(target, e))?;
    }
    std::fs::rename(&staging, target).map_err(|e| Error::io(target, e))?;
    info!(
        target: "pgharbor::engine",
        standby = %target.display(),
        "hot standby materialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_newest_valid_backup_skips_invalid() {
        let dir = tempdir().unwrap();
        for (label, validity) in [
            ("20260801000000", Validity::Valid),
            ("20260802000000", Validity::Partial),
            ("20260731000000", Validity::Valid),
        ] {
            let backup = dir.path().join(label);
            std::fs::create_dir_all(&backup).unwrap();
            let mut info = BackupInfo::new(label);
            info.validity = validity;
            info.write(&backup).unwrap();
        }

        let (label, _) = newest_valid_backup(dir.path()).unwrap().unwrap();
        // The newer partial backup does not qualify.
        assert_eq!(label, "20260801000000");
    }

    #[test]
    fn test_no_backups_yields_none() {
        let dir = tempdir().unwrap();
        assert!(newest_valid_backup(&dir.path().join("missing"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_materialize_mirrors_data_and_wal() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("base")).unwrap();
        std::fs::write(data.join("PG_VERSION"), b"16\n").unwrap();
        std::fs::write(data.join("base/1"), b"rel").unwrap();

        let wal = dir.path().join("wal");
        std::fs::create_dir_all(&wal).unwrap();
        std::fs::write(wal.join("000000010000000000000001"), b"seg").unwrap();

        let target = dir.path().join("standby");
        materialize(&data, &wal, &target).unwrap();

        assert_eq!(std::fs::read(target.join("PG_VERSION")).unwrap(), b"16\n");
        assert_eq!(std::fs::read(target.join("base/1")).unwrap(), b"rel");
        assert_eq!(
            std::fs::read(target.join("pg_wal/000000010000000000000001")).unwrap(),
            b"seg"
        );
    }

    #[test]
    fn test_materialize_replaces_previous_standby() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("fresh"), b"new").unwrap();

        let target = dir.path().join("standby");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale"), b"old").unwrap();

        materialize(&data, &dir.path().join("missing-wal"), &target).unwrap();
        assert!(target.join("fresh").exists());
        assert!(!target.join("stale").exists());
    }
}
