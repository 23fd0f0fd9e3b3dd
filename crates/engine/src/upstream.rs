//! Upstream database interface.
//!
//! The replication and basebackup wire client is an external collaborator
//! behind the [`Upstream`] trait: the engine asks it to identify the
//! system, bracket a base backup, enumerate and stream the cluster's
//! files, and hand over finished WAL segments. [`LocalUpstream`] is the
//! filesystem-backed implementation used by the local engine and the test
//! suite; wire implementations plug in without touching the stages.

use crate::server::ServerState;
use parking_lot::Mutex;
use pgharbor_core::{Error, Lsn, Result};
use pgharbor_wal::segment::{parse_file_name, SegmentName};
use pgharbor_wal::DEFAULT_SEGMENT_SIZE;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of an upstream system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    /// Database system identifier.
    pub system_id: u64,
    /// Server major version.
    pub major_version: u32,
    /// Server minor version.
    pub minor_version: u32,
    /// Current timeline.
    pub timeline: u32,
    /// Current write position.
    pub write_lsn: Lsn,
}

/// Positions bracketing the start of a base backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupStart {
    /// WAL position the backup starts at.
    pub start_lsn: Lsn,
    /// Checkpoint position of the backup.
    pub checkpoint_lsn: Lsn,
    /// Timeline at start.
    pub timeline: u32,
}

/// Positions bracketing the end of a base backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupEnd {
    /// WAL position the backup ends at.
    pub end_lsn: Lsn,
    /// Timeline at end.
    pub end_timeline: u32,
}

/// One file offered by the upstream during a base backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFile {
    /// Path relative to the data directory.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

/// Client to one upstream database.
pub trait Upstream: Send + Sync {
    /// Identify the system: id, version, timeline, write position.
    fn identify(&self) -> Result<SystemInfo>;

    /// Begin a base backup under the given label.
    fn start_backup(&self, label: &str) -> Result<BackupStart>;

    /// Enumerate the cluster files in the backup snapshot.
    fn list_files(&self) -> Result<Vec<UpstreamFile>>;

    /// Read one cluster file.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// End the base backup.
    fn stop_backup(&self) -> Result<BackupEnd>;

    /// The next finished WAL segment after `after`, with its bytes.
    ///
    /// `None` means no newer finished segment exists yet.
    fn next_wal_segment(&self, after: Option<SegmentName>) -> Result<Option<(String, Vec<u8>)>>;
}

/// Filesystem-backed upstream: a data directory plus a WAL directory.
pub struct LocalUpstream {
    data_dir: PathBuf,
    wal_dir: PathBuf,
    info: Mutex<SystemInfo>,
}

impl LocalUpstream {
    /// Wrap a data directory and WAL directory with the given identity.
    pub fn new(data_dir: PathBuf, wal_dir: PathBuf, info: SystemInfo) -> LocalUpstream {
        LocalUpstream {
            data_dir,
            wal_dir,
            info: Mutex::new(info),
        }
    }

    /// Advance the reported write position (tests and local mirroring).
    pub fn advance_lsn(&self, bytes: u64) -> Lsn {
        let mut info = self.info.lock();
        info.write_lsn = info.write_lsn.add(bytes);
        info.write_lsn
    }

    /// Publish the observed position into a server's runtime state.
    pub fn publish_position(&self, state: &Arc<ServerState>) {
        let info = self.info.lock();
        state.observe_position(info.timeline, info.write_lsn);
    }

    fn collect(&self, dir: &Path, out: &mut Vec<UpstreamFile>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
            if file_type.is_dir() {
                self.collect(&path, out)?;
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(&self.data_dir)
                    .map_err(|_| Error::format("walk escaped the data directory"))?;
                let size = entry.metadata().map_err(|e| Error::io(&path, e))?.len();
                out.push(UpstreamFile {
                    path: rel.to_string_lossy().replace('\\', "/"),
                    size,
                });
            }
        }
        Ok(())
    }
}

impl Upstream for LocalUpstream {
    fn identify(&self) -> Result<SystemInfo> {
        Ok(*self.info.lock())
    }

    fn start_backup(&self, _label: &str) -> Result<BackupStart> {
        let info = self.info.lock();
        Ok(BackupStart {
            start_lsn: info.write_lsn,
            checkpoint_lsn: info.write_lsn,
            timeline: info.timeline,
        })
    }

    fn list_files(&self) -> Result<Vec<UpstreamFile>> {
        let mut files = Vec::new();
        self.collect(&self.data_dir.clone(), &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.data_dir.join(path);
        std::fs::read(&full).map_err(|e| Error::io(&full, e))
    }

    fn stop_backup(&self) -> Result<BackupEnd> {
        let info = self.info.lock();
        Ok(BackupEnd {
            end_lsn: info.write_lsn,
            end_timeline: info.timeline,
        })
    }

    fn next_wal_segment(&self, after: Option<SegmentName>) -> Result<Option<(String, Vec<u8>)>> {
        let entries = match std::fs::read_dir(&self.wal_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&self.wal_dir, e)),
        };

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.wal_dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(parsed) = parse_file_name(&name, DEFAULT_SEGMENT_SIZE) {
                // Only finished, plain segments ship.
                if !parsed.partial && parsed.compression.is_none() && !parsed.encrypted {
                    candidates.push((parsed.name, name));
                }
            }
        }
        candidates.sort();

        for (seg, name) in candidates {
            if after.map(|a| seg > a).unwrap_or(true) {
                let full = self.wal_dir.join(&name);
                let bytes = std::fs::read(&full).map_err(|e| Error::io(&full, e))?;
                return Ok(Some((name, bytes)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upstream(dir: &Path) -> LocalUpstream {
        std::fs::create_dir_all(dir.join("data/base")).unwrap();
        std::fs::write(dir.join("data/PG_VERSION"), b"16\n").unwrap();
        std::fs::write(dir.join("data/base/1"), b"rel one").unwrap();
        std::fs::create_dir_all(dir.join("wal")).unwrap();
        LocalUpstream::new(
            dir.join("data"),
            dir.join("wal"),
            SystemInfo {
                system_id: 7,
                major_version: 16,
                minor_version: 3,
                timeline: 1,
                write_lsn: Lsn::new(0, 0x1000),
            },
        )
    }

    #[test]
    fn test_identify_and_backup_bracket() {
        let dir = tempdir().unwrap();
        let up = upstream(dir.path());

        let info = up.identify().unwrap();
        assert_eq!(info.system_id, 7);

        let start = up.start_backup("20260801000000").unwrap();
        up.advance_lsn(0x500);
        let end = up.stop_backup().unwrap();
        assert!(end.end_lsn > start.start_lsn);
        assert!(start.checkpoint_lsn >= start.start_lsn);
    }

    #[test]
    fn test_list_and_read_files() {
        let dir = tempdir().unwrap();
        let up = upstream(dir.path());

        let files = up.list_files().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["PG_VERSION", "base/1"]);

        assert_eq!(up.read_file("base/1").unwrap(), b"rel one");
        assert!(up.read_file("base/2").is_err());
    }

    #[test]
    fn test_next_wal_segment_ordering() {
        let dir = tempdir().unwrap();
        let up = upstream(dir.path());

        std::fs::write(dir.path().join("wal/000000010000000000000002"), b"b").unwrap();
        std::fs::write(dir.path().join("wal/000000010000000000000001"), b"a").unwrap();
        std::fs::write(
            dir.path().join("wal/000000010000000000000003.partial"),
            b"c",
        )
        .unwrap();

        let (first, bytes) = up.next_wal_segment(None).unwrap().unwrap();
        assert_eq!(first, "000000010000000000000001");
        assert_eq!(bytes, b"a");

        let after = parse_file_name(&first, DEFAULT_SEGMENT_SIZE).unwrap().name;
        let (second, _) = up.next_wal_segment(Some(after)).unwrap().unwrap();
        assert_eq!(second, "000000010000000000000002");

        let after = parse_file_name(&second, DEFAULT_SEGMENT_SIZE).unwrap().name;
        // The partial segment is not finished: nothing to ship.
        assert!(up.next_wal_segment(Some(after)).unwrap().is_none());
    }
}
