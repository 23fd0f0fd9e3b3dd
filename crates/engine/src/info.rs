//! Backup metadata.
//!
//! Each backup directory carries a `backup.info` key=value file recording
//! the snapshot's identity: validity tri-state, server version, WAL
//! positions and timelines, logical vs stored size, per-phase elapsed
//! times, keep flag, and the parent label for incrementals.

use chrono::{DateTime, Utc};
use pgharbor_core::{Error, Lsn, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

/// File name of the per-backup metadata file.
pub const INFO_FILE: &str = "backup.info";

/// Backup validity tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    /// Usable for restore.
    Valid,
    /// Known bad; retained only for inspection.
    Invalid,
    /// Creation still in flight, or interrupted.
    #[default]
    Partial,
}

impl Validity {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Valid => "valid",
            Validity::Invalid => "invalid",
            Validity::Partial => "partial",
        }
    }
}

impl FromStr for Validity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "valid" => Validity::Valid,
            "invalid" => Validity::Invalid,
            "partial" => Validity::Partial,
            other => return Err(Error::format(format!("unknown validity '{}'", other))),
        })
    }
}

/// Generate a sortable backup label from a timestamp.
pub fn generate_label(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// Parse a label back into its timestamp.
pub fn label_timestamp(label: &str) -> Result<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(label, "%Y%m%d%H%M%S")
        .map_err(|_| Error::format(format!("'{}' is not a backup label", label)))?;
    Ok(naive.and_utc())
}

/// Metadata of one backup.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    /// Sortable label; also the backup directory name.
    pub label: String,
    /// Validity tri-state.
    pub validity: Validity,
    /// Server major version.
    pub major_version: u32,
    /// Server minor version.
    pub minor_version: u32,
    /// WAL position where the base backup started.
    pub start_lsn: Lsn,
    /// Checkpoint position of the backup.
    pub checkpoint_lsn: Lsn,
    /// WAL position where the base backup ended.
    pub end_lsn: Lsn,
    /// Timeline at start.
    pub start_timeline: u32,
    /// Timeline at end.
    pub end_timeline: u32,
    /// Logical byte size (what a restore materializes).
    pub restore_size: u64,
    /// Stored byte size after compression/encryption.
    pub backup_size: u64,
    /// Never deleted by retention while set.
    pub keep: bool,
    /// Parent label for incremental backups.
    pub parent: Option<String>,
    /// Compression tag the artifacts were written with.
    pub compression: String,
    /// Encryption tag the artifacts were written with.
    pub encryption: String,
    /// Checksum algorithm of the manifest.
    pub hash_algo: String,
    /// Per-phase elapsed seconds, keyed by phase name.
    pub elapsed: BTreeMap<String, f64>,
}

impl BackupInfo {
    /// A fresh, partial backup record.
    pub fn new(label: impl Into<String>) -> BackupInfo {
        BackupInfo {
            label: label.into(),
            validity: Validity::Partial,
            major_version: 0,
            minor_version: 0,
            start_lsn: Lsn::ZERO,
            checkpoint_lsn: Lsn::ZERO,
            end_lsn: Lsn::ZERO,
            start_timeline: 1,
            end_timeline: 1,
            restore_size: 0,
            backup_size: 0,
            keep: false,
            parent: None,
            compression: "none".to_string(),
            encryption: "none".to_string(),
            hash_algo: "sha512".to_string(),
            elapsed: BTreeMap::new(),
        }
    }

    /// Serialize to the key=value form.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "label={}", self.label);
        let _ = writeln!(out, "status={}", self.validity.as_str());
        let _ = writeln!(out, "major_version={}", self.major_version);
        let _ = writeln!(out, "minor_version={}", self.minor_version);
        let _ = writeln!(out, "start_lsn={}", self.start_lsn);
        let _ = writeln!(out, "checkpoint_lsn={}", self.checkpoint_lsn);
        let _ = writeln!(out, "end_lsn={}", self.end_lsn);
        let _ = writeln!(out, "start_timeline={}", self.start_timeline);
        let _ = writeln!(out, "end_timeline={}", self.end_timeline);
        let _ = writeln!(out, "restore_size={}", self.restore_size);
        let _ = writeln!(out, "backup_size={}", self.backup_size);
        let _ = writeln!(out, "keep={}", self.keep);
        if let Some(parent) = &self.parent {
            let _ = writeln!(out, "parent={}", parent);
        }
        let _ = writeln!(out, "compression={}", self.compression);
        let _ = writeln!(out, "encryption={}", self.encryption);
        let _ = writeln!(out, "hash_algo={}", self.hash_algo);
        for (phase, seconds) in &self.elapsed {
            let _ = writeln!(out, "elapsed_{}={:.3}", phase, seconds);
        }
        out
    }

    /// Parse the key=value form.
    pub fn parse(text: &str) -> Result<BackupInfo> {
        let mut info = BackupInfo::new("");
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::format(format!("bad backup.info line '{}'", line)))?;
            let bad = |k: &str| Error::format(format!("bad backup.info value for {}", k));
            match key {
                "label" => info.label = value.to_string(),
                "status" => info.validity = value.parse()?,
                "major_version" => info.major_version = value.parse().map_err(|_| bad(key))?,
                "minor_version" => info.minor_version = value.parse().map_err(|_| bad(key))?,
                "start_lsn" => info.start_lsn = value.parse().map_err(|_| bad(key))?,
                "checkpoint_lsn" => info.checkpoint_lsn = value.parse().map_err(|_| bad(key))?,
                "end_lsn" => info.end_lsn = value.parse().map_err(|_| bad(key))?,
                "start_timeline" => info.start_timeline = value.parse().map_err(|_| bad(key))?,
                "end_timeline" => info.end_timeline = value.parse().map_err(|_| bad(key))?,
                "restore_size" => info.restore_size = value.parse().map_err(|_| bad(key))?,
                "backup_size" => info.backup_size = value.parse().map_err(|_| bad(key))?,
                "keep" => info.keep = value == "true",
                "parent" => info.parent = Some(value.to_string()),
                "compression" => info.compression = value.to_string(),
                "encryption" => info.encryption = value.to_string(),
                "hash_algo" => info.hash_algo = value.to_string(),
                elapsed if elapsed.starts_with("elapsed_") => {
                    let phase = elapsed.trim_start_matches("elapsed_").to_string();
                    info.elapsed
                        .insert(phase, value.parse().map_err(|_| bad(key))?);
                }
                // Unknown keys from newer builds are preserved nowhere but
                // must not fail the parse.
                _ => {}
            }
        }
        if info.label.is_empty() {
            return Err(Error::format("backup.info is missing a label"));
        }
        Ok(info)
    }

    /// Write alongside the backup data.
    pub fn write(&self, backup_dir: &Path) -> Result<()> {
        let path = backup_dir.join(INFO_FILE);
        std::fs::write(&path, self.serialize()).map_err(|e| Error::io(&path, e))
    }

    /// Load from a backup directory.
    pub fn load(backup_dir: &Path) -> Result<BackupInfo> {
        let path = backup_dir.join(INFO_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        BackupInfo::parse(&text)
    }

    /// The invariant every finished backup satisfies.
    pub fn lsn_ordering_holds(&self) -> bool {
        self.end_lsn >= self.checkpoint_lsn
            && self.checkpoint_lsn >= self.start_lsn
            && self.end_timeline >= self.start_timeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label_roundtrip() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 15).unwrap();
        let label = generate_label(at);
        assert_eq!(label, "20260801093015");
        assert_eq!(label_timestamp(&label).unwrap(), at);
        assert!(label_timestamp("not-a-label").is_err());
    }

    #[test]
    fn test_labels_sort_chronologically() {
        let a = generate_label(Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
        let b = generate_label(Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap());
        assert!(a < b);
    }

    #[test]
    fn test_info_roundtrip() {
        let mut info = BackupInfo::new("20260801093015");
        info.validity = Validity::Valid;
        info.major_version = 16;
        info.minor_version = 3;
        info.start_lsn = Lsn::new(0, 0x100);
        info.checkpoint_lsn = Lsn::new(0, 0x180);
        info.end_lsn = Lsn::new(0, 0x200);
        info.restore_size = 128 * 1024 * 1024;
        info.backup_size = 40 * 1024 * 1024;
        info.keep = true;
        info.parent = Some("20260731093015".to_string());
        info.compression = "zstd".to_string();
        info.elapsed.insert("basebackup".to_string(), 12.5);
        info.elapsed.insert("compression_zstd".to_string(), 3.25);

        let parsed = BackupInfo::parse(&info.serialize()).unwrap();
        assert_eq!(parsed, info);
        assert!(parsed.lsn_ordering_holds());
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = BackupInfo::new("20260801000000");
        info.validity = Validity::Valid;
        info.write(dir.path()).unwrap();

        let loaded = BackupInfo::load(dir.path()).unwrap();
        assert_eq!(loaded.label, "20260801000000");
        assert_eq!(loaded.validity, Validity::Valid);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BackupInfo::parse("no equals sign").is_err());
        assert!(BackupInfo::parse("status=valid\n").is_err()); // no label
        assert!(BackupInfo::parse("label=x\nstart_lsn=zzz\n").is_err());
    }

    #[test]
    fn test_lsn_ordering_invariant() {
        let mut info = BackupInfo::new("x");
        info.start_lsn = Lsn(100);
        info.checkpoint_lsn = Lsn(50);
        info.end_lsn = Lsn(200);
        assert!(!info.lsn_ordering_holds());
        info.checkpoint_lsn = Lsn(150);
        assert!(info.lsn_ordering_holds());
    }
}
