//! Backup manifest.
//!
//! A manifest is a signed JSON file enumerating every backed-up file with
//! size, timestamp, and checksum, plus the WAL range of the backup. The
//! file's last line is a checksum over every prior byte, so tampering with
//! either the body or an entry is detectable before any file comparison
//! runs.

use pgharbor_core::{Error, Lsn, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the manifest within a backup directory.
pub const MANIFEST_FILE: &str = "backup_manifest";

/// One file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the data directory.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification, unix seconds.
    pub last_modified: i64,
    /// Checksum algorithm for this entry.
    pub checksum_algo: String,
    /// Hex checksum of the file contents.
    pub checksum: String,
}

/// WAL range covered by a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRange {
    /// Backup start position.
    pub start_lsn: Lsn,
    /// Backup end position.
    pub end_lsn: Lsn,
    /// Timeline at start.
    pub start_tli: u32,
}

/// A backup manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version.
    pub version: u32,
    /// Database system identifier.
    pub system_id: u64,
    /// Per-file entries, sorted by path.
    pub files: Vec<ManifestFile>,
    /// WAL range, absent until the backup finishes.
    pub wal_range: Option<WalRange>,
}

/// Compute the hex digest of a buffer with the named algorithm.
pub fn digest_hex(algo: &str, data: &[u8]) -> Result<String> {
    match algo {
        "sha512" => Ok(hex(&Sha512::digest(data))),
        "sha256" => Ok(hex(&Sha256::digest(data))),
        other => Err(Error::config(format!("unknown checksum algorithm '{}'", other))),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{:02x}", b));
    }
    out
}

impl Manifest {
    /// An empty manifest.
    pub fn new(system_id: u64) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            system_id,
            files: Vec::new(),
            wal_range: None,
        }
    }

    /// Build a manifest over a directory tree, checksumming every file.
    pub fn build_from_dir(dir: &Path, system_id: u64, algo: &str) -> Result<Manifest> {
        let mut manifest = Manifest::new(system_id);
        let mut paths = Vec::new();
        collect_files(dir, dir, &mut paths)?;
        paths.sort();

        for rel in paths {
            let full = dir.join(&rel);
            let data = std::fs::read(&full).map_err(|e| Error::io(&full, e))?;
            let meta = std::fs::metadata(&full).map_err(|e| Error::io(&full, e))?;
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            manifest.files.push(ManifestFile {
                path: rel,
                size: data.len() as u64,
                last_modified,
                checksum_algo: algo.to_string(),
                checksum: digest_hex(algo, &data)?,
            });
        }
        Ok(manifest)
    }

    /// Total logical size of all entries.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Find an entry by relative path.
    pub fn file(&self, path: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Serialize: body JSON plus a trailing checksum line over all prior
    /// bytes.
    pub fn serialize(&self) -> Result<String> {
        let body = serde_json::to_string_pretty(self)?;
        let mut out = body;
        out.push('\n');
        let checksum = digest_hex("sha512", out.as_bytes())?;
        out.push_str(&checksum);
        out.push('\n');
        Ok(out)
    }

    /// Parse and verify the trailing manifest checksum.
    pub fn parse(text: &str) -> Result<Manifest> {
        let trimmed = text.strip_suffix('\n').unwrap_or(text);
        let (body, stored) = trimmed
            .rsplit_once('\n')
            .ok_or_else(|| Error::corruption("manifest has no checksum line"))?;
        let mut covered = String::with_capacity(body.len() + 1);
        covered.push_str(body);
        covered.push('\n');
        let computed = digest_hex("sha512", covered.as_bytes())?;
        if computed != stored {
            return Err(Error::corruption("manifest checksum mismatch"));
        }
        let manifest: Manifest = serde_json::from_str(body)?;
        Ok(manifest)
    }

    /// Write into a backup directory.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, self.serialize()?).map_err(|e| Error::io(&path, e))
    }

    /// Load from a backup directory, verifying the manifest checksum.
    pub fn load(dir: &Path) -> Result<Manifest> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Manifest::parse(&text)
    }

    /// Verify every entry against the files under `dir`.
    ///
    /// Size mismatch, checksum mismatch, and missing files surface as
    /// `corruption` naming the offending path.
    pub fn verify_dir(&self, dir: &Path) -> Result<()> {
        for entry in &self.files {
            let full = dir.join(&entry.path);
            let data = std::fs::read(&full).map_err(|_| {
                Error::corruption(format!("file '{}' listed in manifest is missing", entry.path))
            })?;
            if data.len() as u64 != entry.size {
                return Err(Error::corruption(format!(
                    "file '{}' is {} bytes, manifest says {}",
                    entry.path,
                    data.len(),
                    entry.size
                )));
            }
            let checksum = digest_hex(&entry.checksum_algo, &data)?;
            if checksum != entry.checksum {
                return Err(Error::corruption(format!(
                    "file '{}' checksum mismatch",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| Error::format("walk escaped the manifest root"))?;
            // The manifest must not include itself.
            if rel.as_os_str() != MANIFEST_FILE {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("base/1")).unwrap();
        std::fs::write(dir.join("base/1/1234"), b"relation data").unwrap();
        std::fs::write(dir.join("PG_VERSION"), b"16\n").unwrap();
    }

    #[test]
    fn test_build_serialize_parse_roundtrip() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());

        let manifest = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.total_size(), 16);

        let text = manifest.serialize().unwrap();
        let parsed = Manifest::parse(&text).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_tampered_manifest_detected() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());
        let manifest = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();
        let text = manifest.serialize().unwrap();

        let tampered = text.replace("relation", "selation");
        // Whether or not the word occurs in the body, flipping any byte of
        // a checksum line or the body must fail.
        let mut bytes = text.clone().into_bytes();
        bytes[10] ^= 0x01;
        let flipped = String::from_utf8(bytes).unwrap();

        assert!(matches!(
            Manifest::parse(&flipped),
            Err(Error::Corruption { .. })
        ));
        let _ = tampered;
    }

    #[test]
    fn test_verify_dir_detects_modification() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());
        let manifest = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();

        manifest.verify_dir(dir.path()).unwrap();

        // Same size, different contents.
        std::fs::write(dir.path().join("base/1/1234"), b"relation derp").unwrap();
        let err = manifest.verify_dir(dir.path()).unwrap_err();
        assert_eq!(err.code(), "corruption");
        assert!(err.to_string().contains("base/1/1234"));
    }

    #[test]
    fn test_verify_dir_detects_size_change_and_removal() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());
        let manifest = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();

        std::fs::write(dir.path().join("PG_VERSION"), b"16.1\n").unwrap();
        assert!(manifest.verify_dir(dir.path()).is_err());

        std::fs::remove_file(dir.path().join("PG_VERSION")).unwrap();
        assert!(manifest.verify_dir(dir.path()).is_err());
    }

    #[test]
    fn test_manifest_excludes_itself() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());
        let manifest = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();
        manifest.write(dir.path()).unwrap();

        let rebuilt = Manifest::build_from_dir(dir.path(), 42, "sha512").unwrap();
        assert_eq!(rebuilt.files.len(), manifest.files.len());
    }

    #[test]
    fn test_sha256_entries() {
        let dir = tempdir().unwrap();
        sample_tree(dir.path());
        let manifest = Manifest::build_from_dir(dir.path(), 1, "sha256").unwrap();
        assert!(manifest.files.iter().all(|f| f.checksum_algo == "sha256"));
        manifest.verify_dir(dir.path()).unwrap();
    }
}
