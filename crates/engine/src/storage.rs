//! Storage backends.
//!
//! The `storage_engine` bitfield selects where finished artifacts live.
//! The local engine writes `<base_dir>` directly; the remote engines go
//! through the [`RemoteStore`] trait (put/get/list/delete on relative
//! paths). The ssh/s3/azure transports themselves are external
//! collaborators; this build maps each onto a path-mapped directory store
//! rooted at the engine's configured base directory, which is also what
//! the test suite drives.

use pgharbor_config::{Config, StorageEngines};
use pgharbor_core::{Error, Result};
use std::path::{Path, PathBuf};

/// A remote artifact store addressed by relative paths.
pub trait RemoteStore: Send + Sync {
    /// Engine name (`ssh`, `s3`, `azure`, `local`).
    fn name(&self) -> &'static str;

    /// Store a file, creating parent directories as needed. Idempotent by
    /// path: re-putting overwrites.
    fn put(&self, rel: &Path, data: &[u8]) -> Result<()>;

    /// Fetch a file.
    fn get(&self, rel: &Path) -> Result<Vec<u8>>;

    /// List files under a prefix, relative paths.
    fn list(&self, rel_prefix: &Path) -> Result<Vec<String>>;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete(&self, rel: &Path) -> Result<()>;

    /// Whether a file exists.
    fn exists(&self, rel: &Path) -> bool;
}

/// Path-mapped store rooted at a directory.
pub struct DirStore {
    name: &'static str,
    root: PathBuf,
}

impl DirStore {
    /// A store writing under `root`.
    pub fn new(name: &'static str, root: PathBuf) -> DirStore {
        DirStore { name, root }
    }

    fn full(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

impl RemoteStore for DirStore {
    fn name(&self) -> &'static str {
        self.name
    }

    fn put(&self, rel: &Path, data: &[u8]) -> Result<()> {
        let full = self.full(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&full, data).map_err(|e| Error::io(&full, e))
    }

    fn get(&self, rel: &Path) -> Result<Vec<u8>> {
        let full = self.full(rel);
        std::fs::read(&full).map_err(|e| Error::io(&full, e))
    }

    fn list(&self, rel_prefix: &Path) -> Result<Vec<String>> {
        let base = self.full(rel_prefix);
        let mut out = Vec::new();
        if base.exists() {
            walk(&self.root, &base, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, rel: &Path) -> Result<()> {
        let full = self.full(rel);
        match std::fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&full, e)),
        }
    }

    fn exists(&self, rel: &Path) -> bool {
        self.full(rel).exists()
    }
}

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
                .map_err(|_| Error::format("walk escaped the store root"))?;
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// The engine that runs the primary workflow when several are configured.
///
/// Priority order: local before ssh before s3 before azure.
pub fn primary_engine(engines: StorageEngines) -> &'static str {
    if engines.local() {
        "local"
    } else if engines.ssh() {
        "ssh"
    } else if engines.s3() {
        "s3"
    } else {
        "azure"
    }
}

/// Build the remote stores for every configured non-local engine.
pub fn remote_stores(config: &Config) -> Result<Vec<Box<dyn RemoteStore>>> {
    let mut stores: Vec<Box<dyn RemoteStore>> = Vec::new();
    if config.storage_engine.ssh() {
        if config.ssh_base_dir.as_os_str().is_empty() {
            return Err(Error::config("ssh storage engine requires ssh_base_dir"));
        }
        stores.push(Box::new(DirStore::new("ssh", config.ssh_base_dir.clone())));
    }
    if config.storage_engine.s3() {
        if config.s3_base_dir.as_os_str().is_empty() {
            return Err(Error::config("s3 storage engine requires s3_base_dir"));
        }
        stores.push(Box::new(DirStore::new("s3", config.s3_base_dir.clone())));
    }
    if config.storage_engine.azure() {
        if config.azure_base_dir.as_os_str().is_empty() {
            return Err(Error::config(
                "azure storage engine requires azure_base_dir",
            ));
        }
        stores.push(Box::new(DirStore::new(
            "azure",
            config.azure_base_dir.clone(),
        )));
    }
    Ok(stores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dir_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = DirStore::new("ssh", dir.path().to_path_buf());

        store
            .put(Path::new("primary/backup/x/data.tar.zstd"), b"artifact")
            .unwrap();
        assert!(store.exists(Path::new("primary/backup/x/data.tar.zstd")));
        assert_eq!(
            store.get(Path::new("primary/backup/x/data.tar.zstd")).unwrap(),
            b"artifact"
        );

        let listed = store.list(Path::new("primary")).unwrap();
        assert_eq!(listed, vec!["primary/backup/x/data.tar.zstd"]);

        store.delete(Path::new("primary/backup/x/data.tar.zstd")).unwrap();
        assert!(!store.exists(Path::new("primary/backup/x/data.tar.zstd")));
        // Idempotent delete.
        store.delete(Path::new("primary/backup/x/data.tar.zstd")).unwrap();
    }

    #[test]
    fn test_primary_engine_priority() {
        let both: StorageEngines = "local,s3".parse().unwrap();
        assert_eq!(primary_engine(both), "local");
        let remote: StorageEngines = "s3,azure".parse().unwrap();
        assert_eq!(primary_engine(remote), "s3");
        let azure: StorageEngines = "azure".parse().unwrap();
        assert_eq!(primary_engine(azure), "azure");
    }

    #[test]
    fn test_remote_stores_require_base_dirs() {
        let config = Config {
            base_dir: "/b".into(),
            storage_engine: "local,ssh".parse().unwrap(),
            ..Default::default()
        };
        assert!(remote_stores(&config).is_err());

        let config = Config {
            ssh_base_dir: "/remote".into(),
            ..config
        };
        let stores = remote_stores(&config).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].name(), "ssh");
    }
}
