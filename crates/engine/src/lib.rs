//! Backup engine: stages, artifacts, storage backends, and the supervisor.
//!
//! The engine composes the workflow crate's stage machinery into the four
//! storage-engine pipelines (local, ssh, s3, azure), maintains the on-disk
//! layout `<base_dir>/<server>/{backup,wal,summary}`, and runs the
//! management supervisor with its per-server operation state machine.

pub mod cipher;
pub mod codec;
pub mod combine;
pub mod dio;
pub mod hot_standby;
pub mod info;
pub mod linkage;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod ops;
pub mod proctitle;
pub mod protocol;
pub mod retention;
pub mod server;
pub mod stages;
pub mod storage;
pub mod supervisor;
pub mod upstream;
pub mod walship;

pub use cipher::Cipher;
pub use codec::Codec;
pub use info::{BackupInfo, Validity};
pub use manifest::Manifest;
pub use metrics::MetricsCache;
pub use server::{OperationKind, ServerRegistry, ServerState};
pub use supervisor::Supervisor;
pub use upstream::{LocalUpstream, Upstream};

use std::path::{Path, PathBuf};

/// Per-server backup directory.
pub fn backup_dir(base_dir: &Path, server: &str) -> PathBuf {
    base_dir.join(server).join("backup")
}

/// Per-server WAL directory.
pub fn wal_dir(base_dir: &Path, server: &str) -> PathBuf {
    base_dir.join(server).join("wal")
}

/// Per-server summary directory.
pub fn summary_dir(base_dir: &Path, server: &str) -> PathBuf {
    base_dir.join(server).join("summary")
}
