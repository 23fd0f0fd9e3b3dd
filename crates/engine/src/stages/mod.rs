//! Pipeline stages.
//!
//! The stage sets compose into the backup, restore, and retention
//! workflows. Stages share an immutable [`StageEnv`] (configuration
//! snapshot, upstream client, worker pool, token buckets) and communicate
//! through the run context under the `keys` namespace.

pub mod backup;
pub mod restore;
pub mod retention;

use crate::manifest::{Manifest, ManifestFile};
use crate::upstream::Upstream;
use pgharbor_config::{Config, ServerConfig};
use pgharbor_core::value::ObjectValue;
use pgharbor_core::Value;
use pgharbor_workflow::{RunContext, TokenBucket, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;

/// Context key namespace.
pub mod keys {
    /// Backup label for this run.
    pub const LABEL: &str = "backup/label";
    /// Parent label when running incremental.
    pub const PARENT: &str = "backup/parent";
    /// Whether this run stores only changes against the parent.
    pub const INCREMENTAL: &str = "backup/incremental";
    /// Parent manifest object.
    pub const PARENT_MANIFEST: &str = "backup/parent-manifest";
    /// Collected manifest entries object.
    pub const ENTRIES: &str = "backup/entries";
    /// Finished manifest object.
    pub const MANIFEST: &str = "backup/manifest";
    /// Whether the artifact reached its final directory.
    pub const PUBLISHED: &str = "backup/published";
    /// Logical size of the cluster.
    pub const RESTORE_SIZE: &str = "backup/restore-size";
    /// Stored size of the artifacts.
    pub const BACKUP_SIZE: &str = "backup/backup-size";
    /// Upstream system identifier.
    pub const SYSTEM_ID: &str = "upstream/system-id";
    /// Upstream major version.
    pub const MAJOR_VERSION: &str = "upstream/major";
    /// Upstream minor version.
    pub const MINOR_VERSION: &str = "upstream/minor";
    /// Backup start position.
    pub const START_LSN: &str = "backup/start-lsn";
    /// Backup checkpoint position.
    pub const CHECKPOINT_LSN: &str = "backup/checkpoint-lsn";
    /// Backup end position.
    pub const END_LSN: &str = "backup/end-lsn";
    /// Timeline at start.
    pub const START_TIMELINE: &str = "backup/start-timeline";
    /// Timeline at end.
    pub const END_TIMELINE: &str = "backup/end-timeline";
    /// Restore target directory.
    pub const RESTORE_TARGET: &str = "restore/target";
    /// Restore chain labels, oldest first.
    pub const RESTORE_CHAIN: &str = "restore/chain";
    /// Retention loser labels.
    pub const RETENTION_LOSERS: &str = "retention/losers";
    /// Retention survivor labels.
    pub const RETENTION_SURVIVORS: &str = "retention/survivors";
    /// Deletions that failed (isolated, not fatal).
    pub const RETENTION_FAILED: &str = "retention/failed";
    /// Elapsed-seconds prefix; phase name appends.
    pub const ELAPSED_PREFIX: &str = "elapsed/";
}

/// Immutable per-run environment shared by all stages.
pub struct StageEnv {
    /// Configuration snapshot taken when the run began.
    pub config: Arc<Config>,
    /// The server this run operates on.
    pub server: ServerConfig,
    /// Upstream client.
    pub upstream: Arc<dyn Upstream>,
    /// Worker pool for fan-out jobs.
    pub pool: Arc<WorkerPool>,
    /// Per-server backup throughput bucket.
    pub backup_bucket: Arc<TokenBucket>,
    /// Global network throughput bucket.
    pub network_bucket: Arc<TokenBucket>,
}

impl StageEnv {
    /// Final backup directory for this server.
    pub fn backup_root(&self) -> PathBuf {
        crate::backup_dir(&self.config.base_dir, &self.server.name)
    }

    /// WAL directory for this server.
    pub fn wal_root(&self) -> PathBuf {
        crate::wal_dir(&self.config.base_dir, &self.server.name)
    }

    /// Summary directory for this server.
    pub fn summary_root(&self) -> PathBuf {
        crate::summary_dir(&self.config.base_dir, &self.server.name)
    }

    /// Scratch root for in-flight runs of this server.
    pub fn workspace_root(&self) -> PathBuf {
        self.server
            .workspace
            .clone()
            .unwrap_or_else(|| self.config.workspace.clone())
            .join(&self.server.name)
    }

    /// Workspace directory of one labeled run.
    pub fn workspace_for(&self, label: &str) -> PathBuf {
        self.workspace_root().join(label)
    }

    /// Default master key location, under `$HOME`.
    pub fn master_key_path(&self) -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".pgharbor").join("master.key")
    }
}

/// Record a stage's elapsed seconds into the context.
pub fn record_elapsed(ctx: &mut RunContext, phase: &str, started: std::time::Instant) {
    ctx.set(
        &format!("{}{}", keys::ELAPSED_PREFIX, phase),
        Value::Double(started.elapsed().as_secs_f64()),
    );
}

/// Manifest carried through the context.
#[derive(Debug)]
pub struct ManifestValue(pub Manifest);

impl ObjectValue for ManifestValue {
    fn describe(&self) -> String {
        format!("manifest[{} files]", self.0.files.len())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Manifest entry list carried through the context while it accumulates.
#[derive(Debug)]
pub struct EntriesValue(pub Vec<ManifestFile>);

impl ObjectValue for EntriesValue {
    fn describe(&self) -> String {
        format!("entries[{}]", self.0.len())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Fetch the manifest stored under a context key.
pub fn manifest_from(ctx: &RunContext, key: &str) -> Option<Manifest> {
    ctx.get(key)
        .and_then(|v| v.as_object::<ManifestValue>())
        .map(|m| m.0.clone())
}
