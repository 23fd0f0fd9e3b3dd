//! High-level operations.
//!
//! Each management command maps onto one function here: assemble the
//! workflow for the configured engines, run it against a fresh context,
//! and distill the result. The supervisor calls these under the per-server
//! busy-flag guard.

use crate::cipher;
use crate::codec;
use crate::hot_standby;
use crate::info::{generate_label, BackupInfo, Validity};
use crate::manifest::{digest_hex, Manifest};
use crate::stages::backup::backup_workflow;
use crate::stages::restore::restore_workflow;
use crate::stages::retention::retention_workflow;
use crate::stages::{keys, StageEnv};
use crate::upstream::Upstream;
use crate::walship::WalShipper;
use pgharbor_config::{Config, ServerConfig};
use pgharbor_core::{Error, Result, Value};
use pgharbor_workflow::{RunContext, TokenBucket, WorkerPool};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the per-run stage environment for a server.
pub fn stage_env(
    config: Arc<Config>,
    server: &ServerConfig,
    upstream: Arc<dyn Upstream>,
) -> Arc<StageEnv> {
    let workers = config.effective_workers(server);
    let backup_rate = config.effective_backup_max_rate(server);
    let network_rate = server.network_max_rate.unwrap_or(config.network_max_rate);
    Arc::new(StageEnv {
        config,
        server: server.clone(),
        upstream,
        pool: Arc::new(WorkerPool::new(workers)),
        backup_bucket: Arc::new(TokenBucket::new(backup_rate, backup_rate)),
        network_bucket: Arc::new(TokenBucket::new(network_rate, network_rate)),
    })
}

/// Outcome of one backup run.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// The published backup's metadata.
    pub info: BackupInfo,
}

/// Take a backup. `incremental` stores only changes against the newest
/// valid backup; without one it degrades to a full backup.
pub fn run_backup(env: Arc<StageEnv>, incremental: bool) -> Result<BackupOutcome> {
    let label = generate_label(chrono::Utc::now());
    let parent = hot_standby::newest_valid_backup(&env.backup_root())?.map(|(label, _)| label);
    let incremental = incremental && parent.is_some();

    let mut workflow = backup_workflow(env.clone(), label.clone(), parent, incremental);
    let mut ctx = RunContext::new();
    workflow.run(&mut ctx)?;

    let info = BackupInfo::load(&env.backup_root().join(&label))?;

    // Keep the configured hot standbys current.
    for target in env.server.hot_standby.clone() {
        refresh_hot_standby(env.clone(), &label, &target)?;
    }
    Ok(BackupOutcome { info })
}

/// Restore a backup (and its chain) into a target directory.
pub fn run_restore(env: Arc<StageEnv>, label: &str, target: &Path) -> Result<()> {
    let mut workflow = restore_workflow(env, label.to_string(), target.to_path_buf());
    let mut ctx = RunContext::new();
    workflow.run(&mut ctx)
}

fn refresh_hot_standby(env: Arc<StageEnv>, label: &str, target: &Path) -> Result<()> {
    let staging = env
        .workspace_root()
        .join(format!("standby-{}", label));
    let result = run_restore(env.clone(), label, &staging)
        .and_then(|_| hot_standby::materialize(&staging, &env.wal_root(), target));
    if staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result
}

/// Report of one retention sweep.
#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    /// Labels that survived.
    pub survivors: Vec<String>,
    /// Labels deleted.
    pub deleted: Vec<String>,
    /// Labels whose deletion failed (isolated).
    pub failed: Vec<String>,
}

/// Run one retention sweep.
pub fn run_retention(env: Arc<StageEnv>) -> Result<RetentionReport> {
    let mut workflow = retention_workflow(env);
    let mut ctx = RunContext::new();
    workflow.run(&mut ctx)?;

    let strings = |key: &str| match ctx.get(key) {
        Some(Value::StringArray(values)) => values.clone(),
        _ => Vec::new(),
    };
    let failed = strings(keys::RETENTION_FAILED);
    let deleted = strings(keys::RETENTION_LOSERS)
        .into_iter()
        .filter(|l| !failed.contains(l))
        .collect();
    Ok(RetentionReport {
        survivors: strings(keys::RETENTION_SURVIVORS),
        deleted,
        failed,
    })
}

/// Verify a backup's stored artifacts against its manifest.
///
/// Each stored file is read, decrypted and decompressed as its metadata
/// dictates, and compared to the manifest checksum. Files an incremental
/// backup omitted are checked on its ancestors by the chain walk in
/// restore; here only present files are verified.
pub fn run_verify(env: &StageEnv, label: &str) -> Result<()> {
    let dir = env.backup_root().join(label);
    let info = BackupInfo::load(&dir)?;
    let manifest = Manifest::load(&dir)?;

    let encryption: pgharbor_config::Encryption = info.encryption.parse()?;
    let cipher = cipher::for_encryption(encryption, &env.master_key_path())?;
    let codec = match info.compression.as_str() {
        "none" => codec::for_suffix("")?,
        "gzip" => codec::for_suffix("gz")?,
        other => codec::for_suffix(other)?,
    };

    let mut suffix = String::new();
    if !codec.suffix().is_empty() {
        suffix.push('.');
        suffix.push_str(codec.suffix());
    }
    if !cipher.suffix().is_empty() {
        suffix.push('.');
        suffix.push_str(cipher.suffix());
    }

    for entry in &manifest.files {
        let stored = dir.join("data").join(format!("{}{}", entry.path, suffix));
        if !stored.exists() {
            // Omitted by an incremental backup; its ancestor carries it.
            continue;
        }
        let data = std::fs::read(&stored).map_err(|e| Error::io(&stored, e))?;
        let data = cipher.decrypt(&data)?;
        let data = codec.decode(&data)?;
        if data.len() as u64 != entry.size
            || digest_hex(&entry.checksum_algo, &data)? != entry.checksum
        {
            return Err(Error::corruption(format!(
                "stored file '{}' does not match the manifest",
                entry.path
            )));
        }
    }
    Ok(())
}

/// Delete one backup by label.
///
/// A backup another backup depends on cannot be deleted.
pub fn run_delete(env: &StageEnv, label: &str) -> Result<()> {
    let root = env.backup_root();
    let dir = root.join(label);
    if !dir.exists() {
        return Err(Error::config(format!("backup '{}' does not exist", label)));
    }

    let entries = std::fs::read_dir(&root).map_err(|e| Error::io(&root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(&root, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(info) = BackupInfo::load(&entry.path()) {
            if info.parent.as_deref() == Some(label) {
                return Err(Error::config(format!(
                    "backup '{}' is the parent of '{}'",
                    label, info.label
                )));
            }
        }
    }

    std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    info!(target: "pgharbor::engine", label = %label, "backup deleted");
    Ok(())
}

/// Ship every WAL segment currently finished upstream, once.
pub fn run_archive(env: &StageEnv) -> Result<usize> {
    let codec = codec::for_compression(env.config.compression, env.config.compression_level)?;
    let cipher = cipher::for_encryption(env.config.encryption, &env.master_key_path())?;
    let shipper = WalShipper::new(
        env.upstream.clone(),
        Arc::from(codec),
        Arc::from(cipher),
        env.wal_root(),
        (!env.server.wal_shipping.as_os_str().is_empty())
            .then(|| env.server.wal_shipping.clone()),
        Duration::from_secs(env.config.blocking_timeout.max(1)),
        Arc::new(AtomicBool::new(false)),
    );
    shipper.drain()
}

/// List all backups of a server, newest first.
pub fn list_backups(env: &StageEnv) -> Result<Vec<BackupInfo>> {
    let root = env.backup_root();
    let mut infos = Vec::new();
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(&root, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(&root, e))?;
        if entry.path().is_dir() {
            if let Ok(info) = BackupInfo::load(&entry.path()) {
                infos.push(info);
            }
        }
    }
    infos.sort_by(|a, b| b.label.cmp(&a.label));
    Ok(infos)
}

/// Flip the keep flag on a backup (annotate command).
pub fn set_keep(env: &StageEnv, label: &str, keep: bool) -> Result<BackupInfo> {
    let dir = env.backup_root().join(label);
    let mut info = BackupInfo::load(&dir)?;
    info.keep = keep;
    info.write(&dir)?;
    Ok(info)
}

/// Mark a backup invalid without deleting it (expunge command).
pub fn expunge(env: &StageEnv, label: &str) -> Result<BackupInfo> {
    let dir = env.backup_root().join(label);
    let mut info = BackupInfo::load(&dir)?;
    info.validity = Validity::Invalid;
    info.write(&dir)?;
    Ok(info)
}

/// Resolve a label argument: explicit, or `newest`.
pub fn resolve_label(env: &StageEnv, label: Option<&str>) -> Result<String> {
    match label {
        Some(label) => Ok(label.to_string()),
        None => hot_standby::newest_valid_backup(&env.backup_root())?
            .map(|(label, _)| label)
            .ok_or_else(|| Error::config("no valid backup exists")),
    }
}

/// Restore workspace path helper used by callers that stage restores.
pub fn restore_staging(env: &StageEnv, label: &str) -> PathBuf {
    env.workspace_root().join(format!("restore-{}", label))
}
