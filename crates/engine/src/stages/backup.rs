//! Backup pipeline stages.
//!
//! Assembled order: authenticate → manifest read → basebackup →
//! extra-files copy → checksum → manifest verify → compress → encrypt →
//! link → remote-ship → permissions → cleanup. The basebackup writes into
//! a per-run workspace; cleanup publishes the finished artifact into the
//! server's backup directory and its teardown deletes whatever never got
//! published.

use crate::cipher::{self, Cipher};
use crate::codec::{self, Codec};
use crate::info::{BackupInfo, Validity};
use crate::linkage::{tree_files, tree_size};
use crate::manifest::{digest_hex, Manifest, ManifestFile, WalRange};
use crate::stages::{keys, manifest_from, record_elapsed, EntriesValue, ManifestValue, StageEnv};
use crate::storage::remote_stores;
use parking_lot::Mutex;
use pgharbor_config::Encryption;
use pgharbor_core::{Error, Result, Value};
use pgharbor_workflow::{RunContext, Stage, Workflow};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Manifest entry checksum algorithm for new backups.
const HASH_ALGO: &str = "sha512";

fn pool_failure(what: &str) -> Error {
    Error::io(
        what,
        std::io::Error::other("one or more worker jobs failed"),
    )
}

/// Assemble the backup workflow for the configured storage engines.
///
/// With a parent and `incremental`, unchanged files are omitted from the
/// artifact; with a parent and full mode, everything is stored and the
/// link stage deduplicates afterwards.
pub fn backup_workflow(
    env: Arc<StageEnv>,
    label: String,
    parent: Option<String>,
    incremental: bool,
) -> Workflow {
    let mut workflow = Workflow::new();
    workflow.push(Box::new(AuthenticateStage { env: env.clone() }));
    workflow.push(Box::new(ManifestReadStage {
        env: env.clone(),
        label: label.clone(),
        parent,
    }));
    workflow.push(Box::new(BasebackupStage {
        env: env.clone(),
        incremental,
    }));
    workflow.push(Box::new(ExtraFilesStage { env: env.clone() }));
    workflow.push(Box::new(ChecksumStage { env: env.clone() }));
    workflow.push(Box::new(ManifestVerifyStage { env: env.clone() }));
    workflow.push(Box::new(CompressStage { env: env.clone() }));
    workflow.push(Box::new(EncryptStage { env: env.clone() }));
    workflow.push(Box::new(LinkStage { env: env.clone() }));
    workflow.push(Box::new(RemoteShipStage { env: env.clone() }));
    workflow.push(Box::new(PermissionsStage { env: env.clone() }));
    workflow.push(Box::new(CleanupStage { env }));
    workflow
}

/// Verifies the upstream identity and the local key material.
pub struct AuthenticateStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for AuthenticateStage {
    fn name(&self) -> &str {
        "authenticate"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let info = self.env.upstream.identify()?;
        ctx.set_u64(keys::SYSTEM_ID, info.system_id);
        ctx.set_u64(keys::MAJOR_VERSION, info.major_version as u64);
        ctx.set_u64(keys::MINOR_VERSION, info.minor_version as u64);

        if self.env.config.encryption != Encryption::None {
            // Fail before any data moves when the key is absent.
            cipher::load_master_key(&self.env.master_key_path())?;
        }
        Ok(())
    }
}

/// Loads the parent manifest for incremental runs and stamps the label.
pub struct ManifestReadStage {
    pub(crate) env: Arc<StageEnv>,
    pub(crate) label: String,
    pub(crate) parent: Option<String>,
}

impl Stage for ManifestReadStage {
    fn name(&self) -> &str {
        "manifest read"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        ctx.set_str(keys::LABEL, self.label.clone());
        if let Some(parent) = &self.parent {
            let parent_dir = self.env.backup_root().join(parent);
            let parent_info = BackupInfo::load(&parent_dir)?;
            if parent_info.validity != Validity::Valid {
                return Err(Error::config(format!(
                    "parent backup '{}' is not valid",
                    parent
                )));
            }
            let manifest = Manifest::load(&parent_dir)?;
            ctx.set_str(keys::PARENT, parent.clone());
            ctx.set(
                keys::PARENT_MANIFEST,
                Value::Object(Box::new(ManifestValue(manifest))),
            );
        }
        Ok(())
    }
}

/// Streams the cluster files into the workspace.
///
/// Incremental runs skip files whose checksum matches the parent manifest;
/// the collected entry list still covers the complete file set.
pub struct BasebackupStage {
    pub(crate) env: Arc<StageEnv>,
    pub(crate) incremental: bool,
}

impl Stage for BasebackupStage {
    fn name(&self) -> &str {
        "basebackup"
    }

    fn setup(&mut self, ctx: &mut RunContext) -> Result<Vec<Box<dyn Stage>>> {
        let label = ctx
            .get_str(keys::LABEL)
            .ok_or_else(|| Error::format("backup label missing from context"))?;
        let data_dir = self.env.workspace_for(label).join("data");
        std::fs::create_dir_all(&data_dir).map_err(|e| Error::io(&data_dir, e))?;
        Ok(Vec::new())
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx
            .get_str(keys::LABEL)
            .ok_or_else(|| Error::format("backup label missing from context"))?
            .to_string();
        let data_dir = self.env.workspace_for(&label).join("data");

        let start = self.env.upstream.start_backup(&label)?;
        ctx.set_lsn(keys::START_LSN, start.start_lsn);
        ctx.set_lsn(keys::CHECKPOINT_LSN, start.checkpoint_lsn);
        ctx.set_u64(keys::START_TIMELINE, start.timeline as u64);

        let parent_manifest = if self.incremental {
            manifest_from(ctx, keys::PARENT_MANIFEST)
        } else {
            None
        };
        ctx.set_bool(keys::INCREMENTAL, parent_manifest.is_some());
        let files = self.env.upstream.list_files()?;
        let entries: Arc<Mutex<Vec<ManifestFile>>> = Arc::new(Mutex::new(Vec::new()));

        self.env.pool.begin_batch();
        for file in files {
            let upstream = self.env.upstream.clone();
            let bucket = self.env.backup_bucket.clone();
            let entries = entries.clone();
            let parent_entry = parent_manifest
                .as_ref()
                .and_then(|m| m.file(&file.path).cloned());
            let data_dir = data_dir.clone();
            self.env.pool.submit(format!("base:{}", file.path), move |job| {
                if job.stop_requested() {
                    return Err(Error::Canceled);
                }
                bucket.consume(file.size, job.stop_flag())?;
                let bytes = upstream.read_file(&file.path)?;
                let checksum = digest_hex(HASH_ALGO, &bytes)?;

                let unchanged = parent_entry
                    .as_ref()
                    .map(|p| p.checksum == checksum && p.size == bytes.len() as u64)
                    .unwrap_or(false);
                if !unchanged {
                    let dest = data_dir.join(&file.path);
                    if let Some(dir) = dest.parent() {
                        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
                    }
                    std::fs::write(&dest, &bytes).map_err(|e| Error::io(&dest, e))?;
                }

                entries.lock().push(ManifestFile {
                    path: file.path,
                    size: bytes.len() as u64,
                    last_modified: chrono::Utc::now().timestamp(),
                    checksum_algo: HASH_ALGO.to_string(),
                    checksum,
                });
                Ok(())
            });
        }
        self.env.pool.join_all();
        if !self.env.pool.outcome() {
            return Err(pool_failure("basebackup"));
        }

        let mut collected = Arc::try_unwrap(entries)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        collected.sort_by(|a, b| a.path.cmp(&b.path));
        ctx.set(
            keys::ENTRIES,
            Value::Object(Box::new(EntriesValue(collected))),
        );

        let end = self.env.upstream.stop_backup()?;
        ctx.set_lsn(keys::END_LSN, end.end_lsn);
        ctx.set_u64(keys::END_TIMELINE, end.end_timeline as u64);

        record_elapsed(ctx, "basebackup", started);
        Ok(())
    }
}

/// Copies the configured extra files alongside the data directory.
pub struct ExtraFilesStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for ExtraFilesStage {
    fn name(&self) -> &str {
        "extra-files copy"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        if self.env.server.extra.is_empty() {
            return Ok(());
        }
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let extra_dir = self.env.workspace_for(&label).join("extra");
        std::fs::create_dir_all(&extra_dir).map_err(|e| Error::io(&extra_dir, e))?;

        for source in &self.env.server.extra {
            let Some(name) = source.file_name() else {
                continue;
            };
            if let Err(e) = std::fs::copy(source, extra_dir.join(name)) {
                // Extra files are a convenience; a missing one is not fatal.
                warn!(
                    target: "pgharbor::engine",
                    file = %source.display(),
                    error = %e,
                    "extra file skipped"
                );
            }
        }
        Ok(())
    }
}

/// Materializes the manifest from the collected entries.
pub struct ChecksumStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for ChecksumStage {
    fn name(&self) -> &str {
        "checksum"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let entries = ctx
            .get(keys::ENTRIES)
            .and_then(|v| v.as_object::<EntriesValue>())
            .ok_or_else(|| Error::format("manifest entries missing from context"))?;

        let mut manifest = Manifest::new(ctx.get_u64(keys::SYSTEM_ID).unwrap_or(0));
        manifest.files = entries.0.clone();
        manifest.wal_range = Some(WalRange {
            start_lsn: ctx.get_lsn(keys::START_LSN).unwrap_or_default(),
            end_lsn: ctx.get_lsn(keys::END_LSN).unwrap_or_default(),
            start_tli: ctx.get_u64(keys::START_TIMELINE).unwrap_or(1) as u32,
        });

        let workspace = self.env.workspace_for(&label);
        manifest.write(&workspace)?;
        ctx.set_u64(keys::RESTORE_SIZE, manifest.total_size());
        ctx.set(
            keys::MANIFEST,
            Value::Object(Box::new(ManifestValue(manifest))),
        );
        record_elapsed(ctx, "manifest", started);
        Ok(())
    }
}

/// Verifies the workspace contents against the manifest.
///
/// Files an incremental run skipped must match the parent manifest.
pub struct ManifestVerifyStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for ManifestVerifyStage {
    fn name(&self) -> &str {
        "manifest verify"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let data_dir = self.env.workspace_for(&label).join("data");
        let manifest = manifest_from(ctx, keys::MANIFEST)
            .ok_or_else(|| Error::format("manifest missing from context"))?;
        let parent = manifest_from(ctx, keys::PARENT_MANIFEST);

        for entry in &manifest.files {
            let local = data_dir.join(&entry.path);
            if local.exists() {
                let data = std::fs::read(&local).map_err(|e| Error::io(&local, e))?;
                if data.len() as u64 != entry.size
                    || digest_hex(&entry.checksum_algo, &data)? != entry.checksum
                {
                    return Err(Error::corruption(format!(
                        "workspace copy of '{}' does not match its manifest entry",
                        entry.path
                    )));
                }
            } else {
                let covered = parent
                    .as_ref()
                    .and_then(|p| p.file(&entry.path))
                    .map(|p| p.checksum == entry.checksum)
                    .unwrap_or(false);
                if !covered {
                    return Err(Error::corruption(format!(
                        "file '{}' is neither in the workspace nor covered by the parent",
                        entry.path
                    )));
                }
            }
        }
        record_elapsed(ctx, "verify", started);
        Ok(())
    }
}

fn transform_tree(
    root: &Path,
    env: &StageEnv,
    suffix: &str,
    transform: Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>,
) -> Result<()> {
    let files = tree_files(root)?;
    env.pool.begin_batch();
    for rel in files {
        let from = root.join(&rel);
        let to = root.join(format!("{}.{}", rel, suffix));
        let transform = transform.clone();
        env.pool.submit(format!("transform:{}", rel), move |job| {
            if job.stop_requested() {
                return Err(Error::Canceled);
            }
            let data = std::fs::read(&from).map_err(|e| Error::io(&from, e))?;
            let out = transform(&data)?;
            std::fs::write(&to, out).map_err(|e| Error::io(&to, e))?;
            std::fs::remove_file(&from).map_err(|e| Error::io(&from, e))?;
            Ok(())
        });
    }
    env.pool.join_all();
    if !env.pool.outcome() {
        return Err(pool_failure("transform"));
    }
    Ok(())
}

/// Compresses every workspace artifact with the configured codec.
pub struct CompressStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for CompressStage {
    fn name(&self) -> &str {
        "compress"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let codec = codec::for_compression(
            self.env.config.compression,
            self.env.config.compression_level,
        )?;
        if codec.suffix().is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let data_dir = self.env.workspace_for(&label).join("data");

        let codec: Arc<dyn Codec> = Arc::from(codec);
        let inner = codec.clone();
        transform_tree(
            &data_dir,
            &self.env,
            codec.suffix(),
            Arc::new(move |data| inner.encode(data)),
        )?;
        record_elapsed(ctx, &format!("compression_{}", codec.name()), started);
        Ok(())
    }
}

/// Encrypts every workspace artifact with the configured cipher.
pub struct EncryptStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for EncryptStage {
    fn name(&self) -> &str {
        "encrypt"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        if self.env.config.encryption == Encryption::None {
            return Ok(());
        }
        let started = Instant::now();
        let cipher = cipher::for_encryption(
            self.env.config.encryption,
            &self.env.master_key_path(),
        )?;
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let data_dir = self.env.workspace_for(&label).join("data");

        let cipher: Arc<dyn Cipher> = Arc::from(cipher);
        let inner = cipher.clone();
        transform_tree(
            &data_dir,
            &self.env,
            cipher.suffix(),
            Arc::new(move |data| inner.encrypt(data)),
        )?;
        record_elapsed(ctx, "encryption", started);
        Ok(())
    }
}

/// Deduplicates stored artifacts against the parent backup by hard link.
///
/// Only applies when the parent used the same compression and neither side
/// is encrypted (random IVs make encrypted artifacts incomparable). Link
/// failures degrade to the already-written copy with a warning; this stage
/// never fails the run.
pub struct LinkStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for LinkStage {
    fn name(&self) -> &str {
        "link"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let Some(parent_label) = ctx.get_str(keys::PARENT).map(str::to_string) else {
            return Ok(());
        };
        if self.env.config.encryption != Encryption::None {
            return Ok(());
        }
        let started = Instant::now();

        let parent_dir = self.env.backup_root().join(&parent_label);
        let parent_info = match BackupInfo::load(&parent_dir) {
            Ok(info) => info,
            Err(e) => {
                warn!(target: "pgharbor::engine", error = %e, "link skipped: parent unreadable");
                return Ok(());
            }
        };
        let codec = match codec::for_compression(
            self.env.config.compression,
            self.env.config.compression_level,
        ) {
            Ok(codec) => codec,
            Err(_) => return Ok(()),
        };
        if parent_info.compression != codec.name() || parent_info.encryption != "none" {
            return Ok(());
        }

        let (Some(manifest), Some(parent_manifest)) = (
            manifest_from(ctx, keys::MANIFEST),
            manifest_from(ctx, keys::PARENT_MANIFEST),
        ) else {
            return Ok(());
        };

        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let data_dir = self.env.workspace_for(&label).join("data");
        let suffix = codec.suffix();
        let stored = |rel: &str| {
            if suffix.is_empty() {
                rel.to_string()
            } else {
                format!("{}.{}", rel, suffix)
            }
        };

        let mut linked = 0u64;
        for entry in &manifest.files {
            let matches_parent = parent_manifest
                .file(&entry.path)
                .map(|p| p.checksum == entry.checksum)
                .unwrap_or(false);
            if !matches_parent {
                continue;
            }
            let ours = data_dir.join(stored(&entry.path));
            let theirs = parent_dir.join("data").join(stored(&entry.path));
            if !ours.exists() || !theirs.exists() {
                continue;
            }
            if std::fs::remove_file(&ours)
                .and_then(|_| std::fs::hard_link(&theirs, &ours))
                .is_ok()
            {
                linked += 1;
            } else if let Err(e) = std::fs::copy(&theirs, &ours) {
                warn!(
                    target: "pgharbor::engine",
                    path = %entry.path,
                    error = %e,
                    "link dedup failed"
                );
            }
        }
        if linked > 0 {
            info!(target: "pgharbor::engine", linked, "deduplicated against parent");
        }
        record_elapsed(ctx, "linking", started);
        Ok(())
    }
}

/// Ships the workspace tree to every configured remote store.
pub struct RemoteShipStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for RemoteShipStage {
    fn name(&self) -> &str {
        "remote-ship"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let stores = remote_stores(&self.env.config)?;
        if stores.is_empty() {
            return Ok(());
        }
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = self.env.workspace_for(&label);
        let files = tree_files(&workspace)?;
        let stop = std::sync::atomic::AtomicBool::new(false);

        for store in stores {
            let started = Instant::now();
            for rel in &files {
                let from = workspace.join(rel);
                let data = std::fs::read(&from).map_err(|e| Error::io(&from, e))?;
                self.env
                    .network_bucket
                    .consume(data.len() as u64, &stop)?;
                let remote = Path::new(&self.env.server.name)
                    .join("backup")
                    .join(&label)
                    .join(rel);
                // Remote partials are left in place on failure; re-shipping
                // the same label overwrites them.
                store.put(&remote, &data)?;
            }
            record_elapsed(ctx, &format!("remote_{}", store.name()), started);
        }
        Ok(())
    }
}

/// Tightens permissions on the finished workspace tree.
pub struct PermissionsStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for PermissionsStage {
    fn name(&self) -> &str {
        "permissions"
    }

    #[cfg(unix)]
    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        fn tighten(dir: &Path) -> Result<()> {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .map_err(|e| Error::io(dir, e))?;
            let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io(dir, e))?;
                let path = entry.path();
                if entry.file_type().map_err(|e| Error::io(&path, e))?.is_dir() {
                    tighten(&path)?;
                } else {
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                        .map_err(|e| Error::io(&path, e))?;
                }
            }
            Ok(())
        }

        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        tighten(&self.env.workspace_for(&label))
    }

    #[cfg(not(unix))]
    fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }
}

/// Publishes the workspace into the backup directory and cleans up.
pub struct CleanupStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for CleanupStage {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let label = ctx
            .get_str(keys::LABEL)
            .ok_or_else(|| Error::format("backup label missing from context"))?
            .to_string();
        let workspace = self.env.workspace_for(&label);

        let codec = codec::for_compression(
            self.env.config.compression,
            self.env.config.compression_level,
        )?;

        let mut backup_info = BackupInfo::new(&label);
        backup_info.validity = Validity::Valid;
        backup_info.major_version = ctx.get_u64(keys::MAJOR_VERSION).unwrap_or(0) as u32;
        backup_info.minor_version = ctx.get_u64(keys::MINOR_VERSION).unwrap_or(0) as u32;
        backup_info.start_lsn = ctx.get_lsn(keys::START_LSN).unwrap_or_default();
        backup_info.checkpoint_lsn = ctx.get_lsn(keys::CHECKPOINT_LSN).unwrap_or_default();
        backup_info.end_lsn = ctx.get_lsn(keys::END_LSN).unwrap_or_default();
        backup_info.start_timeline = ctx.get_u64(keys::START_TIMELINE).unwrap_or(1) as u32;
        backup_info.end_timeline = ctx.get_u64(keys::END_TIMELINE).unwrap_or(1) as u32;
        backup_info.restore_size = ctx.get_u64(keys::RESTORE_SIZE).unwrap_or(0);
        backup_info.backup_size = tree_size(&workspace)?;
        // Only an incremental run depends on its parent for restore; a
        // full run's parent is just the link-dedup reference.
        backup_info.parent = if ctx.get_bool(keys::INCREMENTAL).unwrap_or(false) {
            ctx.get_str(keys::PARENT).map(str::to_string)
        } else {
            None
        };
        backup_info.compression = codec.name().to_string();
        backup_info.encryption = self.env.config.encryption.as_str().to_string();
        backup_info.hash_algo = HASH_ALGO.to_string();
        for (key, value) in ctx.iter() {
            if let Some(phase) = key.strip_prefix(keys::ELAPSED_PREFIX) {
                if let Some(seconds) = value.as_f64() {
                    backup_info.elapsed.insert(phase.to_string(), seconds);
                }
            }
        }
        backup_info.write(&workspace)?;
        ctx.set_u64(keys::BACKUP_SIZE, backup_info.backup_size);

        // The ship stage ran before the metadata existed; remote copies
        // get it now so a remote-only restore can walk the chain.
        for store in remote_stores(&self.env.config)? {
            let remote = Path::new(&self.env.server.name)
                .join("backup")
                .join(&label)
                .join(crate::info::INFO_FILE);
            store.put(&remote, backup_info.serialize().as_bytes())?;
        }

        let final_dir = self.env.backup_root().join(&label);
        if let Some(parent) = final_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        if std::fs::rename(&workspace, &final_dir).is_err() {
            // Workspace on a different filesystem: copy then remove.
            crate::linkage::copy_tree(&workspace, &final_dir)?;
            std::fs::remove_dir_all(&workspace).map_err(|e| Error::io(&workspace, e))?;
        }
        ctx.set_bool(keys::PUBLISHED, true);
        info!(
            target: "pgharbor::engine",
            server = %self.env.server.name,
            label = %label,
            size = backup_info.backup_size,
            "backup published"
        );
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.get_bool(keys::PUBLISHED).unwrap_or(false) {
            return Ok(());
        }
        // The run failed somewhere: partial workspace artifacts go away.
        if let Some(label) = ctx.get_str(keys::LABEL) {
            let workspace = self.env.workspace_for(label);
            if workspace.exists() {
                if let Err(e) = std::fs::remove_dir_all(&workspace) {
                    warn!(
                        target: "pgharbor::engine",
                        workspace = %workspace.display(),
                        error = %e,
                        "failed to remove partial workspace"
                    );
                }
            }
        }
        Ok(())
    }
}
