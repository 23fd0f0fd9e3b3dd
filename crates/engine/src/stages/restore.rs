//! Restore pipeline stages.
//!
//! Assembled order: manifest read → fetch → decrypt → decompress → relink
//! → recovery-info → permissions. The chain members are fetched into a
//! restore workspace, undone transform by transform, and combined into the
//! target data directory; the newest manifest dictates the file set and
//! every byte is re-checksummed on the way out.

use crate::cipher;
use crate::codec;
use crate::combine::{combine_chain, resolve_chain};
use crate::info::BackupInfo;
use crate::stages::{keys, record_elapsed, StageEnv};
use crate::storage::remote_stores;
use pgharbor_core::{Error, Result, Value};
use pgharbor_workflow::{RunContext, Stage, Workflow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Assemble the restore workflow.
pub fn restore_workflow(env: Arc<StageEnv>, label: String, target: PathBuf) -> Workflow {
    let mut workflow = Workflow::new();
    workflow.push(Box::new(RestoreManifestStage {
        env: env.clone(),
        label,
        target,
    }));
    workflow.push(Box::new(FetchStage { env: env.clone() }));
    workflow.push(Box::new(DecryptStage { env: env.clone() }));
    workflow.push(Box::new(DecompressStage { env: env.clone() }));
    workflow.push(Box::new(RelinkStage { env: env.clone() }));
    workflow.push(Box::new(RecoveryInfoStage { env: env.clone() }));
    workflow.push(Box::new(RestorePermissionsStage { env }));
    workflow
}

fn restore_workspace(env: &StageEnv, label: &str) -> PathBuf {
    env.workspace_root().join(format!("restore-{}", label))
}

fn chain_labels(ctx: &RunContext) -> Result<Vec<String>> {
    match ctx.get(keys::RESTORE_CHAIN) {
        Some(Value::StringArray(labels)) => Ok(labels.clone()),
        _ => Err(Error::format("restore chain missing from context")),
    }
}

/// Resolves the backup chain for the requested label.
pub struct RestoreManifestStage {
    pub(crate) env: Arc<StageEnv>,
    pub(crate) label: String,
    pub(crate) target: PathBuf,
}

impl Stage for RestoreManifestStage {
    fn name(&self) -> &str {
        "manifest read"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        ctx.set_str(keys::LABEL, self.label.clone());
        ctx.set_str(
            keys::RESTORE_TARGET,
            self.target.to_string_lossy().to_string(),
        );

        // Missing locally but present remotely: pull the chain down first.
        fetch_remote_chain(&self.env, &self.label)?;

        let chain = resolve_chain(&self.env.backup_root(), &self.label)?;
        let labels: Vec<String> = chain
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        ctx.set(keys::RESTORE_CHAIN, Value::StringArray(labels));
        Ok(())
    }
}

/// Pull any chain members absent locally from the first remote store that
/// has them.
fn fetch_remote_chain(env: &StageEnv, label: &str) -> Result<()> {
    let stores = remote_stores(&env.config)?;
    if stores.is_empty() {
        return Ok(());
    }
    let mut next = Some(label.to_string());
    while let Some(current) = next.take() {
        let local = env.backup_root().join(&current);
        if !local.exists() {
            let prefix = Path::new(&env.server.name).join("backup").join(&current);
            let mut fetched = false;
            for store in &stores {
                let files = store.list(&prefix)?;
                if files.is_empty() {
                    continue;
                }
                for rel in files {
                    let data = store.get(Path::new(&rel))?;
                    let strip = Path::new(&rel)
                        .strip_prefix(Path::new(&env.server.name).join("backup"))
                        .map_err(|_| Error::format("remote path outside the backup prefix"))?
                        .to_path_buf();
                    let dest = env.backup_root().join(strip);
                    if let Some(dir) = dest.parent() {
                        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
                    }
                    std::fs::write(&dest, data).map_err(|e| Error::io(&dest, e))?;
                }
                fetched = true;
                break;
            }
            if !fetched {
                return Err(Error::transport(format!(
                    "backup '{}' is on no configured store",
                    current
                )));
            }
        }
        next = BackupInfo::load(&env.backup_root().join(&current))?.parent;
    }
    Ok(())
}

/// Copies every chain member into the restore workspace.
pub struct FetchStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for FetchStage {
    fn name(&self) -> &str {
        "fetch"
    }

    fn setup(&mut self, ctx: &mut RunContext) -> Result<Vec<Box<dyn Stage>>> {
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);
        std::fs::create_dir_all(&workspace).map_err(|e| Error::io(&workspace, e))?;
        Ok(Vec::new())
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);

        for member in chain_labels(ctx)? {
            let from = self.env.backup_root().join(&member);
            let to = workspace.join(&member);
            crate::dio::copy_tree(&from, &to, crate::dio::DioMode::Auto)?;
        }
        record_elapsed(ctx, "fetch", started);
        Ok(())
    }

    fn teardown(&mut self, ctx: &mut RunContext) -> Result<()> {
        // The restore workspace is scratch either way.
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);
        if workspace.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workspace) {
                warn!(
                    target: "pgharbor::engine",
                    workspace = %workspace.display(),
                    error = %e,
                    "failed to remove restore workspace"
                );
            }
        }
        Ok(())
    }
}

fn undo_suffix_tree(
    env: &StageEnv,
    dir: &Path,
    suffix: &str,
    undo: Arc<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>,
) -> Result<()> {
    let files = crate::linkage::tree_files(dir)?;
    env.pool.begin_batch();
    for rel in files {
        let Some(stripped) = rel.strip_suffix(&format!(".{}", suffix)) else {
            continue;
        };
        let from = dir.join(&rel);
        let to = dir.join(stripped);
        let undo = undo.clone();
        env.pool.submit(format!("undo:{}", rel), move |job| {
            if job.stop_requested() {
                return Err(Error::Canceled);
            }
            let data = std::fs::read(&from).map_err(|e| Error::io(&from, e))?;
            let out = undo(&data)?;
            std::fs::write(&to, out).map_err(|e| Error::io(&to, e))?;
            std::fs::remove_file(&from).map_err(|e| Error::io(&from, e))?;
            Ok(())
        });
    }
    env.pool.join_all();
    if !env.pool.outcome() {
        return Err(Error::io(
            dir,
            std::io::Error::other("one or more restore jobs failed"),
        ));
    }
    Ok(())
}

/// Strips the `.aes` layer from fetched artifacts.
pub struct DecryptStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for DecryptStage {
    fn name(&self) -> &str {
        "decrypt"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);

        for member in chain_labels(ctx)? {
            let dir = workspace.join(&member);
            let info = BackupInfo::load(&dir)?;
            let encryption: pgharbor_config::Encryption = info.encryption.parse()?;
            if encryption == pgharbor_config::Encryption::None {
                continue;
            }
            let cipher = cipher::for_encryption(encryption, &self.env.master_key_path())?;
            let cipher: Arc<dyn crate::cipher::Cipher> = Arc::from(cipher);
            let inner = cipher.clone();
            undo_suffix_tree(
                &self.env,
                &dir.join("data"),
                cipher.suffix(),
                Arc::new(move |data| inner.decrypt(data)),
            )?;
        }
        record_elapsed(ctx, "decrypt", started);
        Ok(())
    }
}

/// Strips the compression layer from fetched artifacts.
pub struct DecompressStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for DecompressStage {
    fn name(&self) -> &str {
        "decompress"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);

        for member in chain_labels(ctx)? {
            let dir = workspace.join(&member);
            let info = BackupInfo::load(&dir)?;
            if info.compression == "none" {
                continue;
            }
            let codec = match info.compression.as_str() {
                "gzip" => codec::for_suffix("gz")?,
                other => codec::for_suffix(other)?,
            };
            let codec: Arc<dyn crate::codec::Codec> = Arc::from(codec);
            let inner = codec.clone();
            undo_suffix_tree(
                &self.env,
                &dir.join("data"),
                codec.suffix(),
                Arc::new(move |data| inner.decode(data)),
            )?;
        }
        record_elapsed(ctx, "decompress", started);
        Ok(())
    }
}

/// Combines the chain into the target data directory.
pub struct RelinkStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for RelinkStage {
    fn name(&self) -> &str {
        "relink"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let label = ctx.get_str(keys::LABEL).unwrap_or_default().to_string();
        let workspace = restore_workspace(&self.env, &label);
        let target = PathBuf::from(
            ctx.get_str(keys::RESTORE_TARGET)
                .ok_or_else(|| Error::format("restore target missing from context"))?,
        );

        let chain: Vec<PathBuf> = chain_labels(ctx)?
            .iter()
            .map(|member| workspace.join(member))
            .collect();
        combine_chain(&chain, &target)?;

        record_elapsed(ctx, "relink", started);
        info!(
            target: "pgharbor::engine",
            label = %label,
            target = %target.display(),
            "restore combined"
        );
        Ok(())
    }
}

/// Drops recovery control files into the restored directory.
pub struct RecoveryInfoStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for RecoveryInfoStage {
    fn name(&self) -> &str {
        "recovery-info"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let target = PathBuf::from(
            ctx.get_str(keys::RESTORE_TARGET)
                .ok_or_else(|| Error::format("restore target missing from context"))?,
        );
        let signal = target.join("recovery.signal");
        std::fs::write(&signal, b"").map_err(|e| Error::io(&signal, e))?;

        let wal_root = self.env.wal_root();
        let auto_conf = target.join("postgresql.auto.conf");
        let line = format!(
            "# added by pgharbor restore\nrestore_command = 'cp {}/%f %p'\n",
            wal_root.display()
        );
        let mut existing = std::fs::read_to_string(&auto_conf).unwrap_or_default();
        existing.push_str(&line);
        std::fs::write(&auto_conf, existing).map_err(|e| Error::io(&auto_conf, e))?;
        Ok(())
    }
}

/// Tightens permissions on the restored directory.
pub struct RestorePermissionsStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for RestorePermissionsStage {
    fn name(&self) -> &str {
        "permissions"
    }

    #[cfg(unix)]
    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let _ = &self.env;
        let target = PathBuf::from(
            ctx.get_str(keys::RESTORE_TARGET)
                .ok_or_else(|| Error::format("restore target missing from context"))?,
        );
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io(&target, e))
    }

    #[cfg(not(unix))]
    fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }
}
