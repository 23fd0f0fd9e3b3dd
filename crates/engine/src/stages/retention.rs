//! Retention pipeline stages.
//!
//! Assembled order: scan backups → compute survivors → delete losers →
//! rewrite summary. Deletion failures are isolated per backup; everything
//! else proceeds and the failures are reported in the run context.

use crate::info::BackupInfo;
use crate::retention::{
    compute_survivors, eligible_wal_files, wal_cutoff, RetentionCandidate,
};
use crate::stages::{keys, record_elapsed, StageEnv};
use pgharbor_core::{Error, Result, Value};
use pgharbor_wal::DEFAULT_SEGMENT_SIZE;
use pgharbor_workflow::{RunContext, Stage, Workflow};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Assemble the retention workflow.
pub fn retention_workflow(env: Arc<StageEnv>) -> Workflow {
    let mut workflow = Workflow::new();
    workflow.push(Box::new(ScanStage { env: env.clone() }));
    workflow.push(Box::new(ComputeStage { env: env.clone() }));
    workflow.push(Box::new(DeleteStage { env: env.clone() }));
    workflow.push(Box::new(RewriteSummaryStage { env }));
    workflow
}

fn string_array(ctx: &RunContext, key: &str) -> Vec<String> {
    match ctx.get(key) {
        Some(Value::StringArray(values)) => values.clone(),
        _ => Vec::new(),
    }
}

/// Collects retention candidates from the backup directory.
pub struct ScanStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for ScanStage {
    fn name(&self) -> &str {
        "scan backups"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let root = self.env.backup_root();
        let mut labels = Vec::new();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ctx.set(keys::RETENTION_SURVIVORS, Value::StringArray(Vec::new()));
                ctx.set(keys::RETENTION_LOSERS, Value::StringArray(Vec::new()));
                return Ok(());
            }
            Err(e) => return Err(Error::io(&root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&root, e))?;
            if entry.path().is_dir() {
                labels.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        labels.sort();
        ctx.set("retention/scanned", Value::StringArray(labels));
        Ok(())
    }
}

/// Evaluates the policy into survivors and losers.
pub struct ComputeStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for ComputeStage {
    fn name(&self) -> &str {
        "compute survivors"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let started = Instant::now();
        let root = self.env.backup_root();
        let mut candidates = Vec::new();
        for label in string_array(ctx, "retention/scanned") {
            match BackupInfo::load(&root.join(&label))
                .and_then(|info| RetentionCandidate::from_info(&info))
            {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    // Unreadable metadata never triggers deletion.
                    warn!(
                        target: "pgharbor::engine",
                        label = %label,
                        error = %e,
                        "retention skipping unreadable backup"
                    );
                }
            }
        }

        let policy = self.env.config.effective_retention(&self.env.server);
        let survivors = compute_survivors(&policy, &candidates);

        let mut survivor_list: Vec<String> = survivors.iter().cloned().collect();
        survivor_list.sort();
        let mut losers: Vec<String> = candidates
            .iter()
            .filter(|c| !survivors.contains(&c.label))
            .map(|c| c.label.clone())
            .collect();
        losers.sort();

        // WAL older than the oldest survivor's start is eligible too.
        if let Some(cutoff) = wal_cutoff(&candidates, &survivors) {
            ctx.set_lsn("retention/wal-cutoff", cutoff);
        }

        ctx.set(keys::RETENTION_SURVIVORS, Value::StringArray(survivor_list));
        ctx.set(keys::RETENTION_LOSERS, Value::StringArray(losers));
        record_elapsed(ctx, "retention_compute", started);
        Ok(())
    }
}

/// Deletes losing backups and eligible WAL, isolating per-item failures.
pub struct DeleteStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for DeleteStage {
    fn name(&self) -> &str {
        "delete losers"
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<()> {
        let root = self.env.backup_root();
        let mut failed = Vec::new();
        let losers = string_array(ctx, keys::RETENTION_LOSERS);
        for label in &losers {
            let dir = root.join(label);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!(target: "pgharbor::engine", label = %label, "backup deleted by retention");
                }
                Err(e) => {
                    warn!(
                        target: "pgharbor::engine",
                        label = %label,
                        error = %e,
                        "retention deletion failed, continuing"
                    );
                    failed.push(label.clone());
                }
            }
        }

        if let Some(cutoff) = ctx.get_lsn("retention/wal-cutoff") {
            let wal_dir = self.env.wal_root();
            for name in eligible_wal_files(&wal_dir, cutoff, DEFAULT_SEGMENT_SIZE)? {
                let path = wal_dir.join(&name);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(
                        target: "pgharbor::engine",
                        segment = %name,
                        error = %e,
                        "WAL deletion failed, continuing"
                    );
                }
            }
        }

        ctx.set(keys::RETENTION_FAILED, Value::StringArray(failed));
        Ok(())
    }
}

/// Rewrites the per-server summary listing the remaining backups.
pub struct RewriteSummaryStage {
    pub(crate) env: Arc<StageEnv>,
}

impl Stage for RewriteSummaryStage {
    fn name(&self) -> &str {
        "rewrite manifest"
    }

    fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
        let root = self.env.backup_root();
        let summary_dir = self.env.summary_root();
        std::fs::create_dir_all(&summary_dir).map_err(|e| Error::io(&summary_dir, e))?;

        let mut lines = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&root) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let label = entry.file_name().to_string_lossy().to_string();
                if let Ok(info) = BackupInfo::load(&entry.path()) {
                    lines.push(format!(
                        "{} {} {} {}",
                        label,
                        info.validity.as_str(),
                        info.backup_size,
                        info.end_lsn
                    ));
                }
            }
        }
        lines.sort();

        let path = summary_dir.join("backups.list");
        std::fs::write(&path, lines.join("\n") + "\n").map_err(|e| Error::io(&path, e))
    }
}
