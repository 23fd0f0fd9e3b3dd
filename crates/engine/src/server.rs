//! Per-server runtime state.
//!
//! Each configured server carries one busy flag per operation kind; at most
//! one backup, restore, archive, delete, and retention run concurrently per
//! server. Transitions are compare-and-set on atomics, so rejection of a
//! concurrent request never blocks. Counters and last-operation timestamps
//! are plain atomics read by the metrics renderer.

use dashmap::DashMap;
use pgharbor_core::{Error, Lsn, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Operation kinds excluded pairwise per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Base backup
    Backup,
    /// Restore
    Restore,
    /// WAL archiving
    Archive,
    /// Backup deletion
    Delete,
    /// Retention sweep
    Retention,
}

impl OperationKind {
    /// Lower-case name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Archive => "archive",
            OperationKind::Delete => "delete",
            OperationKind::Retention => "retention",
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runtime state of one server.
#[derive(Debug, Default)]
pub struct ServerState {
    backup: AtomicBool,
    restore: AtomicBool,
    archive: AtomicBool,
    delete: AtomicBool,
    retention: AtomicBool,

    /// Current timeline observed from the upstream.
    pub timeline: AtomicU32,
    /// Last known write LSN of the upstream.
    pub write_lsn: AtomicU64,
    /// WAL streaming paused by the mode command.
    pub wal_paused: AtomicBool,

    /// Completed operations.
    pub operation_count: AtomicU64,
    /// Failed operations.
    pub failed_operation_count: AtomicU64,
    /// Unix time of the last completed operation.
    pub last_operation_time: AtomicU64,
    /// Unix time of the last failed operation.
    pub last_failed_operation_time: AtomicU64,
}

impl ServerState {
    fn flag(&self, kind: OperationKind) -> &AtomicBool {
        match kind {
            OperationKind::Backup => &self.backup,
            OperationKind::Restore => &self.restore,
            OperationKind::Archive => &self.archive,
            OperationKind::Delete => &self.delete,
            OperationKind::Retention => &self.retention,
        }
    }

    /// Whether an operation of this kind is running.
    pub fn is_busy(&self, kind: OperationKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    /// Observed timeline.
    pub fn current_timeline(&self) -> u32 {
        self.timeline.load(Ordering::Acquire).max(1)
    }

    /// Record the upstream position reported by the last connection.
    pub fn observe_position(&self, timeline: u32, lsn: Lsn) {
        self.timeline.store(timeline, Ordering::Release);
        self.write_lsn.store(lsn.0, Ordering::Release);
    }
}

/// Guard holding a server busy flag; completion records the outcome.
#[derive(Debug)]
pub struct OperationGuard {
    state: Arc<ServerState>,
    kind: OperationKind,
    finished: bool,
}

impl OperationGuard {
    /// Mark the operation complete with the given outcome and release the
    /// busy flag.
    pub fn finish(mut self, success: bool) {
        self.record(success);
        self.finished = true;
    }

    fn record(&self, success: bool) {
        let now = unix_now();
        self.state.operation_count.fetch_add(1, Ordering::AcqRel);
        self.state.last_operation_time.store(now, Ordering::Release);
        if !success {
            self.state
                .failed_operation_count
                .fetch_add(1, Ordering::AcqRel);
            self.state
                .last_failed_operation_time
                .store(now, Ordering::Release);
        }
        self.state.flag(self.kind).store(false, Ordering::Release);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        // A guard dropped without finish (panic unwind, early return)
        // counts as a failed operation; the busy flag must clear either
        // way.
        if !self.finished {
            self.record(false);
        }
    }
}

/// Registry of per-server runtime state, keyed by server name.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: DashMap<String, Arc<ServerState>>,
}

impl ServerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ServerRegistry {
            servers: DashMap::new(),
        }
    }

    /// Register the configured servers (startup).
    pub fn register(&self, name: &str) {
        self.servers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServerState::default()));
    }

    /// Look up a server's state.
    pub fn get(&self, name: &str) -> Option<Arc<ServerState>> {
        self.servers.get(name).map(|entry| entry.value().clone())
    }

    /// Registered server names.
    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|e| e.key().clone()).collect()
    }

    /// Try the Idle → Running transition for an operation kind.
    ///
    /// Returns a guard whose `finish` (or drop) performs Running → Idle and
    /// updates the counters. Rejects with `already_in_progress` when the
    /// flag is already set.
    pub fn begin(&self, name: &str, kind: OperationKind) -> Result<OperationGuard> {
        let state = self
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown server '{}'", name)))?;
        if state
            .flag(kind)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::already_in_progress(name, kind.name()));
        }
        Ok(OperationGuard {
            state,
            kind,
            finished: false,
        })
    }
}
