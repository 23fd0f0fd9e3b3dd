//! # pgharbor
//!
//! A backup and disaster-recovery engine for PostgreSQL-compatible
//! databases: online base backups, continuous WAL archiving, incremental
//! backups, point-in-time restore, retention-based garbage collection, and
//! WAL inspection.
//!
//! The workspace splits into five crates, re-exported here:
//!
//! | Crate | Contents |
//! |---|---|
//! | [`core`] | error taxonomy, LSN type, tagged values, ordered deque, adaptive radix tree |
//! | [`config`] | INI configuration, unit coercers, hot-vs-restart live reload |
//! | [`wal`] | segment/page/record decoding, resource managers, filtering, summaries |
//! | [`workflow`] | stage engine, worker pool, token buckets |
//! | [`engine`] | backup/restore/retention pipelines, storage backends, supervisor |
//!
//! # Quick Start
//!
//! ```no_run
//! use pgharbor::config;
//!
//! fn main() -> pgharbor::Result<()> {
//!     let cfg = config::load_file(std::path::Path::new("/etc/pgharbor.conf"))?;
//!     // Wire a supervisor or drive operations directly; see
//!     // `engine::Supervisor` and `engine::ops`.
//!     let _ = cfg;
//!     Ok(())
//! }
//! ```

pub use pgharbor_config as config;
pub use pgharbor_core as core;
pub use pgharbor_engine as engine;
pub use pgharbor_wal as wal;
pub use pgharbor_workflow as workflow;

pub use pgharbor_core::{Error, ErrorKind, Lsn, Result, Value};
