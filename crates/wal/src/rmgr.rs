//! Resource managers.
//!
//! The record header's `rmid` selects which subsystem's decoder interprets
//! the payload. The table of built-in managers is closed and version-gated;
//! ids at or above 128 belong to extension-registered managers, which the
//! describer renders generically. The high bits of `xl_info` select the
//! per-manager subtype.

use crate::record::DecodedRecord;
use pgharbor_core::{Error, Lsn, Result};
use std::borrow::Cow;
use std::fmt::Write;

/// First id reserved for extension-registered managers.
pub const CUSTOM_RMGR_MIN: u8 = 128;

/// A resource manager, selected by the record header's `rmid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceManager {
    /// Checkpoints, parameter changes, switches (id 0).
    Xlog,
    /// Transaction commit/abort/prepare (id 1).
    Transaction,
    /// Relation storage create/truncate (id 2).
    Storage,
    /// Commit-log status pages (id 3).
    Clog,
    /// Database create/drop (id 4).
    Database,
    /// Tablespace create/drop (id 5).
    Tablespace,
    /// Multi-transaction state (id 6).
    MultiXact,
    /// Relation mapper (id 7).
    RelMap,
    /// Hot-standby bookkeeping (id 8).
    Standby,
    /// Heap maintenance operations (id 9).
    Heap2,
    /// Heap row operations (id 10).
    Heap,
    /// B-tree index (id 11).
    Btree,
    /// Hash index (id 12).
    Hash,
    /// GIN index (id 13).
    Gin,
    /// GiST index (id 14).
    Gist,
    /// Sequences (id 15).
    Sequence,
    /// SP-GiST index (id 16).
    SpGist,
    /// BRIN index (id 17).
    Brin,
    /// Commit timestamps (id 18).
    CommitTs,
    /// Replication origins (id 19).
    ReplicationOrigin,
    /// Generic WAL for extensions without a manager (id 20).
    Generic,
    /// Logical decoding messages (id 21).
    LogicalMessage,
    /// Extension-registered manager (ids 128..=255, version 15+).
    Custom(u8),
}

/// All built-in managers in id order.
pub const BUILTIN: [ResourceManager; 22] = [
    ResourceManager::Xlog,
    ResourceManager::Transaction,
    ResourceManager::Storage,
    ResourceManager::Clog,
    ResourceManager::Database,
    ResourceManager::Tablespace,
    ResourceManager::MultiXact,
    ResourceManager::RelMap,
    ResourceManager::Standby,
    ResourceManager::Heap2,
    ResourceManager::Heap,
    ResourceManager::Btree,
    ResourceManager::Hash,
    ResourceManager::Gin,
    ResourceManager::Gist,
    ResourceManager::Sequence,
    ResourceManager::SpGist,
    ResourceManager::Brin,
    ResourceManager::CommitTs,
    ResourceManager::ReplicationOrigin,
    ResourceManager::Generic,
    ResourceManager::LogicalMessage,
];

impl ResourceManager {
    /// Resolve an `rmid`, gated by the stream's major version.
    pub fn from_id(id: u8, version: u32) -> Result<ResourceManager> {
        if let Some(rm) = BUILTIN.get(id as usize) {
            return Ok(*rm);
        }
        if id >= CUSTOM_RMGR_MIN {
            if version < 15 {
                return Err(Error::format(format!(
                    "custom resource manager {} in a version-{} stream",
                    id, version
                )));
            }
            return Ok(ResourceManager::Custom(id));
        }
        Err(Error::format(format!("unknown resource manager {}", id)))
    }

    /// Resolve a manager by name (built-ins only), case-insensitive.
    pub fn from_name(name: &str) -> Option<ResourceManager> {
        BUILTIN
            .iter()
            .find(|rm| rm.name().eq_ignore_ascii_case(name))
            .copied()
    }

    /// The manager's id.
    pub fn id(&self) -> u8 {
        match self {
            ResourceManager::Xlog => 0,
            ResourceManager::Transaction => 1,
            ResourceManager::Storage => 2,
            ResourceManager::Clog => 3,
            ResourceManager::Database => 4,
            ResourceManager::Tablespace => 5,
            ResourceManager::MultiXact => 6,
            ResourceManager::RelMap => 7,
            ResourceManager::Standby => 8,
            ResourceManager::Heap2 => 9,
            ResourceManager::Heap => 10,
            ResourceManager::Btree => 11,
            ResourceManager::Hash => 12,
            ResourceManager::Gin => 13,
            ResourceManager::Gist => 14,
            ResourceManager::Sequence => 15,
            ResourceManager::SpGist => 16,
            ResourceManager::Brin => 17,
            ResourceManager::CommitTs => 18,
            ResourceManager::ReplicationOrigin => 19,
            ResourceManager::Generic => 20,
            ResourceManager::LogicalMessage => 21,
            ResourceManager::Custom(id) => *id,
        }
    }

    /// Display name.
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            ResourceManager::Xlog => Cow::Borrowed("XLOG"),
            ResourceManager::Transaction => Cow::Borrowed("Transaction"),
            ResourceManager::Storage => Cow::Borrowed("Storage"),
            ResourceManager::Clog => Cow::Borrowed("CLOG"),
            ResourceManager::Database => Cow::Borrowed("Database"),
            ResourceManager::Tablespace => Cow::Borrowed("Tablespace"),
            ResourceManager::MultiXact => Cow::Borrowed("MultiXact"),
            ResourceManager::RelMap => Cow::Borrowed("RelMap"),
            ResourceManager::Standby => Cow::Borrowed("Standby"),
            ResourceManager::Heap2 => Cow::Borrowed("Heap2"),
            ResourceManager::Heap => Cow::Borrowed("Heap"),
            ResourceManager::Btree => Cow::Borrowed("Btree"),
            ResourceManager::Hash => Cow::Borrowed("Hash"),
            ResourceManager::Gin => Cow::Borrowed("Gin"),
            ResourceManager::Gist => Cow::Borrowed("Gist"),
            ResourceManager::Sequence => Cow::Borrowed("Sequence"),
            ResourceManager::SpGist => Cow::Borrowed("SPGist"),
            ResourceManager::Brin => Cow::Borrowed("BRIN"),
            ResourceManager::CommitTs => Cow::Borrowed("CommitTs"),
            ResourceManager::ReplicationOrigin => Cow::Borrowed("ReplicationOrigin"),
            ResourceManager::Generic => Cow::Borrowed("Generic"),
            ResourceManager::LogicalMessage => Cow::Borrowed("LogicalMessage"),
            ResourceManager::Custom(id) => Cow::Owned(format!("Custom{}", id)),
        }
    }

    /// Subtype name selected by the high bits of `xl_info`.
    pub fn subtype_name(&self, info: u8) -> &'static str {
        let high = info & 0xF0;
        match self {
            ResourceManager::Xlog => match high {
                0x00 => "CHECKPOINT_SHUTDOWN",
                0x10 => "CHECKPOINT_ONLINE",
                0x20 => "NOOP",
                0x30 => "NEXTOID",
                0x40 => "SWITCH",
                0x50 => "BACKUP_END",
                0x60 => "PARAMETER_CHANGE",
                0x70 => "RESTORE_POINT",
                0x80 => "FPW_CHANGE",
                0x90 => "END_OF_RECOVERY",
                0xA0 => "FPI_FOR_HINT",
                0xB0 => "FPI",
                0xC0 => "OVERWRITE_CONTRECORD",
                _ => "UNKNOWN",
            },
            ResourceManager::Transaction => match info & 0x70 {
                0x00 => "COMMIT",
                0x10 => "PREPARE",
                0x20 => "ABORT",
                0x30 => "COMMIT_PREPARED",
                0x40 => "ABORT_PREPARED",
                0x50 => "ASSIGNMENT",
                0x60 => "INVALIDATIONS",
                _ => "UNKNOWN",
            },
            ResourceManager::Storage => match high {
                0x10 => "CREATE",
                0x20 => "TRUNCATE",
                _ => "UNKNOWN",
            },
            ResourceManager::Clog => match high {
                0x00 => "ZEROPAGE",
                0x10 => "TRUNCATE",
                _ => "UNKNOWN",
            },
            ResourceManager::Database => match high {
                0x00 => "CREATE",
                0x10 => "DROP",
                _ => "UNKNOWN",
            },
            ResourceManager::Tablespace => match high {
                0x00 => "CREATE",
                0x10 => "DROP",
                _ => "UNKNOWN",
            },
            ResourceManager::Standby => match high {
                0x00 => "LOCK",
                0x10 => "RUNNING_XACTS",
                0x20 => "INVALIDATIONS",
                _ => "UNKNOWN",
            },
            ResourceManager::Heap2 => match info & 0x70 {
                0x00 => "REWRITE",
                0x10 => "PRUNE",
                0x20 => "VACUUM",
                0x30 => "FREEZE_PAGE",
                0x40 => "VISIBLE",
                0x50 => "MULTI_INSERT",
                0x60 => "LOCK_UPDATED",
                0x70 => "NEW_CID",
                _ => "UNKNOWN",
            },
            ResourceManager::Heap => match info & 0x70 {
                0x00 => "INSERT",
                0x10 => "DELETE",
                0x20 => "UPDATE",
                0x30 => "TRUNCATE",
                0x40 => "HOT_UPDATE",
                0x50 => "CONFIRM",
                0x60 => "LOCK",
                0x70 => "INPLACE",
                _ => "UNKNOWN",
            },
            ResourceManager::Btree => match high {
                0x00 => "INSERT_LEAF",
                0x10 => "INSERT_UPPER",
                0x20 => "SPLIT_L",
                0x30 => "SPLIT_R",
                0x40 => "INSERT_POST",
                0x50 => "DEDUP",
                0x60 => "DELETE",
                0x70 => "UNLINK_PAGE",
                0x80 => "UNLINK_PAGE_META",
                0x90 => "NEWROOT",
                0xA0 => "MARK_PAGE_HALFDEAD",
                0xB0 => "VACUUM",
                0xC0 => "REUSE_PAGE",
                0xD0 => "META_CLEANUP",
                _ => "UNKNOWN",
            },
            ResourceManager::Sequence => match high {
                0x00 => "LOG",
                _ => "UNKNOWN",
            },
            ResourceManager::LogicalMessage => match high {
                0x00 => "MESSAGE",
                _ => "UNKNOWN",
            },
            ResourceManager::ReplicationOrigin => match high {
                0x00 => "SET",
                0x10 => "DROP",
                _ => "UNKNOWN",
            },
            _ => "RECORD",
        }
    }

    /// Produce a one-line human description of a record.
    pub fn describe(&self, record: &DecodedRecord) -> String {
        let mut out = String::new();
        let info = record.header.info;
        let _ = write!(out, "{}", self.subtype_name(info));

        match self {
            ResourceManager::Xlog => {
                // Checkpoint payloads begin with the redo LSN.
                if matches!(info & 0xF0, 0x00 | 0x10) && record.main_data.len() >= 8 {
                    let redo = Lsn(u64::from_le_bytes(
                        record.main_data[0..8].try_into().unwrap(),
                    ));
                    let _ = write!(out, " redo {}", redo);
                }
            }
            ResourceManager::Transaction => {
                // Commit and abort begin with the transaction timestamp
                // (microseconds since the 2000-01-01 epoch).
                if matches!(info & 0x70, 0x00 | 0x20 | 0x30 | 0x40) && record.main_data.len() >= 8 {
                    let micros = i64::from_le_bytes(record.main_data[0..8].try_into().unwrap());
                    let _ = write!(out, " at epoch-micros {}", micros);
                }
            }
            ResourceManager::Heap => {
                // Inserts carry the target offset and flags in main data.
                if info & 0x70 == 0x00 && record.main_data.len() >= 3 {
                    let offnum =
                        u16::from_le_bytes(record.main_data[0..2].try_into().unwrap());
                    let flags = record.main_data[2];
                    let _ = write!(out, " off {} flags 0x{:02X}", offnum, flags);
                }
            }
            _ => {}
        }

        for block in &record.blocks {
            let _ = write!(out, ", blkref #{}", block.id);
            if let Some(rel) = block.rel {
                let _ = write!(out, " rel {}/{}/{}", rel.spc, rel.db, rel.rel);
            }
            let _ = write!(out, " blk {}", block.block_number);
            if let Some(image) = &block.image {
                let _ = write!(out, " FPW {}B", image.length);
            }
        }
        if !record.main_data.is_empty() {
            let _ = write!(out, "; main {}B", record.main_data.len());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordSpec;

    #[test]
    fn test_builtin_ids_are_dense() {
        for (i, rm) in BUILTIN.iter().enumerate() {
            assert_eq!(rm.id() as usize, i);
            assert_eq!(ResourceManager::from_id(i as u8, 16).unwrap(), *rm);
        }
    }

    #[test]
    fn test_reserved_ids_rejected() {
        assert!(ResourceManager::from_id(22, 16).is_err());
        assert!(ResourceManager::from_id(127, 16).is_err());
    }

    #[test]
    fn test_custom_ids_version_gated() {
        assert!(ResourceManager::from_id(130, 13).is_err());
        assert_eq!(
            ResourceManager::from_id(130, 15).unwrap(),
            ResourceManager::Custom(130)
        );
        assert_eq!(ResourceManager::Custom(130).name(), "Custom130");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            ResourceManager::from_name("heap"),
            Some(ResourceManager::Heap)
        );
        assert_eq!(
            ResourceManager::from_name("BTREE"),
            Some(ResourceManager::Btree)
        );
        assert_eq!(ResourceManager::from_name("nonsense"), None);
    }

    #[test]
    fn test_describe_heap_insert() {
        // Heap INSERT: offset 7, flags 0x01, one block reference.
        let mut main = Vec::new();
        main.extend_from_slice(&7u16.to_le_bytes());
        main.push(0x01);
        let bytes = RecordSpec::new(ResourceManager::Heap.id(), 742)
            .info(0x00)
            .block(0, (1663, 16384, 16385), 42, vec![1, 2, 3])
            .main_data(main)
            .encode(pgharbor_core::Lsn(0));
        let record =
            crate::record::DecodedRecord::decode(&bytes, pgharbor_core::Lsn(0), 16).unwrap();

        let text = ResourceManager::Heap.describe(&record);
        assert!(text.starts_with("INSERT"), "{text}");
        assert!(text.contains("off 7"));
        assert!(text.contains("blk 42"));
        assert!(text.contains("rel 1663/16384/16385"));
    }

    #[test]
    fn test_subtype_names() {
        assert_eq!(ResourceManager::Xlog.subtype_name(0x40), "SWITCH");
        assert_eq!(ResourceManager::Transaction.subtype_name(0x00), "COMMIT");
        assert_eq!(ResourceManager::Heap.subtype_name(0x10), "DELETE");
        assert_eq!(ResourceManager::Btree.subtype_name(0x90), "NEWROOT");
    }
}
