//! WAL reading and decoding.
//!
//! This crate parses the on-disk write-ahead-log format of PostgreSQL 13+:
//! 16 MiB segments of 8 KiB pages, records that may cross page and segment
//! boundaries, per-record CRC-32C validation, and per-resource-manager
//! record descriptions.
//!
//! # Segment Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Page 0: long header (40 B) │ records …       │
//! ├──────────────────────────────────────────────┤
//! │ Page 1: short header (24 B) │ records …      │
//! ├──────────────────────────────────────────────┤
//! │ …  (2048 pages of 8 KiB per 16 MiB segment)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A record that does not fit on its page continues at the start of the next
//! page, after that page's header; the page header's `rem_len` field carries
//! the total number of record bytes still outstanding. A record may likewise
//! continue into the next segment.

pub mod filter;
pub mod page;
pub mod reader;
pub mod record;
pub mod rmgr;
pub mod segment;
pub mod summary;
pub mod testing;

pub use filter::{OidMap, OutputFormat, RecordFilter};
pub use page::{LongHeader, PageHeader};
pub use reader::WalReader;
pub use record::{BlockRef, DecodedRecord, FullPageImage, RecordHeader};
pub use rmgr::ResourceManager;
pub use segment::SegmentName;
pub use summary::Summary;

/// WAL page size in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Default WAL segment size in bytes (16 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Database block size assumed for full-page images.
pub const BLOCK_SIZE: usize = 8192;

/// Page magic per supported major version.
///
/// The magic in a segment's long header selects version-specific decoding.
pub const MAGIC_V13: u16 = 0xD106;
/// Version 14 page magic.
pub const MAGIC_V14: u16 = 0xD10D;
/// Version 15 page magic.
pub const MAGIC_V15: u16 = 0xD110;
/// Version 16 page magic.
pub const MAGIC_V16: u16 = 0xD113;
/// Version 17 page magic.
pub const MAGIC_V17: u16 = 0xD116;

/// Major version for a page magic, if supported.
pub fn version_for_magic(magic: u16) -> Option<u32> {
    match magic {
        MAGIC_V13 => Some(13),
        MAGIC_V14 => Some(14),
        MAGIC_V15 => Some(15),
        MAGIC_V16 => Some(16),
        MAGIC_V17 => Some(17),
        _ => None,
    }
}
