//! WAL page headers.
//!
//! Every 8 KiB page starts with a short header; the first page of a segment
//! carries the long form, which appends the system identifier and the
//! segment/block sizes used to write the file.
//!
//! # Header Layout
//!
//! ```text
//! Short (24 bytes):
//! ┌───────────┬───────────┬──────────┬───────────────┬───────────┬───────┐
//! │ magic (2) │ info (2)  │ tli (4)  │ pageaddr (8)  │ rem_len(4)│ pad(4)│
//! └───────────┴───────────┴──────────┴───────────────┴───────────┴───────┘
//! Long (40 bytes) appends:
//! ┌───────────────┬──────────────┬───────────────┐
//! │ system id (8) │ seg size (4) │ blck size (4) │
//! └───────────────┴──────────────┴───────────────┘
//! ```
//!
//! `rem_len` is the total number of bytes still outstanding for a record
//! begun on an earlier page; zero means the page begins at a record
//! boundary.

use pgharbor_core::{Error, Lsn, Result};

/// Size of the short page header.
pub const SHORT_HEADER_SIZE: usize = 24;

/// Size of the long page header (first page of a segment).
pub const LONG_HEADER_SIZE: usize = 40;

/// This page's first data bytes continue a record from an earlier page.
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
/// This page carries the long header form.
pub const XLP_LONG_HEADER: u16 = 0x0002;
/// Back-up blocks referenced on this page are removable.
pub const XLP_BKP_REMOVABLE: u16 = 0x0004;

/// Extra fields of the long header form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongHeader {
    /// Database system identifier.
    pub system_id: u64,
    /// Segment size the file was written with.
    pub segment_size: u32,
    /// WAL block size the file was written with.
    pub block_size: u32,
}

/// A parsed page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// Version-specific magic.
    pub magic: u16,
    /// XLP_* flag bits.
    pub info: u16,
    /// Timeline of the page.
    pub timeline: u32,
    /// LSN of the first byte of this page.
    pub page_addr: Lsn,
    /// Total bytes outstanding for a record begun on an earlier page.
    pub rem_len: u32,
    /// Long-form fields, present on the first page of a segment.
    pub long: Option<LongHeader>,
}

impl PageHeader {
    /// Bytes occupied by this header on the page.
    pub fn size(&self) -> usize {
        if self.long.is_some() {
            LONG_HEADER_SIZE
        } else {
            SHORT_HEADER_SIZE
        }
    }

    /// Whether the first data bytes continue an earlier record.
    pub fn is_cont(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    /// Parse a page header from the start of a page.
    ///
    /// The long form is parsed when the `XLP_LONG_HEADER` flag is set.
    pub fn parse(page: &[u8]) -> Result<PageHeader> {
        if page.len() < SHORT_HEADER_SIZE {
            return Err(Error::format("page too short for header"));
        }
        let magic = u16::from_le_bytes([page[0], page[1]]);
        let info = u16::from_le_bytes([page[2], page[3]]);
        let timeline = u32::from_le_bytes([page[4], page[5], page[6], page[7]]);
        let page_addr = Lsn(u64::from_le_bytes(page[8..16].try_into().unwrap()));
        let rem_len = u32::from_le_bytes(page[16..20].try_into().unwrap());

        if crate::version_for_magic(magic).is_none() {
            return Err(Error::format(format!(
                "unrecognized page magic 0x{:04X}",
                magic
            )));
        }

        let long = if info & XLP_LONG_HEADER != 0 {
            if page.len() < LONG_HEADER_SIZE {
                return Err(Error::format("page too short for long header"));
            }
            Some(LongHeader {
                system_id: u64::from_le_bytes(page[24..32].try_into().unwrap()),
                segment_size: u32::from_le_bytes(page[32..36].try_into().unwrap()),
                block_size: u32::from_le_bytes(page[36..40].try_into().unwrap()),
            })
        } else {
            None
        };

        Ok(PageHeader {
            magic,
            info,
            timeline,
            page_addr,
            rem_len,
            long,
        })
    }

    /// Serialize the header to its on-page form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size()];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2..4].copy_from_slice(&self.info.to_le_bytes());
        out[4..8].copy_from_slice(&self.timeline.to_le_bytes());
        out[8..16].copy_from_slice(&self.page_addr.0.to_le_bytes());
        out[16..20].copy_from_slice(&self.rem_len.to_le_bytes());
        if let Some(long) = &self.long {
            out[24..32].copy_from_slice(&long.system_id.to_le_bytes());
            out[32..36].copy_from_slice(&long.segment_size.to_le_bytes());
            out[36..40].copy_from_slice(&long.block_size.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAGIC_V16;

    #[test]
    fn test_short_header_roundtrip() {
        let header = PageHeader {
            magic: MAGIC_V16,
            info: XLP_FIRST_IS_CONTRECORD,
            timeline: 3,
            page_addr: Lsn(0x2000),
            rem_len: 100,
            long: None,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), SHORT_HEADER_SIZE);
        let parsed = PageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_cont());
    }

    #[test]
    fn test_long_header_roundtrip() {
        let header = PageHeader {
            magic: MAGIC_V16,
            info: XLP_LONG_HEADER,
            timeline: 1,
            page_addr: Lsn(16 * 1024 * 1024),
            rem_len: 0,
            long: Some(LongHeader {
                system_id: 0xDEAD_BEEF_0123_4567,
                segment_size: 16 * 1024 * 1024,
                block_size: 8192,
            }),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), LONG_HEADER_SIZE);
        let parsed = PageHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(!parsed.is_cont());
    }

    #[test]
    fn test_unknown_magic_rejected() {
        let mut header = PageHeader {
            magic: MAGIC_V16,
            info: 0,
            timeline: 1,
            page_addr: Lsn(0),
            rem_len: 0,
            long: None,
        };
        header.magic = 0x1234;
        let bytes = header.to_bytes();
        assert!(PageHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(PageHeader::parse(&[0u8; 10]).is_err());
    }
}
