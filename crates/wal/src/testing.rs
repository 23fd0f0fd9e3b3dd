//! Test support: synthetic records and segments.
//!
//! [`RecordSpec`] assembles a single record with a valid CRC;
//! [`SegmentBuilder`] lays records out across pages and segments exactly as
//! the upstream server would, including continuation page headers, so the
//! reader can be exercised against cross-page and cross-segment records
//! without a live database.

use crate::page::{LongHeader, PageHeader, XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER};
use crate::record::{
    BKPBLOCK_HAS_DATA, BKPBLOCK_HAS_IMAGE, BKPBLOCK_WILL_INIT, BLOCK_ID_DATA_LONG,
    BLOCK_ID_DATA_SHORT, BLOCK_ID_ORIGIN, BLOCK_ID_TOPLEVEL_XID, CRC_OFFSET, RECORD_HEADER_SIZE,
};
use crate::segment::SegmentName;
use crate::{BLOCK_SIZE, DEFAULT_SEGMENT_SIZE, MAGIC_V16, PAGE_SIZE};
use pgharbor_core::Lsn;
use std::path::Path;

#[derive(Debug, Clone)]
struct SpecBlock {
    id: u8,
    fork: u8,
    rel: (u32, u32, u32),
    block_number: u32,
    will_init: bool,
    data: Vec<u8>,
    image: Option<(Vec<u8>, u16, u16)>,
}

/// Builder for one synthetic WAL record.
#[derive(Debug, Clone)]
pub struct RecordSpec {
    /// Resource manager id.
    pub rmid: u8,
    /// Transaction id.
    pub xid: u32,
    /// Info byte; the high bits select the rmgr subtype.
    pub info: u8,
    blocks: Vec<SpecBlock>,
    main_data: Option<Vec<u8>>,
    origin: Option<u16>,
    toplevel_xid: Option<u32>,
}

impl RecordSpec {
    /// Start a record for the given resource manager and transaction.
    pub fn new(rmid: u8, xid: u32) -> Self {
        RecordSpec {
            rmid,
            xid,
            info: 0,
            blocks: Vec::new(),
            main_data: None,
            origin: None,
            toplevel_xid: None,
        }
    }

    /// Set the info byte.
    pub fn info(mut self, info: u8) -> Self {
        self.info = info;
        self
    }

    /// Add a block reference with data.
    pub fn block(mut self, id: u8, rel: (u32, u32, u32), block_number: u32, data: Vec<u8>) -> Self {
        self.blocks.push(SpecBlock {
            id,
            fork: 0,
            rel,
            block_number,
            will_init: false,
            data,
            image: None,
        });
        self
    }

    /// Add a block reference carrying an uncompressed full-page image.
    ///
    /// `image.len() + hole_length` must equal the block size.
    pub fn block_with_image(
        mut self,
        id: u8,
        rel: (u32, u32, u32),
        block_number: u32,
        image: Vec<u8>,
        hole_offset: u16,
        hole_length: u16,
    ) -> Self {
        assert_eq!(
            image.len() + hole_length as usize,
            BLOCK_SIZE,
            "image plus hole must cover the block"
        );
        self.blocks.push(SpecBlock {
            id,
            fork: 0,
            rel,
            block_number,
            will_init: false,
            data: Vec::new(),
            image: Some((image, hole_offset, hole_length)),
        });
        self
    }

    /// Set the main data.
    pub fn main_data(mut self, data: Vec<u8>) -> Self {
        self.main_data = Some(data);
        self
    }

    /// Set the replication origin.
    pub fn origin(mut self, origin: u16) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Set the top-level transaction id.
    pub fn toplevel_xid(mut self, xid: u32) -> Self {
        self.toplevel_xid = Some(xid);
        self
    }

    /// Assemble the record with a valid CRC. `prev` becomes `xl_prev`.
    pub fn encode(&self, prev: Lsn) -> Vec<u8> {
        let mut headers = Vec::new();
        let mut payloads = Vec::new();

        for block in &self.blocks {
            headers.push(block.id);
            let mut fork_flags = block.fork;
            if !block.data.is_empty() {
                fork_flags |= BKPBLOCK_HAS_DATA;
            }
            if block.image.is_some() {
                fork_flags |= BKPBLOCK_HAS_IMAGE;
            }
            if block.will_init {
                fork_flags |= BKPBLOCK_WILL_INIT;
            }
            headers.push(fork_flags);
            headers.extend_from_slice(&(block.data.len() as u16).to_le_bytes());
            if let Some((image, hole_offset, hole_length)) = &block.image {
                headers.extend_from_slice(&(image.len() as u16).to_le_bytes());
                headers.extend_from_slice(&hole_offset.to_le_bytes());
                let bimg_info: u8 = if *hole_length > 0 { 0x01 } else { 0x00 };
                headers.push(bimg_info);
                payloads.extend_from_slice(image);
            }
            let (spc, db, rel) = block.rel;
            headers.extend_from_slice(&spc.to_le_bytes());
            headers.extend_from_slice(&db.to_le_bytes());
            headers.extend_from_slice(&rel.to_le_bytes());
            headers.extend_from_slice(&block.block_number.to_le_bytes());
            payloads.extend_from_slice(&block.data);
        }

        if let Some(origin) = self.origin {
            headers.push(BLOCK_ID_ORIGIN);
            headers.extend_from_slice(&origin.to_le_bytes());
        }
        if let Some(xid) = self.toplevel_xid {
            headers.push(BLOCK_ID_TOPLEVEL_XID);
            headers.extend_from_slice(&xid.to_le_bytes());
        }
        if let Some(main) = &self.main_data {
            if main.len() <= u8::MAX as usize {
                headers.push(BLOCK_ID_DATA_SHORT);
                headers.push(main.len() as u8);
            } else {
                headers.push(BLOCK_ID_DATA_LONG);
                headers.extend_from_slice(&(main.len() as u32).to_le_bytes());
            }
            payloads.extend_from_slice(main);
        }

        let tot_len = (RECORD_HEADER_SIZE + headers.len() + payloads.len()) as u32;
        let mut record = Vec::with_capacity(tot_len as usize);
        record.extend_from_slice(&tot_len.to_le_bytes());
        record.extend_from_slice(&self.xid.to_le_bytes());
        record.extend_from_slice(&prev.0.to_le_bytes());
        record.push(self.info);
        record.push(self.rmid);
        record.extend_from_slice(&[0, 0]); // padding
        record.extend_from_slice(&[0, 0, 0, 0]); // crc, patched below
        record.extend_from_slice(&headers);
        record.extend_from_slice(&payloads);

        let crc = crc32c::crc32c(&record[..CRC_OFFSET]);
        let crc = crc32c::crc32c_append(crc, &record[RECORD_HEADER_SIZE..]);
        record[CRC_OFFSET..RECORD_HEADER_SIZE].copy_from_slice(&crc.to_le_bytes());
        record
    }
}

/// Builder laying records out into one or more consecutive segments.
pub struct SegmentBuilder {
    timeline: u32,
    first_segno: u64,
    segment_size: u64,
    magic: u16,
    system_id: u64,
    /// Contiguous stream covering all written segments.
    buf: Vec<u8>,
    /// Insert offset within `buf`.
    pos: usize,
    /// LSN of the most recently appended record.
    last_record: Lsn,
}

impl SegmentBuilder {
    /// Start building at the given timeline and segment number.
    pub fn new(timeline: u32, first_segno: u64) -> Self {
        Self::with_segment_size(timeline, first_segno, DEFAULT_SEGMENT_SIZE)
    }

    /// Start building with a non-default segment size (tests use small
    /// segments to exercise cross-segment records cheaply).
    pub fn with_segment_size(timeline: u32, first_segno: u64, segment_size: u64) -> Self {
        assert_eq!(segment_size % PAGE_SIZE as u64, 0);
        SegmentBuilder {
            timeline,
            first_segno,
            segment_size,
            magic: MAGIC_V16,
            system_id: 0x6861_7262_6F72_0001,
            buf: Vec::new(),
            pos: 0,
            last_record: Lsn::ZERO,
        }
    }

    /// Override the page magic (selects the decoded version).
    pub fn magic(mut self, magic: u16) -> Self {
        self.magic = magic;
        self
    }

    /// LSN corresponding to stream offset 0.
    fn base_lsn(&self) -> Lsn {
        Lsn(self.first_segno * self.segment_size)
    }

    /// LSN of the most recently appended record.
    pub fn last_record_lsn(&self) -> Lsn {
        self.last_record
    }

    /// LSN one past the last written byte.
    pub fn end_lsn(&self) -> Lsn {
        self.base_lsn().add(self.pos as u64)
    }

    fn page_offset(&self) -> usize {
        self.pos % PAGE_SIZE
    }

    /// Emit the header for the page beginning at the current position.
    fn emit_page_header(&mut self, rem_len: u32) {
        debug_assert_eq!(self.page_offset(), 0);
        let page_addr = self.base_lsn().add(self.pos as u64);
        let first_in_segment = self.pos as u64 % self.segment_size == 0;
        let mut info = 0u16;
        if first_in_segment {
            info |= XLP_LONG_HEADER;
        }
        if rem_len > 0 {
            info |= XLP_FIRST_IS_CONTRECORD;
        }
        let header = PageHeader {
            magic: self.magic,
            info,
            timeline: self.timeline,
            page_addr,
            rem_len,
            long: first_in_segment.then(|| LongHeader {
                system_id: self.system_id,
                segment_size: self.segment_size as u32,
                block_size: BLOCK_SIZE as u32,
            }),
        };
        let bytes = header.to_bytes();
        self.buf.extend_from_slice(&bytes);
        self.pos += bytes.len();
    }

    /// Append a record, spilling across pages and segments as needed.
    ///
    /// Returns the record's start LSN. `xl_prev` is chained automatically.
    pub fn append(&mut self, spec: &RecordSpec) -> Lsn {
        if self.page_offset() == 0 {
            self.emit_page_header(0);
        }

        let record = spec.encode(self.last_record);
        let start_lsn = self.base_lsn().add(self.pos as u64);

        let mut written = 0usize;
        while written < record.len() {
            if self.page_offset() == 0 {
                self.emit_page_header((record.len() - written) as u32);
            }
            let room = PAGE_SIZE - self.page_offset();
            let chunk = room.min(record.len() - written);
            self.buf
                .extend_from_slice(&record[written..written + chunk]);
            self.pos += chunk;
            written += chunk;
        }

        // Next record starts 8-byte aligned; zero-fill the gap.
        let aligned = (self.pos + 7) & !7;
        self.buf.resize(self.buf.len() + (aligned - self.pos), 0);
        self.pos = aligned;

        self.last_record = start_lsn;
        start_lsn
    }

    /// Split the stream into complete zero-padded segments.
    pub fn finish(mut self) -> Vec<(String, Vec<u8>)> {
        let seg = self.segment_size as usize;
        let count = self.buf.len().div_ceil(seg).max(1);
        self.buf.resize(count * seg, 0);

        // Zero padding after the last record parses as end-of-WAL, but every
        // page that exists must still carry a header.
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let name = SegmentName {
                timeline: self.timeline,
                segno: self.first_segno + i as u64,
            };
            out.push((
                name.file_name(self.segment_size),
                self.buf[i * seg..(i + 1) * seg].to_vec(),
            ));
        }
        out
    }

    /// Write all finished segments into a directory.
    pub fn write_dir(self, dir: &Path) -> std::io::Result<Vec<String>> {
        std::fs::create_dir_all(dir)?;
        let mut names = Vec::new();
        for (name, bytes) in self.finish() {
            std::fs::write(dir.join(&name), bytes)?;
            names.push(name);
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_page_layout() {
        let mut builder = SegmentBuilder::with_segment_size(1, 1, 4 * PAGE_SIZE as u64);
        let lsn = builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 32]));

        // First record sits just past the long page header.
        assert_eq!(lsn, Lsn(4 * PAGE_SIZE as u64 + 40));

        let segments = builder.finish();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, "000000010000000000000001");
        assert_eq!(segments[0].1.len(), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_record_spills_to_second_page() {
        let mut builder = SegmentBuilder::with_segment_size(1, 0, 4 * PAGE_SIZE as u64);
        // Larger than one page: must continue on page 1.
        builder.append(&RecordSpec::new(0, 1).main_data(vec![7; PAGE_SIZE + 100]));
        let segments = builder.finish();
        let page1 = &segments[0].1[PAGE_SIZE..];
        let header = PageHeader::parse(page1).unwrap();
        assert!(header.is_cont());
        assert!(header.rem_len > 0);
    }
}
