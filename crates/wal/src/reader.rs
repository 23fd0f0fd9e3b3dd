//! WAL record reader.
//!
//! The reader walks a segment page by page and yields decoded records. A
//! record that does not fit on its page is assembled from continuation
//! pages, following into the successor segment when the record crosses the
//! segment boundary. The successor's long header must agree with the
//! current segment (magic, timeline, segment size, address); a missing
//! successor surfaces as `unexpected_eof`.
//!
//! Assembly is a three-state machine: at a record boundary, the reader
//! either consumes a whole record from the current page, or begins
//! accumulating with whatever the page still holds (header bytes first when
//! even the header is split) and completes the record from the `rem_len`
//! bytes announced by each following page.

use crate::page::PageHeader;
use crate::record::{verify_crc, DecodedRecord, RECORD_HEADER_SIZE};
use crate::segment::{parse_file_name, SegmentName};
use crate::{version_for_magic, PAGE_SIZE};
use pgharbor_core::{Error, Lsn, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reader over one segment file, following record continuations into
/// successor segments in the same directory.
pub struct WalReader {
    dir: PathBuf,
    segment_size: u64,
    version: u32,
    magic: u16,
    system_id: u64,
    timeline: u32,
    segno: u64,
    buf: Vec<u8>,
    /// Offset of the next unread byte within the current segment.
    pos: usize,
    /// Whether a record boundary has been reached since open.
    started: bool,
}

impl WalReader {
    /// Open a segment file. The name must be a plain or `.partial` segment
    /// name; compressed or encrypted segments must be decoded first.
    pub fn open(path: &Path) -> Result<WalReader> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::format("segment path has no file name"))?;

        let buf = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        if buf.len() < PAGE_SIZE || buf.len() % PAGE_SIZE != 0 {
            return Err(Error::format(format!(
                "segment '{}' is {} bytes, not a multiple of the page size",
                file_name,
                buf.len()
            )));
        }

        let header = PageHeader::parse(&buf)?;
        let long = header
            .long
            .ok_or_else(|| Error::format("first page is missing the long header"))?;
        let version = version_for_magic(header.magic)
            .ok_or_else(|| Error::format("unsupported page magic"))?;
        let segment_size = long.segment_size as u64;

        let parsed = parse_file_name(file_name, segment_size)?;
        if parsed.compression.is_some() || parsed.encrypted {
            return Err(Error::format(format!(
                "segment '{}' must be decompressed and decrypted before reading",
                file_name
            )));
        }
        if header.timeline != parsed.name.timeline {
            return Err(Error::format(format!(
                "page timeline {} does not match file name timeline {}",
                header.timeline, parsed.name.timeline
            )));
        }
        let expected_addr = parsed.name.start_lsn(segment_size);
        if header.page_addr != expected_addr {
            return Err(Error::format(format!(
                "first page address {} does not match segment start {}",
                header.page_addr, expected_addr
            )));
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(WalReader {
            dir,
            segment_size,
            version,
            magic: header.magic,
            system_id: long.system_id,
            timeline: parsed.name.timeline,
            segno: parsed.name.segno,
            buf,
            pos: 0,
            started: false,
        })
    }

    /// Decode every record of a segment.
    pub fn read_all(path: &Path) -> Result<Vec<DecodedRecord>> {
        let mut reader = WalReader::open(path)?;
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Database major version decoded from the page magic.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// System identifier from the long header.
    pub fn system_id(&self) -> u64 {
        self.system_id
    }

    /// Segment size declared by the long header.
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// First LSN of the current segment.
    fn base_lsn(&self) -> Lsn {
        Lsn(self.segno * self.segment_size)
    }

    /// Current read LSN.
    pub fn current_lsn(&self) -> Lsn {
        self.base_lsn().add(self.pos as u64)
    }

    /// Parse and validate the page header at a page-aligned offset.
    fn page_header_at(&self, offset: usize) -> Result<PageHeader> {
        debug_assert_eq!(offset % PAGE_SIZE, 0);
        let header = PageHeader::parse(&self.buf[offset..offset + PAGE_SIZE])?;
        if header.magic != self.magic {
            return Err(Error::format(format!(
                "page magic changed mid-stream at {}",
                self.base_lsn().add(offset as u64)
            )));
        }
        if header.timeline != self.timeline {
            return Err(Error::format(format!(
                "page timeline {} does not match segment timeline {}",
                header.timeline, self.timeline
            )));
        }
        let expected = self.base_lsn().add(offset as u64);
        if header.page_addr != expected {
            return Err(Error::format(format!(
                "page address {} does not match expected {}",
                header.page_addr, expected
            )));
        }
        Ok(header)
    }

    /// Open the successor segment to complete a continuation.
    fn advance_segment(&mut self) -> Result<()> {
        let next = SegmentName {
            timeline: self.timeline,
            segno: self.segno + 1,
        };
        let path = self.dir.join(next.file_name(self.segment_size));
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::UnexpectedEof {
                    lsn: self.current_lsn(),
                    message: format!(
                        "record continues into missing segment {}",
                        next.file_name(self.segment_size)
                    ),
                });
            }
            Err(e) => return Err(Error::io(&path, e)),
        };
        if buf.len() < PAGE_SIZE || buf.len() % PAGE_SIZE != 0 {
            return Err(Error::format("successor segment has invalid size"));
        }

        let header = PageHeader::parse(&buf)?;
        let long = header
            .long
            .ok_or_else(|| Error::format("successor segment is missing the long header"))?;
        if header.magic != self.magic
            || header.timeline != self.timeline
            || long.segment_size as u64 != self.segment_size
            || long.system_id != self.system_id
        {
            return Err(Error::format(
                "successor segment header does not match the stream",
            ));
        }
        if header.page_addr != next.start_lsn(self.segment_size) {
            return Err(Error::format(
                "successor segment address does not match its name",
            ));
        }

        debug!(
            target: "pgharbor::wal",
            segment = %next.file_name(self.segment_size),
            "following record continuation into successor segment"
        );
        self.segno += 1;
        self.buf = buf;
        self.pos = 0;
        Ok(())
    }

    /// Skip a continuation whose start lies before this reader's first
    /// page. Only legal immediately after open.
    fn skip_leading_continuation(&mut self, first_header: PageHeader) -> Result<()> {
        let mut needed = first_header.rem_len as usize;
        let mut header = first_header;
        loop {
            self.pos += header.size();
            let capacity = PAGE_SIZE - self.pos % PAGE_SIZE;
            let chunk = capacity.min(needed);
            self.pos += chunk;
            needed -= chunk;
            if needed == 0 {
                break;
            }
            if self.pos >= self.buf.len() {
                self.advance_segment()?;
            }
            header = self.page_header_at(self.pos)?;
            if !header.is_cont() || header.rem_len as usize != needed {
                return Err(Error::format(format!(
                    "inconsistent continuation near {} while skipping a partial record",
                    self.current_lsn()
                )));
            }
        }
        self.pos = (self.pos + 7) & !7;
        Ok(())
    }

    /// Produce the next record, or `None` at end of WAL.
    pub fn next_record(&mut self) -> Result<Option<DecodedRecord>> {
        // Step over the page header when positioned at a page boundary; a
        // page reached at a record boundary must not claim continuation,
        // except right after open, where a leading continuation belongs to
        // a record begun before this reader's first page and is skipped.
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        if self.pos % PAGE_SIZE == 0 {
            let header = self.page_header_at(self.pos)?;
            if header.rem_len != 0 {
                if self.started {
                    return Err(Error::format(format!(
                        "page at {} continues a record the reader never started",
                        self.current_lsn()
                    )));
                }
                self.skip_leading_continuation(header)?;
                if self.pos >= self.buf.len() {
                    return Ok(None);
                }
                if self.pos % PAGE_SIZE == 0 {
                    let header = self.page_header_at(self.pos)?;
                    if header.rem_len != 0 {
                        return Err(Error::format(
                            "continuation follows a skipped partial record",
                        ));
                    }
                    self.pos += header.size();
                }
            } else {
                self.pos += header.size();
            }
        }
        self.started = true;

        let page_end = (self.pos / PAGE_SIZE + 1) * PAGE_SIZE;
        let remaining_on_page = page_end - self.pos;

        let tot_len =
            u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        if tot_len == 0 {
            // Zero length marks the end of valid WAL in this segment.
            return Ok(None);
        }
        if tot_len < RECORD_HEADER_SIZE {
            return Err(Error::format(format!(
                "record at {} claims impossible length {}",
                self.current_lsn(),
                tot_len
            )));
        }

        let record_lsn = self.current_lsn();

        let assembled: Vec<u8> = if tot_len <= remaining_on_page {
            let bytes = self.buf[self.pos..self.pos + tot_len].to_vec();
            self.pos += tot_len;
            bytes
        } else {
            // Partial record: accumulate what this page holds (possibly not
            // even the whole header), then drain continuation pages.
            let mut acc = Vec::with_capacity(tot_len);
            acc.extend_from_slice(&self.buf[self.pos..page_end]);
            self.pos = page_end;

            while acc.len() < tot_len {
                if self.pos >= self.buf.len() {
                    self.advance_segment()?;
                }
                let header = self.page_header_at(self.pos)?;
                let needed = tot_len - acc.len();
                if !header.is_cont() || header.rem_len as usize != needed {
                    return Err(Error::format(format!(
                        "continuation page at {} announces {} bytes, record needs {}",
                        self.current_lsn(),
                        header.rem_len,
                        needed
                    )));
                }
                self.pos += header.size();
                let capacity = PAGE_SIZE - self.pos % PAGE_SIZE;
                let chunk = capacity.min(needed);
                acc.extend_from_slice(&self.buf[self.pos..self.pos + chunk]);
                self.pos += chunk;
            }
            acc
        };

        // The next record starts 8-byte aligned.
        self.pos = (self.pos + 7) & !7;

        verify_crc(&assembled, record_lsn)?;
        let record = DecodedRecord::decode(&assembled, record_lsn, self.version)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordSpec, SegmentBuilder};
    use tempfile::tempdir;

    const SEG: u64 = 4 * PAGE_SIZE as u64;

    #[test]
    fn test_read_simple_records() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        for i in 0..5u32 {
            builder.append(&RecordSpec::new(0, i).main_data(vec![i as u8; 16]));
        }
        let names = builder.write_dir(dir.path()).unwrap();

        let records = WalReader::read_all(&dir.path().join(&names[0])).unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.header.xid, i as u32);
            assert_eq!(record.main_data, vec![i as u8; 16]);
        }
    }

    #[test]
    fn test_prev_chain_is_strictly_increasing() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        for i in 0..20u32 {
            builder.append(&RecordSpec::new(0, i).main_data(vec![0; 64]));
        }
        let names = builder.write_dir(dir.path()).unwrap();

        let records = WalReader::read_all(&dir.path().join(&names[0])).unwrap();
        assert_eq!(records.len(), 20);
        for pair in records.windows(2) {
            assert_eq!(pair[1].header.prev, pair[0].lsn);
            assert!(pair[1].header.prev > pair[0].header.prev);
        }
    }

    #[test]
    fn test_record_crossing_page_boundary() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        builder.append(&RecordSpec::new(0, 1).main_data(vec![0xAA; PAGE_SIZE + 500]));
        builder.append(&RecordSpec::new(0, 2).main_data(vec![0xBB; 32]));
        let names = builder.write_dir(dir.path()).unwrap();

        let records = WalReader::read_all(&dir.path().join(&names[0])).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].main_data.len(), PAGE_SIZE + 500);
        assert!(records[0].main_data.iter().all(|&b| b == 0xAA));
        assert_eq!(records[1].header.prev, records[0].lsn);
    }

    #[test]
    fn test_record_crossing_segment_boundary() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        // Fill most of the first segment, then spill into the second.
        builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 2 * PAGE_SIZE]));
        builder.append(&RecordSpec::new(0, 2).main_data(vec![2; 2 * PAGE_SIZE]));
        let names = builder.write_dir(dir.path()).unwrap();
        assert!(names.len() >= 2, "expected spill into a second segment");

        let records = WalReader::read_all(&dir.path().join(&names[0])).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].main_data, vec![2; 2 * PAGE_SIZE]);
    }

    #[test]
    fn test_missing_successor_is_unexpected_eof() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 2 * PAGE_SIZE]));
        builder.append(&RecordSpec::new(0, 2).main_data(vec![2; 2 * PAGE_SIZE]));
        let names = builder.write_dir(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(&names[1])).unwrap();

        let mut reader = WalReader::open(&dir.path().join(&names[0])).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { .. }), "{err:?}");
    }

    #[test]
    fn test_corrupted_record_reports_lsn_and_stops() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        let first = builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 64]));
        let second = builder.append(&RecordSpec::new(0, 2).main_data(vec![2; 64]));
        builder.append(&RecordSpec::new(0, 3).main_data(vec![3; 64]));
        let names = builder.write_dir(dir.path()).unwrap();

        // Flip one payload byte inside the second record.
        let path = dir.path().join(&names[0]);
        let mut bytes = std::fs::read(&path).unwrap();
        let offset = second.segment_offset(SEG) as usize + RECORD_HEADER_SIZE + 10;
        bytes[offset] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.next_record().unwrap().unwrap().lsn, first);
        let err = reader.next_record().unwrap_err();
        match err {
            Error::BadRecordCrc { lsn, .. } => assert_eq!(lsn, second),
            other => panic!("expected BadRecordCrc, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_tail_is_end_of_wal() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 16]));
        let names = builder.write_dir(dir.path()).unwrap();

        let mut reader = WalReader::open(&dir.path().join(&names[0])).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().unwrap().is_none());
        // Stays at end.
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_rejects_layered_names() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        builder.append(&RecordSpec::new(0, 1).main_data(vec![1; 16]));
        let names = builder.write_dir(dir.path()).unwrap();

        let plain = dir.path().join(&names[0]);
        let layered = dir.path().join(format!("{}.zstd", names[0]));
        std::fs::rename(&plain, &layered).unwrap();
        assert!(WalReader::open(&layered).is_err());
    }
}
