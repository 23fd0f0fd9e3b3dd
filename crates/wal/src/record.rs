//! WAL record decoding.
//!
//! A record is a 24-byte header followed by a sequence of typed blocks:
//! block references (ids 0..=32, each optionally carrying a full-page image
//! with optional hole and compression), short or long main data, the
//! replication origin, and the top-level transaction id. Block payloads
//! follow all block headers, in header order, with main data last.
//!
//! ```text
//! ┌──────────────────────── header (24 bytes) ────────────────────────┐
//! │ tot_len(4) │ xid(4) │ prev(8) │ info(1) │ rmid(1) │ pad(2) │ crc(4)│
//! └───────────────────────────────────────────────────────────────────┘
//! │ block headers … │ block payloads … │ main data │
//! ```
//!
//! The CRC-32C covers the header up to (not including) the crc field,
//! followed by the whole payload.

use crate::BLOCK_SIZE;
use pgharbor_core::{Error, Lsn, Result};

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 24;

/// Byte offset of the crc field within the header.
pub const CRC_OFFSET: usize = 20;

/// Highest block id that denotes a block reference.
pub const MAX_BLOCK_ID: u8 = 32;

/// Short main data marker (u8 length follows).
pub const BLOCK_ID_DATA_SHORT: u8 = 255;
/// Long main data marker (u32 length follows).
pub const BLOCK_ID_DATA_LONG: u8 = 254;
/// Replication origin marker.
pub const BLOCK_ID_ORIGIN: u8 = 253;
/// Top-level transaction id marker.
pub const BLOCK_ID_TOPLEVEL_XID: u8 = 252;

/// Block reference flag: a full-page image follows.
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
/// Block reference flag: block data follows.
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
/// Block reference flag: redo will re-initialize the page.
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
/// Block reference flag: same relation as the previous block reference.
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

/// Image flag: the image has a hole.
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;

/// The fixed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Total record length, header included.
    pub tot_len: u32,
    /// Transaction id.
    pub xid: u32,
    /// LSN of the previous record.
    pub prev: Lsn,
    /// Flag bits; the high bits select the resource-manager subtype.
    pub info: u8,
    /// Resource manager id.
    pub rmid: u8,
    /// CRC-32C of the record.
    pub crc: u32,
}

impl RecordHeader {
    /// Parse a header from the start of a record.
    pub fn parse(bytes: &[u8]) -> Result<RecordHeader> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(Error::format("record header truncated"));
        }
        Ok(RecordHeader {
            tot_len: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            xid: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            prev: Lsn(u64::from_le_bytes(bytes[8..16].try_into().unwrap())),
            info: bytes[16],
            rmid: bytes[17],
            crc: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.tot_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.xid.to_le_bytes());
        out[8..16].copy_from_slice(&self.prev.0.to_le_bytes());
        out[16] = self.info;
        out[17] = self.rmid;
        out[20..24].copy_from_slice(&self.crc.to_le_bytes());
        out
    }
}

/// Compute the record CRC over assembled record bytes.
///
/// Covers `header[0..CRC_OFFSET]` followed by the payload.
pub fn record_crc(record: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&record[..CRC_OFFSET]);
    crc32c::crc32c_append(crc, &record[RECORD_HEADER_SIZE..])
}

/// Verify the stored CRC of assembled record bytes.
pub fn verify_crc(record: &[u8], lsn: Lsn) -> Result<()> {
    let header = RecordHeader::parse(record)?;
    let computed = record_crc(record);
    if computed != header.crc {
        return Err(Error::BadRecordCrc {
            lsn,
            expected: header.crc,
            computed,
        });
    }
    Ok(())
}

/// Compression method of a full-page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCompression {
    /// Uncompressed
    None,
    /// pglz
    Pglz,
    /// lz4
    Lz4,
    /// zstd
    Zstd,
}

/// A full-page image embedded in a block reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPageImage {
    /// Stored image length (compressed length when compressed).
    pub length: u16,
    /// Offset of the hole within the restored page.
    pub hole_offset: u16,
    /// Length of the hole.
    pub hole_length: u16,
    /// Compression method.
    pub compression: ImageCompression,
    /// Whether redo must apply this image unconditionally.
    pub apply: bool,
    /// Raw stored image bytes.
    pub data: Vec<u8>,
}

/// Relation file locator: tablespace, database, relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelFileLocator {
    /// Tablespace oid.
    pub spc: u32,
    /// Database oid.
    pub db: u32,
    /// Relation file number.
    pub rel: u32,
}

/// A decoded block reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    /// Block id (position within the record).
    pub id: u8,
    /// Fork number (0 = main).
    pub fork: u8,
    /// Relation, absent when the reference reuses the previous one.
    pub rel: Option<RelFileLocator>,
    /// Block number within the relation fork.
    pub block_number: u32,
    /// Redo will re-initialize the page.
    pub will_init: bool,
    /// Full-page image, when present.
    pub image: Option<FullPageImage>,
    /// Block data, when present.
    pub data: Vec<u8>,
}

/// A fully decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// LSN of the first byte of the record.
    pub lsn: Lsn,
    /// Fixed header.
    pub header: RecordHeader,
    /// Block references, in record order.
    pub blocks: Vec<BlockRef>,
    /// Main data.
    pub main_data: Vec<u8>,
    /// Replication origin, when recorded.
    pub origin: Option<u16>,
    /// Top-level transaction id, when recorded.
    pub toplevel_xid: Option<u32>,
}

impl DecodedRecord {
    /// Total stored full-page-image bytes in this record.
    pub fn fpi_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .filter_map(|b| b.image.as_ref())
            .map(|i| i.length as u64)
            .sum()
    }

    /// Total record length on disk.
    pub fn total_len(&self) -> u64 {
        self.header.tot_len as u64
    }

    /// Decode an assembled record. The CRC must already be verified.
    pub fn decode(record: &[u8], lsn: Lsn, version: u32) -> Result<DecodedRecord> {
        let header = RecordHeader::parse(record)?;
        if header.tot_len as usize != record.len() {
            return Err(Error::format(format!(
                "record length {} does not match assembled {} bytes",
                header.tot_len,
                record.len()
            )));
        }

        let payload = &record[RECORD_HEADER_SIZE..];
        let mut pos = 0usize;
        let mut blocks: Vec<BlockRef> = Vec::new();
        let mut data_lens: Vec<usize> = Vec::new();
        let mut main_data_len: Option<usize> = None;
        let mut origin = None;
        let mut toplevel_xid = None;

        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            if *pos + n > payload.len() {
                return Err(Error::format("record payload truncated in block headers"));
            }
            let slice = &payload[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };

        // Header section: block headers run until the remaining payload is
        // exactly the data claimed by the headers read so far.
        let mut datatotal = 0usize;
        while payload.len() - pos > datatotal {
            let block_id = take(&mut pos, 1)?[0];
            match block_id {
                BLOCK_ID_DATA_SHORT => {
                    if main_data_len.is_some() {
                        return Err(Error::format("duplicate main-data block"));
                    }
                    let len = take(&mut pos, 1)?[0] as usize;
                    main_data_len = Some(len);
                    datatotal += len;
                }
                BLOCK_ID_DATA_LONG => {
                    if main_data_len.is_some() {
                        return Err(Error::format("duplicate main-data block"));
                    }
                    let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
                    main_data_len = Some(len);
                    datatotal += len;
                }
                BLOCK_ID_ORIGIN => {
                    origin = Some(u16::from_le_bytes(take(&mut pos, 2)?.try_into().unwrap()));
                }
                BLOCK_ID_TOPLEVEL_XID => {
                    toplevel_xid =
                        Some(u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()));
                }
                id if id <= MAX_BLOCK_ID => {
                    let (block, image_len, data_len) =
                        Self::decode_block_header(payload, &mut pos, id, version)?;
                    datatotal += image_len + data_len;
                    data_lens.push(data_len);
                    blocks.push(block);
                }
                other => {
                    return Err(Error::format(format!(
                        "unknown block id 0x{:02X}",
                        other
                    )));
                }
            }
        }
        if payload.len() - pos != datatotal {
            return Err(Error::format(
                "block headers overran the record payload",
            ));
        }

        // Payload section: images then data per block, then main data.
        for (block, data_len) in blocks.iter_mut().zip(data_lens) {
            if let Some(image) = &mut block.image {
                let bytes = take(&mut pos, image.length as usize)?;
                image.data = bytes.to_vec();
            }
            if data_len > 0 {
                block.data = take(&mut pos, data_len)?.to_vec();
            }
        }
        let main_data = match main_data_len {
            Some(len) => take(&mut pos, len)?.to_vec(),
            None => Vec::new(),
        };

        if pos != payload.len() {
            return Err(Error::format(format!(
                "record has {} trailing bytes after payload",
                payload.len() - pos
            )));
        }

        Ok(DecodedRecord {
            lsn,
            header,
            blocks,
            main_data,
            origin,
            toplevel_xid,
        })
    }

    /// Decode one block-reference header. Returns the block plus its
    /// declared image and data lengths.
    fn decode_block_header(
        payload: &[u8],
        pos: &mut usize,
        id: u8,
        version: u32,
    ) -> Result<(BlockRef, usize, usize)> {
        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            if *pos + n > payload.len() {
                return Err(Error::format("block header truncated"));
            }
            let slice = &payload[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };

        let fork_flags = take(pos, 1)?[0];
        let fork = fork_flags & 0x0F;
        let has_image = fork_flags & BKPBLOCK_HAS_IMAGE != 0;
        let has_data = fork_flags & BKPBLOCK_HAS_DATA != 0;
        let will_init = fork_flags & BKPBLOCK_WILL_INIT != 0;
        let same_rel = fork_flags & BKPBLOCK_SAME_REL != 0;

        let data_len = u16::from_le_bytes(take(pos, 2)?.try_into().unwrap()) as usize;
        if has_data != (data_len > 0) {
            return Err(Error::format("block data flag disagrees with length"));
        }

        let mut image = None;
        let mut image_len = 0usize;
        if has_image {
            let length = u16::from_le_bytes(take(pos, 2)?.try_into().unwrap());
            let hole_offset = u16::from_le_bytes(take(pos, 2)?.try_into().unwrap());
            let bimg_info = take(pos, 1)?[0];
            let has_hole = bimg_info & BKPIMAGE_HAS_HOLE != 0;

            // The compression bits moved in version 15.
            let (compression, apply) = if version >= 15 {
                let compression = if bimg_info & 0x04 != 0 {
                    ImageCompression::Pglz
                } else if bimg_info & 0x08 != 0 {
                    ImageCompression::Lz4
                } else if bimg_info & 0x10 != 0 {
                    ImageCompression::Zstd
                } else {
                    ImageCompression::None
                };
                (compression, bimg_info & 0x02 != 0)
            } else {
                let compression = if bimg_info & 0x02 != 0 {
                    ImageCompression::Pglz
                } else {
                    ImageCompression::None
                };
                (compression, bimg_info & 0x04 != 0)
            };

            let compressed = compression != ImageCompression::None;
            let hole_length = if has_hole && compressed {
                u16::from_le_bytes(take(pos, 2)?.try_into().unwrap())
            } else if has_hole {
                BLOCK_SIZE as u16 - length
            } else {
                0
            };
            if !has_hole && hole_offset != 0 {
                return Err(Error::format("image hole offset without hole flag"));
            }

            image_len = length as usize;
            image = Some(FullPageImage {
                length,
                hole_offset,
                hole_length,
                compression,
                apply,
                data: Vec::new(),
            });
        }

        let rel = if same_rel {
            None
        } else {
            Some(RelFileLocator {
                spc: u32::from_le_bytes(take(pos, 4)?.try_into().unwrap()),
                db: u32::from_le_bytes(take(pos, 4)?.try_into().unwrap()),
                rel: u32::from_le_bytes(take(pos, 4)?.try_into().unwrap()),
            })
        };
        let block_number = u32::from_le_bytes(take(pos, 4)?.try_into().unwrap());

        Ok((
            BlockRef {
                id,
                fork,
                rel,
                block_number,
                will_init,
                image,
                data: Vec::new(),
            },
            image_len,
            data_len,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordSpec;

    #[test]
    fn test_header_roundtrip() {
        let header = RecordHeader {
            tot_len: 100,
            xid: 742,
            prev: Lsn::new(0, 0x28),
            info: 0x20,
            rmid: 10,
            crc: 0xAABBCCDD,
        };
        let parsed = RecordHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_encode_decode_simple_record() {
        let bytes = RecordSpec::new(10, 742).main_data(b"hello world".to_vec()).encode(Lsn(0));
        verify_crc(&bytes, Lsn(0x28)).unwrap();

        let record = DecodedRecord::decode(&bytes, Lsn(0x28), 16).unwrap();
        assert_eq!(record.header.xid, 742);
        assert_eq!(record.header.rmid, 10);
        assert_eq!(record.main_data, b"hello world");
        assert!(record.blocks.is_empty());
    }

    #[test]
    fn test_encode_decode_block_reference() {
        let bytes = RecordSpec::new(10, 7)
            .block(0, (1663, 16384, 16385), 42, b"tuple".to_vec())
            .main_data(vec![1, 2, 3])
            .encode(Lsn(0));

        let record = DecodedRecord::decode(&bytes, Lsn(0), 16).unwrap();
        assert_eq!(record.blocks.len(), 1);
        let block = &record.blocks[0];
        assert_eq!(block.block_number, 42);
        assert_eq!(block.rel.unwrap().db, 16384);
        assert_eq!(block.data, b"tuple");
        assert_eq!(record.main_data, vec![1, 2, 3]);
    }

    #[test]
    fn test_encode_decode_full_page_image() {
        let image = vec![0xAB; 4096];
        let bytes = RecordSpec::new(10, 7)
            .block_with_image(0, (1663, 1, 2), 3, image.clone(), 2048, 4096)
            .encode(Lsn(0));

        let record = DecodedRecord::decode(&bytes, Lsn(0), 16).unwrap();
        let img = record.blocks[0].image.as_ref().unwrap();
        assert_eq!(img.length as usize, image.len());
        assert_eq!(img.hole_offset, 2048);
        assert_eq!(img.hole_length, 4096);
        assert_eq!(img.data, image);
        assert_eq!(record.fpi_bytes(), 4096);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let mut bytes = RecordSpec::new(0, 1).main_data(vec![9; 40]).encode(Lsn(0));
        assert!(verify_crc(&bytes, Lsn(0)).is_ok());

        bytes[30] ^= 0x01;
        let err = verify_crc(&bytes, Lsn(0x1000)).unwrap_err();
        match err {
            pgharbor_core::Error::BadRecordCrc { lsn, .. } => assert_eq!(lsn, Lsn(0x1000)),
            other => panic!("expected BadRecordCrc, got {other:?}"),
        }
    }

    #[test]
    fn test_origin_and_toplevel_xid() {
        let bytes = RecordSpec::new(1, 9)
            .origin(7)
            .toplevel_xid(99)
            .main_data(vec![1])
            .encode(Lsn(0));
        let record = DecodedRecord::decode(&bytes, Lsn(0), 16).unwrap();
        assert_eq!(record.origin, Some(7));
        assert_eq!(record.toplevel_xid, Some(99));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let bytes = RecordSpec::new(1, 9).main_data(vec![1; 50]).encode(Lsn(0));
        // Claimed length no longer matches the slice.
        assert!(DecodedRecord::decode(&bytes[..bytes.len() - 4], Lsn(0), 16).is_err());
    }
}
