//! Segment naming.
//!
//! A segment file is named by 24 hex characters: timeline, log number, and
//! segment-within-log, 8 digits each. Suffixes layer in a fixed order:
//! `.partial` (not yet closed), then a compression suffix, then `.aes`
//! (encrypted). All layered forms are accepted.

use crate::DEFAULT_SEGMENT_SIZE;
use pgharbor_core::{Error, Lsn, Result};

/// Segments per 4 GiB log file for a given segment size.
fn segments_per_log(segment_size: u64) -> u64 {
    0x1_0000_0000 / segment_size
}

/// A parsed WAL segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SegmentName {
    /// Timeline identifier.
    pub timeline: u32,
    /// Linear segment number within the timeline.
    pub segno: u64,
}

impl SegmentName {
    /// Segment containing the given LSN.
    pub fn for_lsn(timeline: u32, lsn: Lsn, segment_size: u64) -> Self {
        SegmentName {
            timeline,
            segno: lsn.segment_number(segment_size),
        }
    }

    /// First LSN covered by this segment.
    pub fn start_lsn(&self, segment_size: u64) -> Lsn {
        Lsn(self.segno * segment_size)
    }

    /// The next segment on the same timeline.
    pub fn successor(&self) -> SegmentName {
        SegmentName {
            timeline: self.timeline,
            segno: self.segno + 1,
        }
    }

    /// Canonical 24-hex-character file name.
    pub fn file_name(&self, segment_size: u64) -> String {
        let per_log = segments_per_log(segment_size);
        format!(
            "{:08X}{:08X}{:08X}",
            self.timeline,
            self.segno / per_log,
            self.segno % per_log
        )
    }
}

/// A segment file name with its suffix layering decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSegmentFile {
    /// Timeline and segment number.
    pub name: SegmentName,
    /// `.partial` suffix present (segment not yet closed upstream).
    pub partial: bool,
    /// Compression suffix (`zstd`, `lz4`, `gz`, `bz2`), if present.
    pub compression: Option<String>,
    /// `.aes` suffix present.
    pub encrypted: bool,
}

/// Whether a base name is exactly 24 hex characters.
pub fn is_segment_base_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse a segment file name, accepting the layered suffix forms.
///
/// Layering order is `.partial` then compression then `.aes`; suffixes out
/// of order are rejected.
pub fn parse_file_name(file_name: &str, segment_size: u64) -> Result<ParsedSegmentFile> {
    let mut rest = file_name;

    let encrypted = match rest.strip_suffix(".aes") {
        Some(r) => {
            rest = r;
            true
        }
        None => false,
    };

    let mut compression = None;
    for ext in ["zstd", "lz4", "gz", "bz2"] {
        if let Some(r) = rest.strip_suffix(&format!(".{}", ext)) {
            rest = r;
            compression = Some(ext.to_string());
            break;
        }
    }

    let partial = match rest.strip_suffix(".partial") {
        Some(r) => {
            rest = r;
            true
        }
        None => false,
    };

    if !is_segment_base_name(rest) {
        return Err(Error::format(format!(
            "'{}' is not a WAL segment file name",
            file_name
        )));
    }

    let timeline = u32::from_str_radix(&rest[0..8], 16)
        .map_err(|_| Error::format(format!("bad timeline in '{}'", file_name)))?;
    let log = u64::from_str_radix(&rest[8..16], 16)
        .map_err(|_| Error::format(format!("bad log number in '{}'", file_name)))?;
    let seg = u64::from_str_radix(&rest[16..24], 16)
        .map_err(|_| Error::format(format!("bad segment number in '{}'", file_name)))?;

    let per_log = segments_per_log(segment_size);
    if seg >= per_log {
        return Err(Error::format(format!(
            "segment number {:08X} out of range for segment size {}",
            seg, segment_size
        )));
    }

    Ok(ParsedSegmentFile {
        name: SegmentName {
            timeline,
            segno: log * per_log + seg,
        },
        partial,
        compression,
        encrypted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_roundtrip() {
        let name = SegmentName {
            timeline: 1,
            segno: 5,
        };
        let file = name.file_name(DEFAULT_SEGMENT_SIZE);
        assert_eq!(file, "000000010000000000000005");

        let parsed = parse_file_name(&file, DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(parsed.name, name);
        assert!(!parsed.partial);
        assert!(parsed.compression.is_none());
        assert!(!parsed.encrypted);
    }

    #[test]
    fn test_log_boundary() {
        // 16 MiB segments: 256 per 4 GiB log.
        let name = SegmentName {
            timeline: 1,
            segno: 256,
        };
        assert_eq!(
            name.file_name(DEFAULT_SEGMENT_SIZE),
            "000000010000000100000000"
        );
        let parsed =
            parse_file_name("000000010000000100000000", DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(parsed.name.segno, 256);
    }

    #[test]
    fn test_suffix_layering() {
        let parsed =
            parse_file_name("000000010000000000000001.partial", DEFAULT_SEGMENT_SIZE).unwrap();
        assert!(parsed.partial);

        let parsed =
            parse_file_name("000000010000000000000001.zstd", DEFAULT_SEGMENT_SIZE).unwrap();
        assert_eq!(parsed.compression.as_deref(), Some("zstd"));

        let parsed = parse_file_name(
            "000000010000000000000001.partial.lz4.aes",
            DEFAULT_SEGMENT_SIZE,
        )
        .unwrap();
        assert!(parsed.partial);
        assert_eq!(parsed.compression.as_deref(), Some("lz4"));
        assert!(parsed.encrypted);
    }

    #[test]
    fn test_suffixes_out_of_order_rejected() {
        // .aes must be outermost; .partial innermost.
        assert!(parse_file_name(
            "000000010000000000000001.aes.zstd",
            DEFAULT_SEGMENT_SIZE
        )
        .is_err());
        assert!(parse_file_name(
            "000000010000000000000001.zstd.partial",
            DEFAULT_SEGMENT_SIZE
        )
        .is_err());
    }

    #[test]
    fn test_rejects_non_segment_names() {
        assert!(parse_file_name("backup_label", DEFAULT_SEGMENT_SIZE).is_err());
        assert!(parse_file_name("00000001000000000000000G", DEFAULT_SEGMENT_SIZE).is_err());
        assert!(parse_file_name("0000000100000000000001", DEFAULT_SEGMENT_SIZE).is_err());
        // Segment-within-log field beyond the per-log count.
        assert!(parse_file_name("0000000100000000000001FF", DEFAULT_SEGMENT_SIZE).is_err());
    }

    #[test]
    fn test_successor_and_lsn() {
        let name = SegmentName {
            timeline: 2,
            segno: 7,
        };
        assert_eq!(name.successor().segno, 8);
        assert_eq!(
            name.start_lsn(DEFAULT_SEGMENT_SIZE),
            Lsn(7 * DEFAULT_SEGMENT_SIZE)
        );
        assert_eq!(
            SegmentName::for_lsn(2, Lsn(7 * DEFAULT_SEGMENT_SIZE + 100), DEFAULT_SEGMENT_SIZE),
            name
        );
    }
}
