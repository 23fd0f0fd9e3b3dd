//! Compression codecs.
//!
//! The pipeline calls codecs through an opaque {encode, decode} abstraction
//! selected by the configured algorithm tag. Levels arrive already clamped
//! by the configuration layer. bzip2 parses in the configuration for
//! compatibility but has no in-tree binding; selecting it fails when the
//! workflow is assembled.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use pgharbor_config::{Compression, CompressionFamily};
use pgharbor_core::{Error, Result};
use std::io::{Read, Write};

/// A compression codec.
pub trait Codec: Send + Sync {
    /// Algorithm tag.
    fn name(&self) -> &'static str;

    /// File suffix appended to encoded artifacts; empty for none.
    fn suffix(&self) -> &'static str;

    /// Compress a buffer.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress a buffer.
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through codec.
pub struct NoCodec;

impl Codec for NoCodec {
    fn name(&self) -> &'static str {
        "none"
    }

    fn suffix(&self) -> &'static str {
        ""
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// gzip codec.
pub struct GzipCodec {
    /// Compression level, 1..=9.
    pub level: u32,
}

impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn suffix(&self) -> &'static str {
        "gz"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| Error::format(format!("gzip encode failed: {}", e)))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::format(format!("gzip decode failed: {}", e)))?;
        Ok(out)
    }
}

/// zstd codec.
pub struct ZstdCodec {
    /// Compression level.
    pub level: i32,
}

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn suffix(&self) -> &'static str {
        "zstd"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| Error::format(format!("zstd encode failed: {}", e)))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| Error::format(format!("zstd decode failed: {}", e)))
    }
}

/// lz4 codec (size-prefixed frame).
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn suffix(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::format(format!("lz4 decode failed: {}", e)))
    }
}

/// Build the codec for a configured algorithm and (clamped) level.
pub fn for_compression(compression: Compression, level: i32) -> Result<Box<dyn Codec>> {
    match compression.family() {
        CompressionFamily::None => Ok(Box::new(NoCodec)),
        CompressionFamily::Gzip => Ok(Box::new(GzipCodec {
            level: level.clamp(1, 9) as u32,
        })),
        CompressionFamily::Zstd => Ok(Box::new(ZstdCodec { level })),
        CompressionFamily::Lz4 => Ok(Box::new(Lz4Codec)),
        CompressionFamily::Bz2 => Err(Error::config(
            "bz2 requires the external bzip2 binding, which is not present in this build",
        )),
    }
}

/// Find the codec for a file suffix (used on the restore path).
pub fn for_suffix(suffix: &str) -> Result<Box<dyn Codec>> {
    match suffix {
        "" => Ok(Box::new(NoCodec)),
        "gz" => Ok(Box::new(GzipCodec { level: 6 })),
        "zstd" => Ok(Box::new(ZstdCodec { level: 3 })),
        "lz4" => Ok(Box::new(Lz4Codec)),
        other => Err(Error::format(format!("unknown codec suffix '{}'", other))),
    }
}
