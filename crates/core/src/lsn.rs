//! Log sequence numbers.
//!
//! An LSN is a 64-bit byte offset into the WAL stream, rendered as `HI/LO`
//! where each half is 8 hex digits (`00000001/0A0B0C0D`).

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 64-bit WAL log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN, used as "unset".
    pub const ZERO: Lsn = Lsn(0);

    /// Build an LSN from its high and low 32-bit halves.
    pub const fn new(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }

    /// High 32 bits.
    pub const fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits.
    pub const fn lo(self) -> u32 {
        self.0 as u32
    }

    /// Segment number this LSN falls into, for the given segment size.
    pub const fn segment_number(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }

    /// Byte offset of this LSN within its segment.
    pub const fn segment_offset(self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }

    /// First LSN of the segment containing this LSN.
    pub const fn segment_start(self, segment_size: u64) -> Lsn {
        Lsn(self.0 - (self.0 % segment_size))
    }

    /// Round up to the next 8-byte boundary.
    ///
    /// WAL records always start MAXALIGNed.
    pub const fn align8(self) -> Lsn {
        Lsn((self.0 + 7) & !7)
    }

    /// Add a byte count.
    pub const fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }

    /// Whether this LSN is the zero/unset value.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}/{:08X}", self.hi(), self.lo())
    }
}

/// Parse error for LSN strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN: {0}")]
pub struct ParseLsnError(pub String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    /// Accepts `HI/LO` with each half 1..=8 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| ParseLsnError(s.to_string()))?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(ParseLsnError(s.to_string()));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.to_string()))?;
        Ok(Lsn::new(hi, lo))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl From<Lsn> for u64 {
    fn from(v: Lsn) -> Self {
        v.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct LsnVisitor;

impl Visitor<'_> for LsnVisitor {
    type Value = Lsn;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an LSN string of the form HI/LO")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Lsn, E> {
        v.parse().map_err(de::Error::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Lsn, E> {
        Ok(Lsn(v))
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LsnVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_padded() {
        assert_eq!(Lsn::new(1, 0x28).to_string(), "00000001/00000028");
        assert_eq!(Lsn::ZERO.to_string(), "00000000/00000000");
        assert_eq!(Lsn(u64::MAX).to_string(), "FFFFFFFF/FFFFFFFF");
    }

    #[test]
    fn test_parse_roundtrip() {
        for lsn in [Lsn::ZERO, Lsn::new(1, 0x28), Lsn::new(0xAB, 0xCDEF0123)] {
            assert_eq!(lsn.to_string().parse::<Lsn>().unwrap(), lsn);
        }
        // Unpadded halves are accepted
        assert_eq!("1/28".parse::<Lsn>().unwrap(), Lsn::new(1, 0x28));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("1".parse::<Lsn>().is_err());
        assert!("1/".parse::<Lsn>().is_err());
        assert!("xyz/28".parse::<Lsn>().is_err());
        assert!("123456789/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_segment_arithmetic() {
        let seg_size = 16 * 1024 * 1024;
        let lsn = Lsn::new(0, 16 * 1024 * 1024 + 0x100);
        assert_eq!(lsn.segment_number(seg_size), 1);
        assert_eq!(lsn.segment_offset(seg_size), 0x100);
        assert_eq!(lsn.segment_start(seg_size), Lsn::new(0, 16 * 1024 * 1024));
    }

    #[test]
    fn test_align8() {
        assert_eq!(Lsn(0).align8(), Lsn(0));
        assert_eq!(Lsn(1).align8(), Lsn(8));
        assert_eq!(Lsn(8).align8(), Lsn(8));
        assert_eq!(Lsn(9).align8(), Lsn(16));
    }

    #[test]
    fn test_ordering() {
        assert!(Lsn::new(0, 5) < Lsn::new(0, 6));
        assert!(Lsn::new(1, 0) > Lsn::new(0, u32::MAX));
    }

    #[test]
    fn test_serde_as_string() {
        let lsn = Lsn::new(2, 0x1000);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"00000002/00001000\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
