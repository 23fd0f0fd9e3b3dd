//! Per-resource-manager summarization.
//!
//! Accumulates record counts, record bytes, full-page-image bytes, and
//! combined bytes per resource manager, and renders a totals table with
//! two-decimal percentages.

use crate::reader::WalReader;
use crate::record::DecodedRecord;
use crate::rmgr::ResourceManager;
use pgharbor_core::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    count: u64,
    record_bytes: u64,
    fpi_bytes: u64,
}

impl Bucket {
    fn combined(&self) -> u64 {
        self.record_bytes + self.fpi_bytes
    }
}

/// Summary accumulator over decoded records.
#[derive(Debug, Default)]
pub struct Summary {
    buckets: BTreeMap<String, Bucket>,
}

impl Summary {
    /// An empty summary.
    pub fn new() -> Self {
        Summary::default()
    }

    /// Add one record.
    pub fn add(&mut self, record: &DecodedRecord, rm: ResourceManager) {
        let bucket = self.buckets.entry(rm.name().into_owned()).or_default();
        bucket.count += 1;
        let fpi = record.fpi_bytes();
        bucket.fpi_bytes += fpi;
        bucket.record_bytes += record.total_len() - fpi;
    }

    /// Summarize a whole segment file.
    pub fn of_segment(path: &Path) -> Result<Summary> {
        let mut reader = WalReader::open(path)?;
        let version = reader.version();
        let mut summary = Summary::new();
        while let Some(record) = reader.next_record()? {
            let rm = ResourceManager::from_id(record.header.rmid, version)?;
            summary.add(&record, rm);
        }
        Ok(summary)
    }

    /// Total record count across all managers.
    pub fn total_count(&self) -> u64 {
        self.buckets.values().map(|b| b.count).sum()
    }

    /// Total combined bytes across all managers.
    pub fn total_combined(&self) -> u64 {
        self.buckets.values().map(|b| b.combined()).sum()
    }

    /// Render the totals table.
    pub fn render(&self, out: &mut impl Write) -> Result<()> {
        let total_count = self.total_count().max(1);
        let total_record: u64 = self.buckets.values().map(|b| b.record_bytes).sum();
        let total_fpi: u64 = self.buckets.values().map(|b| b.fpi_bytes).sum();
        let total_combined = self.total_combined().max(1);

        let pct = |part: u64, whole: u64| 100.0 * part as f64 / whole.max(1) as f64;

        writeln!(
            out,
            "{:<18} {:>9} {:>8} {:>14} {:>8} {:>10} {:>8} {:>14} {:>10}",
            "Type", "N", "N(%)", "Record size", "(%)", "FPI size", "(%)", "Combined size", "(%)"
        )
        .map_err(io_err)?;

        for (name, bucket) in &self.buckets {
            writeln!(
                out,
                "{:<18} {:>9} {:>7.2}% {:>14} {:>7.2}% {:>10} {:>7.2}% {:>14} {:>9.2}%",
                name,
                bucket.count,
                pct(bucket.count, total_count),
                bucket.record_bytes,
                pct(bucket.record_bytes, total_record),
                bucket.fpi_bytes,
                pct(bucket.fpi_bytes, total_fpi),
                bucket.combined(),
                pct(bucket.combined(), total_combined),
            )
            .map_err(io_err)?;
        }

        writeln!(
            out,
            "{:<18} {:>9} {:>8} {:>14} {:>8} {:>10} {:>8} {:>14} {:>10}",
            "Total",
            self.total_count(),
            "",
            total_record,
            "",
            total_fpi,
            "",
            self.total_combined(),
            ""
        )
        .map_err(io_err)?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> pgharbor_core::Error {
    Error::Io {
        path: Default::default(),
        source: e,
    }
}
