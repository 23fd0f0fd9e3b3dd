//! Record filtering and description output.
//!
//! The describer restricts records by resource-manager name, LSN range,
//! transaction id, and included objects (schema-qualified names resolved
//! through an OID mapping loaded from JSON). Output is either a human table
//! with per-column widths precomputed on a first pass, or line-delimited
//! JSON.

use crate::reader::WalReader;
use crate::record::DecodedRecord;
use crate::rmgr::ResourceManager;
use pgharbor_core::{Error, Lsn, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;

/// OID → schema-qualified-name mapping.
///
/// Loaded from a JSON object of the form `{"16385": "public.users"}`.
#[derive(Debug, Default, Clone)]
pub struct OidMap {
    map: HashMap<u32, String>,
}

impl OidMap {
    /// Load the mapping from a JSON file.
    pub fn load(path: &Path) -> Result<OidMap> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let raw: HashMap<String, String> = serde_json::from_str(&text)?;
        let mut map = HashMap::with_capacity(raw.len());
        for (oid, name) in raw {
            let oid: u32 = oid
                .parse()
                .map_err(|_| Error::format(format!("bad oid '{}' in mapping", oid)))?;
            map.insert(oid, name);
        }
        Ok(OidMap { map })
    }

    /// Insert one mapping entry.
    pub fn insert(&mut self, oid: u32, name: impl Into<String>) {
        self.map.insert(oid, name.into());
    }

    /// Resolve an oid.
    pub fn name(&self, oid: u32) -> Option<&str> {
        self.map.get(&oid).map(String::as_str)
    }
}

/// Filter predicate over decoded records.
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
    rmgrs: Option<HashSet<String>>,
    start_lsn: Option<Lsn>,
    end_lsn: Option<Lsn>,
    xids: Option<HashSet<u32>>,
    included_objects: Option<HashSet<String>>,
    oid_map: OidMap,
}

impl RecordFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        RecordFilter::default()
    }

    /// Restrict to the given resource-manager names (case-insensitive).
    pub fn rmgrs<I: IntoIterator<Item = S>, S: AsRef<str>>(mut self, names: I) -> Self {
        self.rmgrs = Some(
            names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Restrict to records at or after this LSN.
    pub fn start_lsn(mut self, lsn: Lsn) -> Self {
        self.start_lsn = Some(lsn);
        self
    }

    /// Restrict to records before this LSN.
    pub fn end_lsn(mut self, lsn: Lsn) -> Self {
        self.end_lsn = Some(lsn);
        self
    }

    /// Restrict to the given transaction ids.
    pub fn xids<I: IntoIterator<Item = u32>>(mut self, xids: I) -> Self {
        self.xids = Some(xids.into_iter().collect());
        self
    }

    /// Restrict to records touching the named objects, resolved through the
    /// OID mapping.
    pub fn included_objects<I: IntoIterator<Item = S>, S: AsRef<str>>(
        mut self,
        names: I,
        oid_map: OidMap,
    ) -> Self {
        self.included_objects = Some(names.into_iter().map(|n| n.as_ref().to_string()).collect());
        self.oid_map = oid_map;
        self
    }

    /// Whether a record passes the filter.
    pub fn matches(&self, record: &DecodedRecord, rm: ResourceManager) -> bool {
        if let Some(rmgrs) = &self.rmgrs {
            if !rmgrs.contains(&rm.name().to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(start) = self.start_lsn {
            if record.lsn < start {
                return false;
            }
        }
        if let Some(end) = self.end_lsn {
            if record.lsn >= end {
                return false;
            }
        }
        if let Some(xids) = &self.xids {
            if !xids.contains(&record.header.xid) {
                return false;
            }
        }
        if let Some(objects) = &self.included_objects {
            let touches = record.blocks.iter().any(|block| {
                block
                    .rel
                    .and_then(|rel| self.oid_map.name(rel.rel))
                    .map(|name| objects.contains(name))
                    .unwrap_or(false)
            });
            if !touches {
                return false;
            }
        }
        true
    }
}

/// Output format of the describer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned human-readable table.
    Table,
    /// One JSON object per line.
    JsonLines,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    lsn: String,
    prev: String,
    xid: u32,
    rmgr: &'a str,
    subtype: &'a str,
    tot_len: u32,
    fpi_len: u64,
    desc: String,
}

/// One described row, produced by the first pass.
struct Row {
    rmgr: String,
    subtype: &'static str,
    lsn: String,
    prev: String,
    xid: String,
    len: String,
    desc: String,
}

/// Describe the records of one segment file, filtered, to a writer.
///
/// Returns the number of records written. `limit` of 0 means unlimited.
pub fn describe_segment(
    path: &Path,
    filter: &RecordFilter,
    format: OutputFormat,
    limit: u32,
    out: &mut impl Write,
) -> Result<usize> {
    let mut reader = WalReader::open(path)?;
    let version = reader.version();

    // First pass: collect and filter rows, tracking column widths.
    let mut rows = Vec::new();
    let mut written = 0usize;
    while let Some(record) = reader.next_record()? {
        let rm = ResourceManager::from_id(record.header.rmid, version)?;
        if !filter.matches(&record, rm) {
            continue;
        }
        if format == OutputFormat::JsonLines {
            let name = rm.name();
            let line = serde_json::to_string(&JsonRecord {
                lsn: record.lsn.to_string(),
                prev: record.header.prev.to_string(),
                xid: record.header.xid,
                rmgr: name.as_ref(),
                subtype: rm.subtype_name(record.header.info),
                tot_len: record.header.tot_len,
                fpi_len: record.fpi_bytes(),
                desc: rm.describe(&record),
            })?;
            writeln!(out, "{}", line).map_err(|e| Error::io(path, e))?;
            written += 1;
        } else {
            rows.push(Row {
                rmgr: rm.name().into_owned(),
                subtype: rm.subtype_name(record.header.info),
                lsn: record.lsn.to_string(),
                prev: record.header.prev.to_string(),
                xid: record.header.xid.to_string(),
                len: record.header.tot_len.to_string(),
                desc: rm.describe(&record),
            });
            written += 1;
        }
        if limit != 0 && written as u32 >= limit {
            break;
        }
    }

    if format == OutputFormat::JsonLines {
        return Ok(written);
    }

    // Second pass: emit with per-column widths from the collected rows.
    let mut w_rmgr = "RMGR".len();
    let mut w_lsn = "LSN".len();
    let mut w_prev = "PREV".len();
    let mut w_xid = "XID".len();
    let mut w_len = "LEN".len();
    for row in &rows {
        w_rmgr = w_rmgr.max(row.rmgr.len());
        w_lsn = w_lsn.max(row.lsn.len());
        w_prev = w_prev.max(row.prev.len());
        w_xid = w_xid.max(row.xid.len());
        w_len = w_len.max(row.len.len());
    }

    writeln!(
        out,
        "{:<w_rmgr$}  {:<w_lsn$}  {:<w_prev$}  {:>w_xid$}  {:>w_len$}  DESC",
        "RMGR", "LSN", "PREV", "XID", "LEN",
    )
    .map_err(|e| Error::io(path, e))?;
    for row in &rows {
        writeln!(
            out,
            "{:<w_rmgr$}  {:<w_lsn$}  {:<w_prev$}  {:>w_xid$}  {:>w_len$}  {}: {}",
            row.rmgr, row.lsn, row.prev, row.xid, row.len, row.subtype, row.desc,
        )
        .map_err(|e| Error::io(path, e))?;
    }

    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordSpec, SegmentBuilder};
    use crate::PAGE_SIZE;
    use tempfile::tempdir;

    const SEG: u64 = 4 * PAGE_SIZE as u64;

    fn build_mixed_segment(dir: &Path) -> std::path::PathBuf {
        let mut builder = SegmentBuilder::with_segment_size(1, 1, SEG);
        builder.append(
            &RecordSpec::new(ResourceManager::Heap.id(), 742)
                .block(0, (1663, 5, 16385), 1, vec![1, 2])
                .main_data(vec![0, 0, 0]),
        );
        builder.append(
            &RecordSpec::new(ResourceManager::Heap.id(), 743)
                .block(0, (1663, 5, 16386), 2, vec![3])
                .main_data(vec![0, 0, 0]),
        );
        builder.append(
            &RecordSpec::new(ResourceManager::Btree.id(), 742).main_data(vec![9; 8]),
        );
        let names = builder.write_dir(dir).unwrap();
        dir.join(&names[0])
    }

    #[test]
    fn test_filter_by_rmgr_and_xid() {
        let dir = tempdir().unwrap();
        let path = build_mixed_segment(dir.path());

        let filter = RecordFilter::new().rmgrs(["Heap"]).xids([742]);
        let mut out = Vec::new();
        let n = describe_segment(&path, &filter, OutputFormat::Table, 0, &mut out).unwrap();
        assert_eq!(n, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Heap"));
        assert!(text.contains("742"));
        assert!(!text.contains("743"));
        assert!(!text.contains("Btree"));
    }

    #[test]
    fn test_filter_by_lsn_range() {
        let dir = tempdir().unwrap();
        let path = build_mixed_segment(dir.path());

        let all = WalReader::read_all(&path).unwrap();
        let second = all[1].lsn;

        let filter = RecordFilter::new().start_lsn(second);
        let mut out = Vec::new();
        let n = describe_segment(&path, &filter, OutputFormat::Table, 0, &mut out).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_filter_by_included_objects() {
        let dir = tempdir().unwrap();
        let path = build_mixed_segment(dir.path());

        let mut oid_map = OidMap::default();
        oid_map.insert(16385, "public.users");
        let filter = RecordFilter::new().included_objects(["public.users"], oid_map);

        let mut out = Vec::new();
        let n = describe_segment(&path, &filter, OutputFormat::Table, 0, &mut out).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_json_lines_output() {
        let dir = tempdir().unwrap();
        let path = build_mixed_segment(dir.path());

        let mut out = Vec::new();
        let n = describe_segment(
            &path,
            &RecordFilter::new(),
            OutputFormat::JsonLines,
            0,
            &mut out,
        )
        .unwrap();
        assert_eq!(n, 3);

        let text = String::from_utf8(out).unwrap();
        for line in text.lines() {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("lsn").is_some());
            assert!(value.get("rmgr").is_some());
        }
    }

    #[test]
    fn test_limit() {
        let dir = tempdir().unwrap();
        let path = build_mixed_segment(dir.path());

        let mut out = Vec::new();
        let n =
            describe_segment(&path, &RecordFilter::new(), OutputFormat::Table, 2, &mut out)
                .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_oid_map_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oids.json");
        std::fs::write(&path, r#"{"16385": "public.users", "16386": "public.orders"}"#).unwrap();
        let map = OidMap::load(&path).unwrap();
        assert_eq!(map.name(16385), Some("public.users"));
        assert_eq!(map.name(1), None);
    }
}
