//! Retention policy evaluation.
//!
//! Buckets are {days, weeks, months, years}. Walking newest to oldest,
//! each bucket with a positive count claims up to that many not-yet-claimed
//! backups, one per distinct calendar period of the bucket. A backup
//! flagged keep never loses; ancestors of survivors are retained so no
//! incremental chain loses its base. WAL older than the oldest survivor's
//! start position becomes eligible for deletion.

use crate::info::BackupInfo;
use chrono::{DateTime, Datelike, Utc};
use pgharbor_config::Retention;
use pgharbor_core::Lsn;
use pgharbor_wal::segment::parse_file_name;
use pgharbor_core::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// One backup as seen by the retention sweep.
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    /// Backup label.
    pub label: String,
    /// End time of the backup.
    pub end_time: DateTime<Utc>,
    /// Keep flag: immune to retention.
    pub keep: bool,
    /// Parent label for incremental backups.
    pub parent: Option<String>,
    /// Start LSN, for WAL eligibility.
    pub start_lsn: Lsn,
}

impl RetentionCandidate {
    /// Build from a loaded backup info, deriving the end time from the
    /// label.
    pub fn from_info(info: &BackupInfo) -> Result<RetentionCandidate> {
        Ok(RetentionCandidate {
            label: info.label.clone(),
            end_time: crate::info::label_timestamp(&info.label)?,
            keep: info.keep,
            parent: info.parent.clone(),
            start_lsn: info.start_lsn,
        })
    }
}

fn period_key(bucket: usize, at: DateTime<Utc>) -> String {
    match bucket {
        0 => format!("{}", at.format("%Y-%m-%d")),
        1 => {
            let week = at.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        2 => format!("{}", at.format("%Y-%m")),
        _ => format!("{}", at.year()),
    }
}

/// Compute the surviving labels under a policy.
///
/// Candidates may arrive in any order. Survivors include keep-flagged
/// backups and every ancestor of a survivor.
pub fn compute_survivors(policy: &Retention, candidates: &[RetentionCandidate]) -> HashSet<String> {
    let mut sorted: Vec<&RetentionCandidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.end_time.cmp(&a.end_time));

    let mut survivors: HashSet<String> = candidates
        .iter()
        .filter(|c| c.keep)
        .map(|c| c.label.clone())
        .collect();

    let counts = [policy.days, policy.weeks, policy.months, policy.years];
    for (bucket, count) in counts.iter().enumerate() {
        let Some(count) = count else { continue };
        let mut periods_used: HashSet<String> = HashSet::new();
        for candidate in &sorted {
            if periods_used.len() >= *count as usize {
                break;
            }
            if survivors.contains(&candidate.label) {
                continue;
            }
            let key = period_key(bucket, candidate.end_time);
            if periods_used.insert(key) {
                survivors.insert(candidate.label.clone());
            }
        }
    }

    // Chains: an incremental survivor needs its whole ancestry.
    let by_label: std::collections::HashMap<&str, &RetentionCandidate> =
        candidates.iter().map(|c| (c.label.as_str(), c)).collect();
    let mut frontier: Vec<String> = survivors.iter().cloned().collect();
    while let Some(label) = frontier.pop() {
        if let Some(candidate) = by_label.get(label.as_str()) {
            if let Some(parent) = &candidate.parent {
                if survivors.insert(parent.clone()) {
                    frontier.push(parent.clone());
                }
            }
        }
    }

    survivors
}

/// The oldest start position any survivor still needs.
///
/// WAL strictly before this LSN's segment is eligible for deletion. `None`
/// when nothing survives (delete no WAL).
pub fn wal_cutoff(
    candidates: &[RetentionCandidate],
    survivors: &HashSet<String>,
) -> Option<Lsn> {
    candidates
        .iter()
        .filter(|c| survivors.contains(&c.label))
        .map(|c| c.start_lsn)
        .min()
}

/// WAL file names in `wal_dir` whose whole segment lies before the cutoff.
///
/// The prefix property of archived WAL makes this deletion atomic: every
/// returned segment is strictly older than anything a survivor needs.
pub fn eligible_wal_files(
    wal_dir: &Path,
    cutoff: Lsn,
    segment_size: u64,
) -> Result<Vec<String>> {
    let cutoff_segno = cutoff.segment_number(segment_size);
    let mut eligible = Vec::new();
    let entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(wal_dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(wal_dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(parsed) = parse_file_name(&name, segment_size) {
            if !parsed.partial && parsed.name.segno + 1 <= cutoff_segno {
                eligible.push(name);
            }
        }
    }
    eligible.sort();
    Ok(eligible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn daily_candidates(n: usize) -> Vec<RetentionCandidate> {
        // Newest is 2026-08-01 12:00, then one per day backwards.
        (0..n)
            .map(|i| {
                let end = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
                    - chrono::Duration::days(i as i64);
                RetentionCandidate {
                    label: format!("b{}", i),
                    end_time: end,
                    keep: false,
                    parent: None,
                    start_lsn: Lsn((100 - i as u64) * 0x1000),
                }
            })
            .collect()
    }

    #[test]
    fn test_nine_dailies_with_2_1_1() {
        let policy: Retention = "2,1,1,-".parse().unwrap();
        let candidates = daily_candidates(9);
        let survivors = compute_survivors(&policy, &candidates);

        // Two dailies, one weekly representative, one monthly
        // representative: four distinct survivors.
        assert_eq!(survivors.len(), 4, "{survivors:?}");
        assert!(survivors.contains("b0"));
        assert!(survivors.contains("b1"));
    }

    #[test]
    fn test_survivor_count_bounded_by_policy() {
        let policy: Retention = "3,2,1,1".parse().unwrap();
        let candidates = daily_candidates(30);
        let survivors = compute_survivors(&policy, &candidates);
        assert!(survivors.len() as u32 <= policy.max_survivors());
    }

    #[test]
    fn test_keep_flag_always_survives() {
        let policy: Retention = "1,-,-,-".parse().unwrap();
        let mut candidates = daily_candidates(5);
        candidates[4].keep = true;

        let survivors = compute_survivors(&policy, &candidates);
        assert!(survivors.contains("b0"));
        assert!(survivors.contains("b4"));
    }

    #[test]
    fn test_disabled_policy_keeps_nothing_but_keeps() {
        let policy: Retention = "-,-,-,-".parse().unwrap();
        let candidates = daily_candidates(3);
        let survivors = compute_survivors(&policy, &candidates);
        assert!(survivors.is_empty());
    }

    #[test]
    fn test_chain_ancestors_survive() {
        let policy: Retention = "1,-,-,-".parse().unwrap();
        let mut candidates = daily_candidates(3);
        // b0 (newest) is an incremental on b1, which is incremental on b2.
        candidates[0].parent = Some("b1".to_string());
        candidates[1].parent = Some("b2".to_string());

        let survivors = compute_survivors(&policy, &candidates);
        assert!(survivors.contains("b0"));
        assert!(survivors.contains("b1"));
        assert!(survivors.contains("b2"));
    }

    #[test]
    fn test_wal_cutoff_is_oldest_survivor_start() {
        let policy: Retention = "2,-,-,-".parse().unwrap();
        let candidates = daily_candidates(5);
        let survivors = compute_survivors(&policy, &candidates);
        let cutoff = wal_cutoff(&candidates, &survivors).unwrap();
        // b1 is the older of the two survivors.
        assert_eq!(cutoff, Lsn(99 * 0x1000));
    }

    #[test]
    fn test_eligible_wal_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
            "000000010000000000000003",
            "000000010000000000000004.partial",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        // Cutoff inside segment 3: segments 1 and 2 are eligible.
        let seg = pgharbor_wal::DEFAULT_SEGMENT_SIZE;
        let cutoff = Lsn(3 * seg + 5);
        let eligible = eligible_wal_files(dir.path(), cutoff, seg).unwrap();
        assert_eq!(
            eligible,
            vec![
                "000000010000000000000001".to_string(),
                "000000010000000000000002".to_string()
            ]
        );
    }
}
