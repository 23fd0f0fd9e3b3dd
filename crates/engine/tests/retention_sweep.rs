//! Retention workflow over a directory of labeled backups.

use pgharbor_config::{Config, ServerConfig};
use pgharbor_core::Lsn;
use pgharbor_engine::info::{BackupInfo, Validity};
use pgharbor_engine::ops;
use pgharbor_engine::stages::StageEnv;
use pgharbor_engine::upstream::{LocalUpstream, SystemInfo, Upstream};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn env_with_policy(dir: &TempDir, retention: &str) -> Arc<StageEnv> {
    let mut server = ServerConfig::named("primary");
    server.host = "localhost".to_string();
    let config = Config {
        base_dir: dir.path().join("base"),
        workspace: dir.path().join("workspace"),
        retention: retention.parse().unwrap(),
        servers: vec![server.clone()],
        ..Default::default()
    };
    let upstream = Arc::new(LocalUpstream::new(
        dir.path().join("nowhere/data"),
        dir.path().join("nowhere/wal"),
        SystemInfo {
            system_id: 1,
            major_version: 16,
            minor_version: 0,
            timeline: 1,
            write_lsn: Lsn::ZERO,
        },
    ));
    ops::stage_env(Arc::new(config), &server, upstream as Arc<dyn Upstream>)
}

fn seed_backup(root: &Path, label: &str, keep: bool, start_lsn: Lsn) {
    let dir = root.join(label);
    std::fs::create_dir_all(dir.join("data")).unwrap();
    std::fs::write(dir.join("data/PG_VERSION"), b"16\n").unwrap();
    let mut info = BackupInfo::new(label);
    info.validity = Validity::Valid;
    info.keep = keep;
    info.start_lsn = start_lsn;
    info.end_lsn = start_lsn.add(0x1000);
    info.checkpoint_lsn = start_lsn;
    info.write(&dir).unwrap();
}

/// Nine daily backups under `retention = 2,1,1,-`: two dailies survive
/// plus one weekly and one monthly representative, four in total.
#[test]
fn nine_dailies_keep_four() {
    let dir = TempDir::new().unwrap();
    let env = env_with_policy(&dir, "2,1,1,-");
    let root = env.backup_root();

    // 2026-07-24 .. 2026-08-01, one per day, noon.
    for day in 24..=31 {
        seed_backup(
            &root,
            &format!("202607{:02}120000", day),
            false,
            Lsn((day as u64) * 0x10000),
        );
    }
    seed_backup(&root, "20260801120000", false, Lsn(32 * 0x10000));

    let report = ops::run_retention(env.clone()).unwrap();
    assert_eq!(report.survivors.len(), 4, "{:?}", report.survivors);
    assert!(report.survivors.contains(&"20260801120000".to_string()));
    assert!(report.survivors.contains(&"20260731120000".to_string()));
    assert_eq!(report.deleted.len(), 5);
    assert!(report.failed.is_empty());

    // The losers are gone from disk; the survivors remain.
    for label in &report.deleted {
        assert!(!root.join(label).exists());
    }
    for label in &report.survivors {
        assert!(root.join(label).exists());
    }

    // The summary reflects the surviving set.
    let summary = std::fs::read_to_string(
        env.summary_root().join("backups.list"),
    )
    .unwrap();
    assert_eq!(summary.lines().count(), 4);
}

#[test]
fn keep_flag_survives_any_policy() {
    let dir = TempDir::new().unwrap();
    let env = env_with_policy(&dir, "1,-,-,-");
    let root = env.backup_root();

    seed_backup(&root, "20260801120000", false, Lsn(0x30000));
    seed_backup(&root, "20260725120000", true, Lsn(0x10000));
    seed_backup(&root, "20260726120000", false, Lsn(0x20000));

    let report = ops::run_retention(env).unwrap();
    assert!(report.survivors.contains(&"20260801120000".to_string()));
    assert!(report.survivors.contains(&"20260725120000".to_string()));
    assert!(report.deleted.contains(&"20260726120000".to_string()));
}

#[test]
fn old_wal_is_deleted_with_its_backups() {
    let dir = TempDir::new().unwrap();
    let env = env_with_policy(&dir, "1,-,-,-");
    let root = env.backup_root();
    let wal_dir = env.wal_root();
    std::fs::create_dir_all(&wal_dir).unwrap();

    let seg = pgharbor_wal::DEFAULT_SEGMENT_SIZE;
    // Survivor starts in segment 3; the older backup started in segment 1.
    seed_backup(&root, "20260801120000", false, Lsn(3 * seg + 0x100));
    seed_backup(&root, "20260725120000", false, Lsn(seg + 0x100));

    for name in [
        "000000010000000000000001",
        "000000010000000000000002",
        "000000010000000000000003",
        "000000010000000000000004",
    ] {
        std::fs::write(wal_dir.join(name), b"seg").unwrap();
    }

    ops::run_retention(env).unwrap();

    // Segments before the survivor's start segment are gone; the rest stay.
    assert!(!wal_dir.join("000000010000000000000001").exists());
    assert!(!wal_dir.join("000000010000000000000002").exists());
    assert!(wal_dir.join("000000010000000000000003").exists());
    assert!(wal_dir.join("000000010000000000000004").exists());
}
