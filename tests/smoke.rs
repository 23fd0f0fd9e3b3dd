//! Cross-crate smoke test: configuration through supervisor dispatch.

use pgharbor::config;
use pgharbor::engine::protocol::{Category, Request, Status};
use pgharbor::engine::supervisor::{Supervisor, UpstreamFactory};
use pgharbor::engine::upstream::{LocalUpstream, SystemInfo, Upstream};
use pgharbor::Lsn;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn parse_config_and_serve_one_backup() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("PG_VERSION"), b"16\n").unwrap();
    std::fs::write(data.join("pg_control"), vec![1; 64]).unwrap();

    let ini = format!(
        "[main]\nbase_dir = {}\nworkspace = {}\ncompression = zstd\n\n\
         [server primary]\nhost = localhost\nport = 5432\nuser = repl\n",
        dir.path().join("base").display(),
        dir.path().join("ws").display(),
    );
    let cfg = config::parse(&ini).unwrap();
    assert_eq!(cfg.servers[0].name, "primary");

    let factory: UpstreamFactory = {
        let data = data.clone();
        let wal = dir.path().join("wal");
        Arc::new(move |_server| {
            Arc::new(LocalUpstream::new(
                data.clone(),
                wal.clone(),
                SystemInfo {
                    system_id: 9,
                    major_version: 16,
                    minor_version: 2,
                    timeline: 1,
                    write_lsn: Lsn::new(0, 0x500),
                },
            )) as Arc<dyn Upstream>
        })
    };
    let supervisor = Supervisor::new(cfg, factory);

    let response = supervisor.handle_request(Request::new(Category::Backup).server("primary"));
    assert_eq!(response.status, Status::Success, "{:?}", response.error);

    let response = supervisor.handle_request(Request::new(Category::ListBackup).server("primary"));
    assert_eq!(response.data["backups"].as_array().unwrap().len(), 1);
}
