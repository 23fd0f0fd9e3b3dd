//! Management supervisor.
//!
//! A single accept loop receives framed requests; each command runs on its
//! own thread with a snapshot of the configuration and the per-server
//! busy-flag state machine enforcing operation exclusion. Long commands
//! never block the loop, and a second command of the same kind on the same
//! server is rejected with `already_in_progress` instead of queueing.

use crate::metrics::MetricsCache;
use crate::ops;
use crate::protocol::{read_frame, write_frame, Category, Request, Response};
use crate::server::{OperationKind, ServerRegistry};
use crate::stages::StageEnv;
use crate::upstream::Upstream;
use pgharbor_config::{parse as config_parse, Config, ConfigHandle, ServerConfig};
use pgharbor_core::{Error, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builds the upstream client for a server.
pub type UpstreamFactory = Arc<dyn Fn(&ServerConfig) -> Arc<dyn Upstream> + Send + Sync>;

/// The management supervisor.
pub struct Supervisor {
    config: ConfigHandle,
    config_path: Option<PathBuf>,
    registry: ServerRegistry,
    metrics: MetricsCache,
    stop: Arc<AtomicBool>,
    upstream_factory: UpstreamFactory,
}

impl Supervisor {
    /// Build a supervisor over an initial configuration.
    pub fn new(config: Config, upstream_factory: UpstreamFactory) -> Supervisor {
        let registry = ServerRegistry::new();
        for server in &config.servers {
            registry.register(&server.name);
        }
        let metrics = MetricsCache::new(config.metrics_cache_max_age, config.metrics_cache_max_size);
        Supervisor {
            config: ConfigHandle::new(config),
            config_path: None,
            registry,
            metrics,
            stop: Arc::new(AtomicBool::new(false)),
            upstream_factory,
        }
    }

    /// Remember the file to parse on `conf-reload`.
    pub fn with_config_path(mut self, path: PathBuf) -> Supervisor {
        self.config_path = Some(path);
        self
    }

    /// The cooperative stop flag shared with workers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Whether shutdown was requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Current configuration snapshot.
    pub fn config_snapshot(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    /// Per-server runtime registry.
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Metrics cache.
    pub fn metrics(&self) -> &MetricsCache {
        &self.metrics
    }

    fn env_for(&self, server_name: &str) -> Result<Arc<StageEnv>> {
        let config = self.config.snapshot();
        let server = config
            .server(server_name)
            .ok_or_else(|| Error::config(format!("unknown server '{}'", server_name)))?
            .clone();
        let upstream = (self.upstream_factory)(&server);
        Ok(ops::stage_env(config, &server, upstream))
    }

    fn require_server<'a>(&self, request: &'a Request) -> Result<&'a str> {
        request
            .server
            .as_deref()
            .ok_or_else(|| Error::config("this command requires a server"))
    }

    /// Dispatch one request to a response.
    pub fn handle_request(&self, request: Request) -> Response {
        let category = serde_json::to_value(request.command)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        match self.dispatch(&request) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    target: "pgharbor::supervisor",
                    command = %category,
                    error = %e,
                    "command failed"
                );
                Response::from_error(&category, &e)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        match request.command {
            Category::Ping => Ok(Response::success(json!({ "pong": true }))),

            Category::Shutdown => {
                info!(target: "pgharbor::supervisor", "shutdown requested");
                self.stop.store(true, Ordering::Release);
                Ok(Response::success(json!({ "stopping": true })))
            }

            Category::Status => {
                let config = self.config.snapshot();
                let mut servers = Vec::new();
                for server in &config.servers {
                    if let Some(state) = self.registry.get(&server.name) {
                        servers.push(json!({
                            "name": server.name,
                            "backup_running": state.is_busy(OperationKind::Backup),
                            "restore_running": state.is_busy(OperationKind::Restore),
                            "archive_running": state.is_busy(OperationKind::Archive),
                            "delete_running": state.is_busy(OperationKind::Delete),
                            "retention_running": state.is_busy(OperationKind::Retention),
                            "wal_paused": state.wal_paused.load(Ordering::Acquire),
                            "operations": state.operation_count.load(Ordering::Acquire),
                            "failed_operations":
                                state.failed_operation_count.load(Ordering::Acquire),
                        }));
                    }
                }
                Ok(Response::success(json!({ "servers": servers })))
            }

            Category::Info => {
                let server = self.require_server(request)?;
                let env = self.env_for(server)?;
                let backups = ops::list_backups(&env)?;
                let latest = backups.first().map(|b| b.label.clone());
                Ok(Response::success(json!({
                    "server": server,
                    "backups": backups.len(),
                    "latest": latest,
                })))
            }

            Category::Backup => {
                let server = self.require_server(request)?;
                let guard = self.registry.begin(server, OperationKind::Backup)?;
                let env = self.env_for(server)?;
                let incremental = request.bool_param("incremental").unwrap_or(false);
                let result = ops::run_backup(env, incremental);
                guard.finish(result.is_ok());
                let outcome = result?;
                Ok(Response::success(json!({
                    "label": outcome.info.label,
                    "backup_size": outcome.info.backup_size,
                    "restore_size": outcome.info.restore_size,
                    "parent": outcome.info.parent,
                })))
            }

            Category::ListBackup => {
                let server = self.require_server(request)?;
                let env = self.env_for(server)?;
                let backups: Vec<_> = ops::list_backups(&env)?
                    .into_iter()
                    .map(|info| {
                        json!({
                            "label": info.label,
                            "status": info.validity.as_str(),
                            "backup_size": info.backup_size,
                            "restore_size": info.restore_size,
                            "keep": info.keep,
                            "parent": info.parent,
                        })
                    })
                    .collect();
                Ok(Response::success(json!({ "backups": backups })))
            }

            Category::Restore => {
                let server = self.require_server(request)?;
                let target = request
                    .str_param("target")
                    .ok_or_else(|| Error::config("restore requires a target directory"))?
                    .to_string();
                let guard = self.registry.begin(server, OperationKind::Restore)?;
                let env = self.env_for(server)?;
                let label = ops::resolve_label(&env, request.label.as_deref());
                let result =
                    label.and_then(|l| ops::run_restore(env, &l, Path::new(&target)).map(|_| l));
                guard.finish(result.is_ok());
                let label = result?;
                Ok(Response::success(json!({
                    "label": label,
                    "target": target,
                })))
            }

            Category::Verify => {
                let server = self.require_server(request)?;
                let env = self.env_for(server)?;
                let label = ops::resolve_label(&env, request.label.as_deref())?;
                ops::run_verify(&env, &label)?;
                Ok(Response::success(json!({ "label": label, "valid": true })))
            }

            Category::Archive => {
                let server = self.require_server(request)?;
                let guard = self.registry.begin(server, OperationKind::Archive)?;
                let env = self.env_for(server)?;
                let result = ops::run_archive(&env);
                guard.finish(result.is_ok());
                Ok(Response::success(json!({ "segments": result? })))
            }

            Category::Delete => {
                let server = self.require_server(request)?;
                let label = request
                    .label
                    .as_deref()
                    .ok_or_else(|| Error::config("delete requires a label"))?;
                let guard = self.registry.begin(server, OperationKind::Delete)?;
                let env = self.env_for(server)?;
                let result = ops::run_delete(&env, label);
                guard.finish(result.is_ok());
                result?;
                Ok(Response::success(json!({ "deleted": label })))
            }

            Category::Retain => {
                let server = self.require_server(request)?;
                let guard = self.registry.begin(server, OperationKind::Retention)?;
                let env = self.env_for(server)?;
                let result = ops::run_retention(env);
                guard.finish(result.is_ok());
                let report = result?;
                Ok(Response::success(json!({
                    "survivors": report.survivors,
                    "deleted": report.deleted,
                    "failed": report.failed,
                })))
            }

            Category::Expunge => {
                let server = self.require_server(request)?;
                let label = request
                    .label
                    .as_deref()
                    .ok_or_else(|| Error::config("expunge requires a label"))?;
                let guard = self.registry.begin(server, OperationKind::Delete)?;
                let env = self.env_for(server)?;
                let result = ops::expunge(&env, label);
                guard.finish(result.is_ok());
                let info = result?;
                Ok(Response::success(json!({
                    "label": info.label,
                    "status": info.validity.as_str(),
                })))
            }

            Category::Annotate => {
                let server = self.require_server(request)?;
                let label = request
                    .label
                    .as_deref()
                    .ok_or_else(|| Error::config("annotate requires a label"))?;
                let keep = request
                    .bool_param("keep")
                    .ok_or_else(|| Error::config("annotate requires keep=true|false"))?;
                let env = self.env_for(server)?;
                let info = ops::set_keep(&env, label, keep)?;
                Ok(Response::success(json!({
                    "label": info.label,
                    "keep": info.keep,
                })))
            }

            Category::Mode => {
                let server = self.require_server(request)?;
                let state = self
                    .registry
                    .get(server)
                    .ok_or_else(|| Error::config(format!("unknown server '{}'", server)))?;
                if let Some(action) = request.str_param("action") {
                    match action {
                        "pause" => state.wal_paused.store(true, Ordering::Release),
                        "resume" => state.wal_paused.store(false, Ordering::Release),
                        other => {
                            return Err(Error::config(format!("unknown mode action '{}'", other)))
                        }
                    }
                }
                Ok(Response::success(json!({
                    "server": server,
                    "wal_paused": state.wal_paused.load(Ordering::Acquire),
                })))
            }

            Category::Reset => {
                self.metrics.invalidate();
                for name in self.registry.names() {
                    if let Some(state) = self.registry.get(&name) {
                        state.operation_count.store(0, Ordering::Release);
                        state.failed_operation_count.store(0, Ordering::Release);
                        state.last_operation_time.store(0, Ordering::Release);
                        state.last_failed_operation_time.store(0, Ordering::Release);
                    }
                }
                Ok(Response::success(json!({ "reset": true })))
            }

            Category::ConfGet => {
                let config = self.config.snapshot();
                let ini = config_parse::serialize(&config);
                match request.str_param("key") {
                    Some(key) => {
                        let value = find_key(&ini, request.server.as_deref(), key)
                            .ok_or_else(|| Error::config(format!("unknown key '{}'", key)))?;
                        Ok(Response::success(json!({ "key": key, "value": value })))
                    }
                    None => Ok(Response::success(json!({ "configuration": ini }))),
                }
            }

            Category::ConfLs => {
                let config = self.config.snapshot();
                let ini = config_parse::serialize(&config);
                let keys: Vec<String> = ini
                    .lines()
                    .filter_map(|line| line.split_once('=').map(|(k, _)| k.trim().to_string()))
                    .collect();
                Ok(Response::success(json!({ "keys": keys })))
            }

            Category::ConfSet => {
                let key = request
                    .str_param("key")
                    .ok_or_else(|| Error::config("conf-set requires a key"))?;
                let value = request
                    .str_param("value")
                    .ok_or_else(|| Error::config("conf-set requires a value"))?;

                let current = self.config.snapshot();
                let current_ini = config_parse::serialize(&current);
                let current_value =
                    find_key(&current_ini, request.server.as_deref(), key).unwrap_or_default();

                let mut staged = (*current).clone();
                match request.server.as_deref() {
                    Some(server) => config_parse::set_server_key(&mut staged, server, key, value)?,
                    None => config_parse::set_main_key(&mut staged, key, value)?,
                }

                let outcome = self.config.reload(staged);
                if outcome.restart_required {
                    // Staged but not applied: tell the client both values.
                    return Ok(Response::restart_required(json!({
                        "key": key,
                        "current_value": current_value,
                        "requested_value": value,
                        "restart_required": true,
                    })));
                }
                Ok(Response::success(json!({
                    "key": key,
                    "value": value,
                    "restart_required": false,
                })))
            }

            Category::ConfReload => {
                let path = self
                    .config_path
                    .as_ref()
                    .ok_or_else(|| Error::config("no configuration file to reload"))?;
                let staged = config_parse::load_file(path)?;
                let outcome = self.config.reload(staged);
                let body = json!({
                    "restart_required": outcome.restart_required,
                    "changed_restart_keys": outcome.changed_restart_keys,
                });
                if outcome.restart_required {
                    Ok(Response::restart_required(body))
                } else {
                    Ok(Response::success(body))
                }
            }
        }
    }
}

/// Find `key = value` in serialized INI text, scoped to `[main]` or a
/// server section.
fn find_key(ini: &str, server: Option<&str>, key: &str) -> Option<String> {
    let wanted_section = match server {
        Some(name) => format!("[server {}]", name),
        None => "[main]".to_string(),
    };
    let mut in_section = false;
    for line in ini.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_section = line == wanted_section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Serve framed requests on a unix socket until shutdown.
///
/// Each accepted connection is handled on its own thread; the accept loop
/// polls the stop flag between attempts.
#[cfg(unix)]
pub fn serve_unix(supervisor: Arc<Supervisor>, socket_path: &Path) -> Result<()> {
    use std::os::unix::net::UnixListener;

    let _ = std::fs::remove_file(socket_path);
    if let Some(dir) = socket_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    let listener = UnixListener::bind(socket_path).map_err(|e| Error::io(socket_path, e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::io(socket_path, e))?;
    info!(
        target: "pgharbor::supervisor",
        socket = %socket_path.display(),
        "management socket listening"
    );

    loop {
        if supervisor.is_stopping() {
            let _ = std::fs::remove_file(socket_path);
            return Ok(());
        }
        match listener.accept() {
            Ok((mut stream, _)) => {
                let supervisor = supervisor.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    match read_frame::<_, Request>(&mut stream) {
                        Ok(request) => {
                            let response = supervisor.handle_request(request);
                            let _ = write_frame(&mut stream, &response);
                        }
                        Err(e) => {
                            let response = Response::from_error("frame", &e);
                            let _ = write_frame(&mut stream, &response);
                        }
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::io(socket_path, e)),
        }
    }
}

/// Serve framed requests on a TCP listener until shutdown.
///
/// TLS wrapping belongs to the transport collaborator; this listener
/// speaks plain frames and is meant for loopback management.
pub fn serve_tcp(supervisor: Arc<Supervisor>, addr: &str) -> Result<()> {
    use std::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .map_err(|e| Error::transport(format!("bind {}: {}", addr, e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::transport(format!("set_nonblocking: {}", e)))?;
    info!(target: "pgharbor::supervisor", addr = %addr, "management listener up");

    loop {
        if supervisor.is_stopping() {
            return Ok(());
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let supervisor = supervisor.clone();
                std::thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    match read_frame::<_, Request>(&mut stream) {
                        Ok(request) => {
                            let response = supervisor.handle_request(request);
                            let _ = write_frame(&mut stream, &response);
                        }
                        Err(e) => {
                            warn!(
                                target: "pgharbor::supervisor",
                                peer = %peer,
                                error = %e,
                                "bad frame"
                            );
                            let response = Response::from_error("frame", &e);
                            let _ = write_frame(&mut stream, &response);
                        }
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::transport(format!("accept: {}", e))),
        }
    }
}

/// Default unix socket path for a configuration.
pub fn socket_path(config: &Config) -> PathBuf {
    config
        .unix_socket_dir
        .join(format!("pgharbor.{}.sock", config.management_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{LocalUpstream, SystemInfo};
    use pgharbor_core::Lsn;
    use tempfile::TempDir;

    fn test_supervisor(dir: &TempDir) -> Supervisor {
        let data = dir.path().join("upstream/data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("PG_VERSION"), b"16\n").unwrap();
        let wal = dir.path().join("upstream/wal");
        std::fs::create_dir_all(&wal).unwrap();

        let mut server = ServerConfig::named("primary");
        server.host = "localhost".to_string();
        let config = Config {
            base_dir: dir.path().join("base"),
            workspace: dir.path().join("workspace"),
            compression: pgharbor_config::Compression::None,
            servers: vec![server],
            ..Default::default()
        };

        let factory: UpstreamFactory = {
            let data = data.clone();
            let wal = wal.clone();
            Arc::new(move |_server: &ServerConfig| {
                Arc::new(LocalUpstream::new(
                    data.clone(),
                    wal.clone(),
                    SystemInfo {
                        system_id: 11,
                        major_version: 16,
                        minor_version: 1,
                        timeline: 1,
                        write_lsn: Lsn::new(0, 0x100),
                    },
                )) as Arc<dyn Upstream>
            })
        };
        Supervisor::new(config, factory)
    }

    #[test]
    fn test_ping_and_status() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);

        let response = supervisor.handle_request(Request::new(Category::Ping));
        assert_eq!(response.status, crate::protocol::Status::Success);
        assert_eq!(response.data["pong"], true);

        let response = supervisor.handle_request(Request::new(Category::Status));
        assert_eq!(response.data["servers"][0]["name"], "primary");
        assert_eq!(response.data["servers"][0]["backup_running"], false);
    }

    #[test]
    fn test_backup_then_list() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);

        let response =
            supervisor.handle_request(Request::new(Category::Backup).server("primary"));
        assert_eq!(
            response.status,
            crate::protocol::Status::Success,
            "{:?}",
            response.error
        );
        let label = response.data["label"].as_str().unwrap().to_string();

        let response =
            supervisor.handle_request(Request::new(Category::ListBackup).server("primary"));
        assert_eq!(response.data["backups"][0]["label"], label.as_str());
        assert_eq!(response.data["backups"][0]["status"], "valid");
    }

    #[test]
    fn test_unknown_server_is_error() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);
        let response =
            supervisor.handle_request(Request::new(Category::Backup).server("ghost"));
        assert_eq!(response.status, crate::protocol::Status::Error);
        assert_eq!(response.error.unwrap().code, "config_invalid");
    }

    #[test]
    fn test_conf_get_and_ls() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);

        let response = supervisor
            .handle_request(Request::new(Category::ConfGet).param("key", "compression"));
        assert_eq!(response.data["value"], "none");

        let response = supervisor.handle_request(Request::new(Category::ConfLs));
        let keys = response.data["keys"].as_array().unwrap();
        assert!(keys.iter().any(|k| k == "base_dir"));
    }

    #[test]
    fn test_conf_set_hot_vs_restart() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);

        // Hot: applies immediately.
        let response = supervisor.handle_request(
            Request::new(Category::ConfSet)
                .param("key", "compression")
                .param("value", "lz4"),
        );
        assert_eq!(response.status, crate::protocol::Status::Success);
        assert_eq!(
            supervisor.config_snapshot().compression,
            pgharbor_config::Compression::Lz4
        );

        // Restart-required: staged, not applied, both values reported.
        let response = supervisor.handle_request(
            Request::new(Category::ConfSet)
                .param("key", "base_dir")
                .param("value", "/elsewhere"),
        );
        assert_eq!(response.status, crate::protocol::Status::RestartRequired);
        assert_eq!(response.data["requested_value"], "/elsewhere");
        assert_ne!(
            supervisor.config_snapshot().base_dir,
            PathBuf::from("/elsewhere")
        );
    }

    #[test]
    fn test_shutdown_sets_stop_flag() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);
        assert!(!supervisor.is_stopping());
        supervisor.handle_request(Request::new(Category::Shutdown));
        assert!(supervisor.is_stopping());
    }

    #[test]
    fn test_mode_pause_resume() {
        let dir = TempDir::new().unwrap();
        let supervisor = test_supervisor(&dir);

        let response = supervisor.handle_request(
            Request::new(Category::Mode)
                .server("primary")
                .param("action", "pause"),
        );
        assert_eq!(response.data["wal_paused"], true);

        let response = supervisor.handle_request(
            Request::new(Category::Mode)
                .server("primary")
                .param("action", "resume"),
        );
        assert_eq!(response.data["wal_paused"], false);
    }
}
