//! Live-reload classification.
//!
//! A reload parses the candidate file into a staging [`Config`] and compares
//! it field by field against the running one. Hot fields may be applied in
//! place; restart-required fields are only compared. When any
//! restart-required field changed, nothing is applied and the caller signals
//! the client that a restart is needed.

use crate::model::Config;
use tracing::info;

/// Result of classifying a staged configuration against the running one.
#[derive(Debug)]
pub struct ReloadOutcome {
    /// The configuration to run with after the reload.
    ///
    /// Equal to the staged configuration when no restart-required field
    /// changed; otherwise the running configuration, unchanged.
    pub effective: Config,
    /// Whether any restart-required field changed.
    pub restart_required: bool,
    /// Names of the restart-required fields that differed.
    pub changed_restart_keys: Vec<String>,
}

macro_rules! restart_check {
    ($keys:expr, $name:expr, $current:expr, $staged:expr) => {
        if $current != $staged {
            $keys.push($name.to_string());
        }
    };
}

/// Classify `staged` against `current` and produce the effective config.
pub fn transfer(current: &Config, staged: Config) -> ReloadOutcome {
    let mut changed = Vec::new();

    restart_check!(changed, "host", current.host, staged.host);
    restart_check!(changed, "metrics", current.metrics_port, staged.metrics_port);
    restart_check!(
        changed,
        "management",
        current.management_port,
        staged.management_port
    );
    restart_check!(
        changed,
        "unix_socket_dir",
        current.unix_socket_dir,
        staged.unix_socket_dir
    );
    restart_check!(changed, "pidfile", current.pidfile, staged.pidfile);
    restart_check!(changed, "base_dir", current.base_dir, staged.base_dir);
    restart_check!(changed, "workspace", current.workspace, staged.workspace);
    restart_check!(changed, "backlog", current.backlog, staged.backlog);
    restart_check!(changed, "tls", current.tls, staged.tls);
    restart_check!(
        changed,
        "tls_cert_file",
        current.tls_cert_file,
        staged.tls_cert_file
    );
    restart_check!(
        changed,
        "tls_key_file",
        current.tls_key_file,
        staged.tls_key_file
    );
    restart_check!(
        changed,
        "tls_ca_file",
        current.tls_ca_file,
        staged.tls_ca_file
    );
    restart_check!(
        changed,
        "metrics_cert_file",
        current.metrics_cert_file,
        staged.metrics_cert_file
    );
    restart_check!(
        changed,
        "metrics_key_file",
        current.metrics_key_file,
        staged.metrics_key_file
    );
    restart_check!(
        changed,
        "metrics_ca_file",
        current.metrics_ca_file,
        staged.metrics_ca_file
    );
    restart_check!(changed, "hugepage", current.hugepage, staged.hugepage);
    restart_check!(changed, "libev", current.libev, staged.libev);
    restart_check!(changed, "log_type", current.log_type, staged.log_type);
    restart_check!(changed, "log_path", current.log_path, staged.log_path);
    restart_check!(
        changed,
        "retention_interval",
        current.retention_interval,
        staged.retention_interval
    );
    restart_check!(
        changed,
        "verification",
        current.verification,
        staged.verification
    );
    restart_check!(
        changed,
        "update_process_title",
        current.update_process_title,
        staged.update_process_title
    );
    restart_check!(
        changed,
        "storage_engine",
        current.storage_engine,
        staged.storage_engine
    );

    // Adding or removing servers changes the shared-state shape.
    restart_check!(
        changed,
        "number_of_servers",
        current.servers.len(),
        staged.servers.len()
    );
    for (cur, new) in current.servers.iter().zip(staged.servers.iter()) {
        let prefix = format!("server {}", cur.name);
        restart_check!(changed, format!("{prefix}: name"), cur.name, new.name);
        restart_check!(changed, format!("{prefix}: host"), cur.host, new.host);
        restart_check!(changed, format!("{prefix}: port"), cur.port, new.port);
        restart_check!(
            changed,
            format!("{prefix}: user"),
            cur.username,
            new.username
        );
        restart_check!(
            changed,
            format!("{prefix}: wal_slot"),
            cur.wal_slot,
            new.wal_slot
        );
        restart_check!(changed, format!("{prefix}: follow"), cur.follow, new.follow);
        restart_check!(
            changed,
            format!("{prefix}: wal_shipping"),
            cur.wal_shipping,
            new.wal_shipping
        );
        restart_check!(
            changed,
            format!("{prefix}: workspace"),
            cur.workspace,
            new.workspace
        );
        restart_check!(
            changed,
            format!("{prefix}: tls_cert_file"),
            cur.tls_cert_file,
            new.tls_cert_file
        );
        restart_check!(
            changed,
            format!("{prefix}: tls_key_file"),
            cur.tls_key_file,
            new.tls_key_file
        );
        restart_check!(
            changed,
            format!("{prefix}: tls_ca_file"),
            cur.tls_ca_file,
            new.tls_ca_file
        );
    }

    let restart_required = !changed.is_empty();
    if restart_required {
        info!(
            target: "pgharbor::config",
            fields = ?changed,
            "reload staged but not applied, restart required"
        );
        // Everything else in `staged` is hot, but the invariant is that a
        // reload is all-or-nothing: keep running on the current snapshot.
        return ReloadOutcome {
            effective: current.clone(),
            restart_required,
            changed_restart_keys: changed,
        };
    }

    ReloadOutcome {
        effective: staged,
        restart_required: false,
        changed_restart_keys: changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Compression, LogLevel, Retention, ServerConfig};
    use std::path::PathBuf;

    fn base_config() -> Config {
        let mut server = ServerConfig::named("primary");
        server.host = "db1".to_string();
        Config {
            base_dir: PathBuf::from("/backup"),
            servers: vec![server],
            ..Default::default()
        }
    }

    #[test]
    fn test_hot_change_applies() {
        let current = base_config();
        let staged = Config {
            compression: Compression::Lz4,
            compression_level: 4,
            log_level: LogLevel::Debug1,
            workers: 9,
            retention: "3,2,1,-".parse::<Retention>().unwrap(),
            ..current.clone()
        };

        let outcome = transfer(&current, staged);
        assert!(!outcome.restart_required);
        assert_eq!(outcome.effective.compression, Compression::Lz4);
        assert_eq!(outcome.effective.workers, 9);
        assert_eq!(outcome.effective.log_level, LogLevel::Debug1);
    }

    #[test]
    fn test_restart_change_is_staged_not_applied() {
        let current = base_config();
        // compression is hot, base_dir is restart-required: the whole staged
        // config must be withheld.
        let staged = Config {
            compression: Compression::Gzip,
            base_dir: PathBuf::from("/new-backup"),
            ..current.clone()
        };

        let outcome = transfer(&current, staged);
        assert!(outcome.restart_required);
        assert_eq!(outcome.effective.compression, current.compression);
        assert_eq!(outcome.effective.base_dir, current.base_dir);
        assert_eq!(outcome.changed_restart_keys, vec!["base_dir".to_string()]);
    }

    #[test]
    fn test_server_identity_requires_restart() {
        let current = base_config();
        let mut staged = current.clone();
        staged.servers[0].port = 5433;

        let outcome = transfer(&current, staged);
        assert!(outcome.restart_required);
        assert!(outcome.changed_restart_keys[0].contains("port"));
    }

    #[test]
    fn test_per_server_hot_overrides_apply() {
        let current = base_config();
        let mut staged = current.clone();
        staged.servers[0].workers = Some(6);
        staged.servers[0].retention = Some("1,1,1,1".parse().unwrap());

        let outcome = transfer(&current, staged);
        assert!(!outcome.restart_required);
        assert_eq!(outcome.effective.servers[0].workers, Some(6));
    }

    #[test]
    fn test_adding_server_requires_restart() {
        let current = base_config();
        let mut staged = current.clone();
        let mut second = ServerConfig::named("replica");
        second.host = "db2".to_string();
        staged.servers.push(second);

        let outcome = transfer(&current, staged);
        assert!(outcome.restart_required);
        assert!(outcome
            .changed_restart_keys
            .contains(&"number_of_servers".to_string()));
    }
}
