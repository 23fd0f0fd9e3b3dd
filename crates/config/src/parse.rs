//! INI parsing and serialization.
//!
//! The file format is plain INI: `[main]` for engine-wide keys, `[server
//! <name>]` per upstream instance, `key = value` lines, `#`/`;` comments.
//! Unknown keys are ignored with a warning. `$NAME` tokens inside values
//! expand from the environment before coercion.

use crate::model::{Config, Retention, ServerConfig};
use pgharbor_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Load and parse a configuration file.
pub fn load_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse(&text)
}

/// Parse configuration text.
pub fn parse(text: &str) -> Result<Config> {
    enum Section {
        None,
        Main,
        Server(usize),
    }

    let mut config = Config::default();
    let mut section = Section::None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let header = header.trim();
            if header == "main" {
                section = Section::Main;
            } else if let Some(name) = header.strip_prefix("server ") {
                let name = name.trim();
                if name.is_empty() {
                    return Err(Error::config(format!(
                        "line {}: server section requires a name",
                        lineno + 1
                    )));
                }
                config.servers.push(ServerConfig::named(name));
                section = Section::Server(config.servers.len() - 1);
            } else {
                return Err(Error::config(format!(
                    "line {}: unknown section '{}'",
                    lineno + 1,
                    header
                )));
            }
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::config(format!("line {}: expected key = value", lineno + 1))
        })?;
        let key = key.trim();
        let value = expand_env(value.trim());

        match section {
            Section::None => {
                return Err(Error::config(format!(
                    "line {}: key outside any section",
                    lineno + 1
                )))
            }
            Section::Main => apply_main_key(&mut config, key, &value)?,
            Section::Server(idx) => {
                // The borrow of the server entry must not outlive this arm.
                let server = &mut config.servers[idx];
                apply_server_key(server, key, &value)?
            }
        }
    }

    config.validate()?;
    Ok(config)
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == '#' || c == ';') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Expand `$NAME` tokens from the environment. Unset variables expand empty.
fn expand_env(value: &str) -> String {
    if !value.contains('$') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, n)) = chars.peek() {
            if n.is_ascii_alphanumeric() || n == '_' {
                name.push(n);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

/// Parse a boolean spelled any of the accepted ways.
pub fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(Error::config(format!("invalid boolean '{}'", other))),
    }
}

/// Parse a byte size with optional `b`/`k`/`m`/`g` suffix (binary units).
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'b') => (&value[..value.len() - 1], 1),
        Some(b'k') => (&value[..value.len() - 1], 1024),
        Some(b'm') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid size '{}'", value)))?;
    Ok(n * multiplier)
}

/// Parse a duration in seconds with optional `s`/`m`/`h`/`d`/`w` suffix.
pub fn parse_duration(value: &str) -> Result<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b's') => (&value[..value.len() - 1], 1),
        Some(b'm') => (&value[..value.len() - 1], 60),
        Some(b'h') => (&value[..value.len() - 1], 3600),
        Some(b'd') => (&value[..value.len() - 1], 86_400),
        Some(b'w') => (&value[..value.len() - 1], 604_800),
        _ => (value.as_str(), 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid duration '{}'", value)))?;
    Ok(n * multiplier)
}

fn parse_u16(key: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid {} '{}'", key, value)))
}

fn parse_i32(key: &str, value: &str) -> Result<i32> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid {} '{}'", key, value)))
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid {} '{}'", key, value)))
}

fn path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn apply_main_key(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "host" => config.host = value.to_string(),
        "metrics" => config.metrics_port = parse_u16(key, value)?,
        "management" => config.management_port = parse_u16(key, value)?,
        "unix_socket_dir" => config.unix_socket_dir = PathBuf::from(value),
        "pidfile" => config.pidfile = PathBuf::from(value),
        "base_dir" => config.base_dir = PathBuf::from(value),
        "workspace" => config.workspace = PathBuf::from(value),
        "backlog" => config.backlog = parse_i32(key, value)?,
        "nodelay" => config.nodelay = parse_bool(value)?,
        "keep_alive" => config.keep_alive = parse_bool(value)?,
        "non_blocking" => config.non_blocking = parse_bool(value)?,
        "tls" => config.tls = parse_bool(value)?,
        "tls_cert_file" => config.tls_cert_file = PathBuf::from(value),
        "tls_key_file" => config.tls_key_file = PathBuf::from(value),
        "tls_ca_file" => config.tls_ca_file = PathBuf::from(value),
        "metrics_cert_file" => config.metrics_cert_file = PathBuf::from(value),
        "metrics_key_file" => config.metrics_key_file = PathBuf::from(value),
        "metrics_ca_file" => config.metrics_ca_file = PathBuf::from(value),
        "compression" => config.compression = value.parse()?,
        "compression_level" => {
            let level = parse_i32(key, value)?;
            config.compression_level = config.compression.family().clamp_level(level);
        }
        "encryption" => config.encryption = value.parse()?,
        "storage_engine" => config.storage_engine = value.parse()?,
        "retention" => config.retention = value.parse()?,
        "retention_interval" => config.retention_interval = parse_duration(value)?,
        "verification" => config.verification = parse_duration(value)?,
        "workers" => config.workers = parse_usize(key, value)?,
        "backup_max_rate" => config.backup_max_rate = parse_size(value)?,
        "network_max_rate" => config.network_max_rate = parse_size(value)?,
        "blocking_timeout" => config.blocking_timeout = parse_duration(value)?,
        "authentication_timeout" => config.authentication_timeout = parse_duration(value)?,
        "log_type" => config.log_type = value.parse()?,
        "log_level" => config.log_level = value.parse()?,
        "log_path" => config.log_path = PathBuf::from(value),
        "log_rotation_size" => config.log_rotation_size = parse_size(value)?,
        "log_rotation_age" => config.log_rotation_age = parse_duration(value)?,
        "log_mode" => config.log_mode = value.parse()?,
        "log_line_prefix" => config.log_line_prefix = value.to_string(),
        "metrics_cache_max_age" => config.metrics_cache_max_age = parse_duration(value)?,
        "metrics_cache_max_size" => config.metrics_cache_max_size = parse_size(value)?,
        "hugepage" => config.hugepage = value.parse()?,
        "update_process_title" => config.update_process_title = value.parse()?,
        "libev" => config.libev = value.to_string(),
        "create_slot" => config.create_slot = parse_bool(value)?,
        "ssh_hostname" => config.ssh_hostname = value.to_string(),
        "ssh_username" => config.ssh_username = value.to_string(),
        "ssh_base_dir" => config.ssh_base_dir = PathBuf::from(value),
        "ssh_ciphers" => config.ssh_ciphers = value.to_string(),
        "s3_aws_region" => config.s3_aws_region = value.to_string(),
        "s3_access_key_id" => config.s3_access_key_id = value.to_string(),
        "s3_secret_access_key" => config.s3_secret_access_key = value.to_string(),
        "s3_bucket" => config.s3_bucket = value.to_string(),
        "s3_base_dir" => config.s3_base_dir = PathBuf::from(value),
        "azure_storage_account" => config.azure_storage_account = value.to_string(),
        "azure_container" => config.azure_container = value.to_string(),
        "azure_shared_key" => config.azure_shared_key = value.to_string(),
        "azure_base_dir" => config.azure_base_dir = PathBuf::from(value),
        unknown => {
            warn!(target: "pgharbor::config", key = unknown, "ignoring unknown [main] key");
        }
    }
    Ok(())
}

fn apply_server_key(server: &mut ServerConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "host" => server.host = value.to_string(),
        "port" => server.port = parse_u16(key, value)?,
        "user" | "username" => server.username = value.to_string(),
        "wal_slot" => server.wal_slot = value.to_string(),
        "create_slot" => server.create_slot = Some(parse_bool(value)?),
        "follow" => server.follow = value.to_string(),
        "workspace" => server.workspace = Some(PathBuf::from(value)),
        "wal_shipping" => server.wal_shipping = PathBuf::from(value),
        "hot_standby" => server.hot_standby = path_list(value),
        "hot_standby_overrides" => server.hot_standby_overrides = value.to_string(),
        "hot_standby_tablespaces" => server.hot_standby_tablespaces = value.to_string(),
        "workers" => server.workers = Some(parse_usize(key, value)?),
        "backup_max_rate" => server.backup_max_rate = Some(parse_size(value)?),
        "network_max_rate" => server.network_max_rate = Some(parse_size(value)?),
        "retention" => server.retention = Some(value.parse::<Retention>()?),
        "extra" => server.extra = path_list(value),
        "tls_cert_file" => server.tls_cert_file = PathBuf::from(value),
        "tls_key_file" => server.tls_key_file = PathBuf::from(value),
        "tls_ca_file" => server.tls_ca_file = PathBuf::from(value),
        unknown => {
            warn!(
                target: "pgharbor::config",
                server = %server.name,
                key = unknown,
                "ignoring unknown server key"
            );
        }
    }
    Ok(())
}

/// Apply one `[main]` key to a configuration (conf-set path).
pub fn set_main_key(config: &mut Config, key: &str, value: &str) -> Result<()> {
    apply_main_key(config, key, &expand_env(value.trim()))
}

/// Apply one key to a named server section (conf-set path).
pub fn set_server_key(config: &mut Config, server: &str, key: &str, value: &str) -> Result<()> {
    let value = expand_env(value.trim());
    let entry = config
        .servers
        .iter_mut()
        .find(|s| s.name == server)
        .ok_or_else(|| Error::config(format!("unknown server '{}'", server)))?;
    apply_server_key(entry, key, &value)
}

/// Serialize a configuration back to INI text.
///
/// `parse(serialize(parse(text)))` equals `parse(text)` for the recognized
/// key set.
pub fn serialize(config: &Config) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let p = |path: &PathBuf| path.display().to_string();

    out.push_str("[main]\n");
    let _ = writeln!(out, "host = {}", config.host);
    let _ = writeln!(out, "metrics = {}", config.metrics_port);
    let _ = writeln!(out, "management = {}", config.management_port);
    let _ = writeln!(out, "unix_socket_dir = {}", p(&config.unix_socket_dir));
    let _ = writeln!(out, "pidfile = {}", p(&config.pidfile));
    let _ = writeln!(out, "base_dir = {}", p(&config.base_dir));
    let _ = writeln!(out, "workspace = {}", p(&config.workspace));
    let _ = writeln!(out, "backlog = {}", config.backlog);
    let _ = writeln!(out, "nodelay = {}", config.nodelay);
    let _ = writeln!(out, "keep_alive = {}", config.keep_alive);
    let _ = writeln!(out, "non_blocking = {}", config.non_blocking);
    let _ = writeln!(out, "tls = {}", config.tls);
    let _ = writeln!(out, "tls_cert_file = {}", p(&config.tls_cert_file));
    let _ = writeln!(out, "tls_key_file = {}", p(&config.tls_key_file));
    let _ = writeln!(out, "tls_ca_file = {}", p(&config.tls_ca_file));
    let _ = writeln!(out, "metrics_cert_file = {}", p(&config.metrics_cert_file));
    let _ = writeln!(out, "metrics_key_file = {}", p(&config.metrics_key_file));
    let _ = writeln!(out, "metrics_ca_file = {}", p(&config.metrics_ca_file));
    let _ = writeln!(out, "compression = {}", config.compression.as_str());
    let _ = writeln!(out, "compression_level = {}", config.compression_level);
    let _ = writeln!(out, "encryption = {}", config.encryption.as_str());
    let _ = writeln!(out, "storage_engine = {}", config.storage_engine.as_string());
    let _ = writeln!(out, "retention = {}", config.retention);
    let _ = writeln!(out, "retention_interval = {}", config.retention_interval);
    let _ = writeln!(out, "verification = {}", config.verification);
    let _ = writeln!(out, "workers = {}", config.workers);
    let _ = writeln!(out, "backup_max_rate = {}", config.backup_max_rate);
    let _ = writeln!(out, "network_max_rate = {}", config.network_max_rate);
    let _ = writeln!(out, "blocking_timeout = {}", config.blocking_timeout);
    let _ = writeln!(
        out,
        "authentication_timeout = {}",
        config.authentication_timeout
    );
    let _ = writeln!(out, "log_type = {}", config.log_type.as_str());
    let _ = writeln!(out, "log_level = {}", config.log_level.as_str());
    let _ = writeln!(out, "log_path = {}", p(&config.log_path));
    let _ = writeln!(out, "log_rotation_size = {}", config.log_rotation_size);
    let _ = writeln!(out, "log_rotation_age = {}", config.log_rotation_age);
    let _ = writeln!(out, "log_mode = {}", config.log_mode.as_str());
    if !config.log_line_prefix.is_empty() {
        let _ = writeln!(out, "log_line_prefix = {}", config.log_line_prefix);
    }
    let _ = writeln!(out, "metrics_cache_max_age = {}", config.metrics_cache_max_age);
    let _ = writeln!(
        out,
        "metrics_cache_max_size = {}",
        config.metrics_cache_max_size
    );
    let _ = writeln!(out, "hugepage = {}", config.hugepage.as_str());
    let _ = writeln!(
        out,
        "update_process_title = {}",
        config.update_process_title.as_str()
    );
    let _ = writeln!(out, "libev = {}", config.libev);
    let _ = writeln!(out, "create_slot = {}", config.create_slot);
    if !config.ssh_hostname.is_empty() {
        let _ = writeln!(out, "ssh_hostname = {}", config.ssh_hostname);
        let _ = writeln!(out, "ssh_username = {}", config.ssh_username);
        let _ = writeln!(out, "ssh_base_dir = {}", p(&config.ssh_base_dir));
        let _ = writeln!(out, "ssh_ciphers = {}", config.ssh_ciphers);
    }
    if !config.s3_bucket.is_empty() {
        let _ = writeln!(out, "s3_aws_region = {}", config.s3_aws_region);
        let _ = writeln!(out, "s3_access_key_id = {}", config.s3_access_key_id);
        let _ = writeln!(out, "s3_secret_access_key = {}", config.s3_secret_access_key);
        let _ = writeln!(out, "s3_bucket = {}", config.s3_bucket);
        let _ = writeln!(out, "s3_base_dir = {}", p(&config.s3_base_dir));
    }
    if !config.azure_container.is_empty() {
        let _ = writeln!(out, "azure_storage_account = {}", config.azure_storage_account);
        let _ = writeln!(out, "azure_container = {}", config.azure_container);
        let _ = writeln!(out, "azure_shared_key = {}", config.azure_shared_key);
        let _ = writeln!(out, "azure_base_dir = {}", p(&config.azure_base_dir));
    }

    for server in &config.servers {
        let _ = writeln!(out, "\n[server {}]", server.name);
        let _ = writeln!(out, "host = {}", server.host);
        let _ = writeln!(out, "port = {}", server.port);
        if !server.username.is_empty() {
            let _ = writeln!(out, "user = {}", server.username);
        }
        if !server.wal_slot.is_empty() {
            let _ = writeln!(out, "wal_slot = {}", server.wal_slot);
        }
        if let Some(create_slot) = server.create_slot {
            let _ = writeln!(out, "create_slot = {}", create_slot);
        }
        if !server.follow.is_empty() {
            let _ = writeln!(out, "follow = {}", server.follow);
        }
        if let Some(workspace) = &server.workspace {
            let _ = writeln!(out, "workspace = {}", p(workspace));
        }
        if !server.wal_shipping.as_os_str().is_empty() {
            let _ = writeln!(out, "wal_shipping = {}", p(&server.wal_shipping));
        }
        if !server.hot_standby.is_empty() {
            let dirs: Vec<String> = server.hot_standby.iter().map(|d| p(d)).collect();
            let _ = writeln!(out, "hot_standby = {}", dirs.join(","));
        }
        if !server.hot_standby_overrides.is_empty() {
            let _ = writeln!(out, "hot_standby_overrides = {}", server.hot_standby_overrides);
        }
        if !server.hot_standby_tablespaces.is_empty() {
            let _ = writeln!(
                out,
                "hot_standby_tablespaces = {}",
                server.hot_standby_tablespaces
            );
        }
        if let Some(workers) = server.workers {
            let _ = writeln!(out, "workers = {}", workers);
        }
        if let Some(rate) = server.backup_max_rate {
            let _ = writeln!(out, "backup_max_rate = {}", rate);
        }
        if let Some(rate) = server.network_max_rate {
            let _ = writeln!(out, "network_max_rate = {}", rate);
        }
        if let Some(retention) = &server.retention {
            let _ = writeln!(out, "retention = {}", retention);
        }
        if !server.extra.is_empty() {
            let files: Vec<String> = server.extra.iter().map(|d| p(d)).collect();
            let _ = writeln!(out, "extra = {}", files.join(","));
        }
        if !server.tls_cert_file.as_os_str().is_empty() {
            let _ = writeln!(out, "tls_cert_file = {}", p(&server.tls_cert_file));
            let _ = writeln!(out, "tls_key_file = {}", p(&server.tls_key_file));
            let _ = writeln!(out, "tls_ca_file = {}", p(&server.tls_ca_file));
        }
    }

    out
}
