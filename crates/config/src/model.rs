//! Configuration model.
//!
//! Every recognized key from the INI file maps onto a field here. Defaults
//! follow the engine's shipped configuration; enum values reject unknown
//! spellings at parse time with `config_invalid`.

use pgharbor_core::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Compression algorithm selection, including client/server-side variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression
    None,
    /// gzip, side unspecified
    Gzip,
    /// gzip on the client side
    ClientGzip,
    /// gzip on the server side
    ServerGzip,
    /// zstd, side unspecified (default)
    #[default]
    Zstd,
    /// zstd on the client side
    ClientZstd,
    /// zstd on the server side
    ServerZstd,
    /// lz4, side unspecified
    Lz4,
    /// lz4 on the client side
    ClientLz4,
    /// lz4 on the server side
    ServerLz4,
    /// bzip2
    Bz2,
    /// bzip2 on the client side
    ClientBz2,
}

impl Compression {
    /// The algorithm family, disregarding the client/server side.
    pub fn family(&self) -> CompressionFamily {
        match self {
            Compression::None => CompressionFamily::None,
            Compression::Gzip | Compression::ClientGzip | Compression::ServerGzip => {
                CompressionFamily::Gzip
            }
            Compression::Zstd | Compression::ClientZstd | Compression::ServerZstd => {
                CompressionFamily::Zstd
            }
            Compression::Lz4 | Compression::ClientLz4 | Compression::ServerLz4 => {
                CompressionFamily::Lz4
            }
            Compression::Bz2 | Compression::ClientBz2 => CompressionFamily::Bz2,
        }
    }

    /// Canonical spelling for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::ClientGzip => "client-gzip",
            Compression::ServerGzip => "server-gzip",
            Compression::Zstd => "zstd",
            Compression::ClientZstd => "client-zstd",
            Compression::ServerZstd => "server-zstd",
            Compression::Lz4 => "lz4",
            Compression::ClientLz4 => "client-lz4",
            Compression::ServerLz4 => "server-lz4",
            Compression::Bz2 => "bz2",
            Compression::ClientBz2 => "client-bz2",
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "none" => Compression::None,
            "gzip" => Compression::Gzip,
            "client-gzip" => Compression::ClientGzip,
            "server-gzip" => Compression::ServerGzip,
            "zstd" => Compression::Zstd,
            "client-zstd" => Compression::ClientZstd,
            "server-zstd" => Compression::ServerZstd,
            "lz4" => Compression::Lz4,
            "client-lz4" => Compression::ClientLz4,
            "server-lz4" => Compression::ServerLz4,
            "bz2" => Compression::Bz2,
            "client-bz2" => Compression::ClientBz2,
            other => return Err(Error::config(format!("unknown compression '{}'", other))),
        })
    }
}

/// Compression algorithm family, used for level clamping and codec lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFamily {
    /// No compression
    None,
    /// gzip
    Gzip,
    /// zstd
    Zstd,
    /// lz4
    Lz4,
    /// bzip2
    Bz2,
}

impl CompressionFamily {
    /// Default level for this family.
    pub fn default_level(&self) -> i32 {
        match self {
            CompressionFamily::None => 0,
            CompressionFamily::Gzip => 6,
            CompressionFamily::Zstd => 3,
            CompressionFamily::Lz4 => 1,
            CompressionFamily::Bz2 => 9,
        }
    }

    /// Clamp a requested level into this family's valid range.
    pub fn clamp_level(&self, level: i32) -> i32 {
        match self {
            CompressionFamily::None => 0,
            CompressionFamily::Gzip => level.clamp(1, 9),
            CompressionFamily::Zstd => level.clamp(-131_072, 22),
            CompressionFamily::Lz4 => level.clamp(1, 12),
            CompressionFamily::Bz2 => level.clamp(1, 9),
        }
    }
}

/// Encryption algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    /// No encryption (default)
    #[default]
    None,
    /// AES-256 in CBC mode
    Aes256Cbc,
    /// AES-192 in CBC mode
    Aes192Cbc,
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// AES-256 in CTR mode
    Aes256Ctr,
    /// AES-192 in CTR mode
    Aes192Ctr,
    /// AES-128 in CTR mode
    Aes128Ctr,
}

impl Encryption {
    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Encryption::None => 0,
            Encryption::Aes256Cbc | Encryption::Aes256Ctr => 32,
            Encryption::Aes192Cbc | Encryption::Aes192Ctr => 24,
            Encryption::Aes128Cbc | Encryption::Aes128Ctr => 16,
        }
    }

    /// Canonical spelling for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Encryption::None => "none",
            Encryption::Aes256Cbc => "aes-256-cbc",
            Encryption::Aes192Cbc => "aes-192-cbc",
            Encryption::Aes128Cbc => "aes-128-cbc",
            Encryption::Aes256Ctr => "aes-256-ctr",
            Encryption::Aes192Ctr => "aes-192-ctr",
            Encryption::Aes128Ctr => "aes-128-ctr",
        }
    }
}

impl FromStr for Encryption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "none" => Encryption::None,
            "aes" | "aes-256" | "aes-256-cbc" => Encryption::Aes256Cbc,
            "aes-192" | "aes-192-cbc" => Encryption::Aes192Cbc,
            "aes-128" | "aes-128-cbc" => Encryption::Aes128Cbc,
            "aes-256-ctr" => Encryption::Aes256Ctr,
            "aes-192-ctr" => Encryption::Aes192Ctr,
            "aes-128-ctr" => Encryption::Aes128Ctr,
            other => return Err(Error::config(format!("unknown encryption '{}'", other))),
        })
    }
}

/// Storage engine bitfield over {local, ssh, s3, azure}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEngines(u8);

impl StorageEngines {
    /// Local filesystem engine.
    pub const LOCAL: u8 = 1 << 0;
    /// SSH path-mapping engine.
    pub const SSH: u8 = 1 << 1;
    /// S3 engine.
    pub const S3: u8 = 1 << 2;
    /// Azure engine.
    pub const AZURE: u8 = 1 << 3;

    /// Whether the local engine is selected.
    pub fn local(&self) -> bool {
        self.0 & Self::LOCAL != 0
    }

    /// Whether the ssh engine is selected.
    pub fn ssh(&self) -> bool {
        self.0 & Self::SSH != 0
    }

    /// Whether the s3 engine is selected.
    pub fn s3(&self) -> bool {
        self.0 & Self::S3 != 0
    }

    /// Whether the azure engine is selected.
    pub fn azure(&self) -> bool {
        self.0 & Self::AZURE != 0
    }

    /// Raw bitfield value.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Canonical comma-separated spelling.
    pub fn as_string(&self) -> String {
        let mut parts = Vec::new();
        if self.local() {
            parts.push("local");
        }
        if self.ssh() {
            parts.push("ssh");
        }
        if self.s3() {
            parts.push("s3");
        }
        if self.azure() {
            parts.push("azure");
        }
        parts.join(",")
    }
}

impl Default for StorageEngines {
    fn default() -> Self {
        StorageEngines(Self::LOCAL)
    }
}

impl FromStr for StorageEngines {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bits = 0u8;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            bits |= match part {
                "local" => Self::LOCAL,
                "ssh" => Self::SSH,
                "s3" => Self::S3,
                "azure" => Self::AZURE,
                other => {
                    return Err(Error::config(format!("unknown storage engine '{}'", other)))
                }
            };
        }
        if bits == 0 {
            return Err(Error::config("storage_engine selects no engine"));
        }
        Ok(StorageEngines(bits))
    }
}

/// Log sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogType {
    /// Log to the console (default)
    #[default]
    Console,
    /// Log to a file
    File,
    /// Log to syslog
    Syslog,
}

impl LogType {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Console => "console",
            LogType::File => "file",
            LogType::Syslog => "syslog",
        }
    }
}

impl FromStr for LogType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "console" => LogType::Console,
            "file" => LogType::File,
            "syslog" => LogType::Syslog,
            other => return Err(Error::config(format!("unknown log_type '{}'", other))),
        })
    }
}

/// Log verbosity. `debug1` is the most verbose debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Most verbose
    Debug1,
    /// Debug levels 2 through 5 step down in verbosity
    Debug2,
    Debug3,
    Debug4,
    Debug5,
    /// Informational (default)
    #[default]
    Info,
    /// Warnings
    Warn,
    /// Errors
    Error,
    /// Fatal only
    Fatal,
}

impl LogLevel {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug1 => "debug1",
            LogLevel::Debug2 => "debug2",
            LogLevel::Debug3 => "debug3",
            LogLevel::Debug4 => "debug4",
            LogLevel::Debug5 => "debug5",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "debug" | "debug1" => LogLevel::Debug1,
            "debug2" => LogLevel::Debug2,
            "debug3" => LogLevel::Debug3,
            "debug4" => LogLevel::Debug4,
            "debug5" => LogLevel::Debug5,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "fatal" => LogLevel::Fatal,
            other => return Err(Error::config(format!("unknown log_level '{}'", other))),
        })
    }
}

/// Log file open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Append to an existing file (default)
    #[default]
    Append,
    /// Truncate on open
    Create,
}

impl LogMode {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMode::Append => "append",
            LogMode::Create => "create",
        }
    }
}

impl FromStr for LogMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "append" => LogMode::Append,
            "create" => LogMode::Create,
            other => return Err(Error::config(format!("unknown log_mode '{}'", other))),
        })
    }
}

/// Huge page policy for the shared state arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HugePage {
    /// Never use huge pages
    Off,
    /// Try, fall back silently (default)
    #[default]
    Try,
    /// Require huge pages
    On,
}

impl HugePage {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            HugePage::Off => "off",
            HugePage::Try => "try",
            HugePage::On => "on",
        }
    }
}

impl FromStr for HugePage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "off" => HugePage::Off,
            "try" => HugePage::Try,
            "on" => HugePage::On,
            other => return Err(Error::config(format!("unknown hugepage '{}'", other))),
        })
    }
}

/// Process title update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessTitleMode {
    /// Never touch the title
    Never,
    /// Update only at well-defined transitions
    Strict,
    /// Short titles
    Minimal,
    /// Full titles (default)
    #[default]
    Verbose,
}

impl ProcessTitleMode {
    /// Canonical spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessTitleMode::Never => "never",
            ProcessTitleMode::Strict => "strict",
            ProcessTitleMode::Minimal => "minimal",
            ProcessTitleMode::Verbose => "verbose",
        }
    }
}

impl FromStr for ProcessTitleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "never" => ProcessTitleMode::Never,
            "strict" => ProcessTitleMode::Strict,
            "minimal" => ProcessTitleMode::Minimal,
            "verbose" => ProcessTitleMode::Verbose,
            other => {
                return Err(Error::config(format!(
                    "unknown update_process_title '{}'",
                    other
                )))
            }
        })
    }
}

/// Retention policy: how many backups to keep per calendar bucket.
///
/// `None` in a bucket means the bucket is disabled (spelled `-`, `x`, or `X`
/// in the configuration file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Daily backups to keep
    pub days: Option<u32>,
    /// Weekly backups to keep
    pub weeks: Option<u32>,
    /// Monthly backups to keep
    pub months: Option<u32>,
    /// Yearly backups to keep
    pub years: Option<u32>,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            days: Some(7),
            weeks: None,
            months: None,
            years: None,
        }
    }
}

impl Retention {
    /// Upper bound on the number of survivors (ignoring keep flags).
    pub fn max_survivors(&self) -> u32 {
        self.days.unwrap_or(0)
            + self.weeks.unwrap_or(0)
            + self.months.unwrap_or(0)
            + self.years.unwrap_or(0)
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |v: Option<u32>| match v {
            Some(n) => n.to_string(),
            None => "-".to_string(),
        };
        write!(
            f,
            "{},{},{},{}",
            part(self.days),
            part(self.weeks),
            part(self.months),
            part(self.years)
        )
    }
}

impl FromStr for Retention {
    type Err = Error;

    /// Accepts 1 to 4 comma-separated values; missing trailing buckets are
    /// disabled. `-`, `x`, and `X` disable a bucket explicitly.
    fn from_str(s: &str) -> Result<Self> {
        let mut buckets = [None, None, None, None];
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(Error::config(format!("invalid retention '{}'", s)));
        }
        for (i, part) in parts.iter().enumerate() {
            buckets[i] = match *part {
                "-" | "x" | "X" | "" => None,
                n => Some(
                    n.parse::<u32>()
                        .map_err(|_| Error::config(format!("invalid retention count '{}'", n)))?,
                ),
            };
        }
        Ok(Retention {
            days: buckets[0],
            weeks: buckets[1],
            months: buckets[2],
            years: buckets[3],
        })
    }
}

/// Engine-wide configuration (`[main]`) plus the server list.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Bind address for the management and metrics listeners.
    pub host: String,
    /// Metrics port (0 disables).
    pub metrics_port: u16,
    /// Management port (0 disables).
    pub management_port: u16,
    /// Directory for the management unix socket.
    pub unix_socket_dir: PathBuf,
    /// Pidfile path, empty when unused.
    pub pidfile: PathBuf,
    /// Root of all per-server backup directories.
    pub base_dir: PathBuf,
    /// Scratch directory for in-flight pipeline artifacts.
    pub workspace: PathBuf,
    /// Listener backlog.
    pub backlog: i32,
    /// TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
    /// SO_KEEPALIVE on accepted sockets.
    pub keep_alive: bool,
    /// Non-blocking accepted sockets.
    pub non_blocking: bool,

    /// TLS on the management listener.
    pub tls: bool,
    /// TLS certificate file.
    pub tls_cert_file: PathBuf,
    /// TLS key file.
    pub tls_key_file: PathBuf,
    /// TLS CA file.
    pub tls_ca_file: PathBuf,
    /// Metrics TLS certificate file.
    pub metrics_cert_file: PathBuf,
    /// Metrics TLS key file.
    pub metrics_key_file: PathBuf,
    /// Metrics TLS CA file.
    pub metrics_ca_file: PathBuf,

    /// Compression algorithm for backup artifacts and archived WAL.
    pub compression: Compression,
    /// Compression level, clamped per family.
    pub compression_level: i32,
    /// Encryption algorithm for backup artifacts and archived WAL.
    pub encryption: Encryption,
    /// Storage engine selection.
    pub storage_engine: StorageEngines,

    /// Retention policy.
    pub retention: Retention,
    /// Seconds between retention sweeps.
    pub retention_interval: u64,
    /// Seconds between verification sweeps; 0 disables.
    pub verification: u64,

    /// Worker threads per operation; 0 means one per CPU.
    pub workers: usize,
    /// Per-server backup rate cap in bytes/s; 0 disables.
    pub backup_max_rate: u64,
    /// Global network rate cap in bytes/s; 0 disables.
    pub network_max_rate: u64,
    /// Reactor-level read timeout in seconds.
    pub blocking_timeout: u64,
    /// Handshake timeout in seconds.
    pub authentication_timeout: u64,

    /// Log sink.
    pub log_type: LogType,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Log file path when `log_type = file`.
    pub log_path: PathBuf,
    /// Rotate the log after this many bytes; 0 disables.
    pub log_rotation_size: u64,
    /// Rotate the log after this many seconds; 0 disables.
    pub log_rotation_age: u64,
    /// Log file open mode.
    pub log_mode: LogMode,
    /// Prefix prepended to each log line.
    pub log_line_prefix: String,

    /// Metrics cache validity in seconds; 0 disables the cache.
    pub metrics_cache_max_age: u64,
    /// Metrics cache size cap in bytes; 0 means unbounded.
    pub metrics_cache_max_size: u64,

    /// Huge page policy.
    pub hugepage: HugePage,
    /// Process title policy.
    pub update_process_title: ProcessTitleMode,
    /// Event backend hint, kept for compatibility.
    pub libev: String,
    /// Create the replication slot on first connect.
    pub create_slot: bool,

    /// SSH engine: remote hostname.
    pub ssh_hostname: String,
    /// SSH engine: remote username.
    pub ssh_username: String,
    /// SSH engine: remote base directory.
    pub ssh_base_dir: PathBuf,
    /// SSH engine: allowed cipher list.
    pub ssh_ciphers: String,
    /// S3 engine: region.
    pub s3_aws_region: String,
    /// S3 engine: access key id.
    pub s3_access_key_id: String,
    /// S3 engine: secret access key.
    pub s3_secret_access_key: String,
    /// S3 engine: bucket.
    pub s3_bucket: String,
    /// S3 engine: base path within the bucket.
    pub s3_base_dir: PathBuf,
    /// Azure engine: storage account.
    pub azure_storage_account: String,
    /// Azure engine: container.
    pub azure_container: String,
    /// Azure engine: shared key.
    pub azure_shared_key: String,
    /// Azure engine: base path within the container.
    pub azure_base_dir: PathBuf,

    /// Configured servers, in file order.
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            metrics_port: 0,
            management_port: 0,
            unix_socket_dir: PathBuf::from("/tmp/"),
            pidfile: PathBuf::new(),
            base_dir: PathBuf::new(),
            workspace: PathBuf::from("/tmp/pgharbor-workspace"),
            backlog: 16,
            nodelay: true,
            keep_alive: true,
            non_blocking: true,
            tls: false,
            tls_cert_file: PathBuf::new(),
            tls_key_file: PathBuf::new(),
            tls_ca_file: PathBuf::new(),
            metrics_cert_file: PathBuf::new(),
            metrics_key_file: PathBuf::new(),
            metrics_ca_file: PathBuf::new(),
            compression: Compression::Zstd,
            compression_level: 3,
            encryption: Encryption::None,
            storage_engine: StorageEngines::default(),
            retention: Retention::default(),
            retention_interval: 300,
            verification: 0,
            workers: 0,
            backup_max_rate: 0,
            network_max_rate: 0,
            blocking_timeout: 30,
            authentication_timeout: 5,
            log_type: LogType::Console,
            log_level: LogLevel::Info,
            log_path: PathBuf::new(),
            log_rotation_size: 0,
            log_rotation_age: 0,
            log_mode: LogMode::Append,
            log_line_prefix: String::new(),
            metrics_cache_max_age: 0,
            metrics_cache_max_size: 0,
            hugepage: HugePage::Try,
            update_process_title: ProcessTitleMode::Verbose,
            libev: "auto".to_string(),
            create_slot: false,
            ssh_hostname: String::new(),
            ssh_username: String::new(),
            ssh_base_dir: PathBuf::new(),
            ssh_ciphers: String::new(),
            s3_aws_region: String::new(),
            s3_access_key_id: String::new(),
            s3_secret_access_key: String::new(),
            s3_bucket: String::new(),
            s3_base_dir: PathBuf::new(),
            azure_storage_account: String::new(),
            azure_container: String::new(),
            azure_shared_key: String::new(),
            azure_base_dir: PathBuf::new(),
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Validate cross-field constraints after parsing.
    pub fn validate(&self) -> pgharbor_core::Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::config("base_dir is required"));
        }
        if self.log_type == LogType::File && self.log_path.as_os_str().is_empty() {
            return Err(Error::config("log_type = file requires log_path"));
        }
        for server in &self.servers {
            if server.name.is_empty() {
                return Err(Error::config("server section requires a name"));
            }
            if server.host.is_empty() {
                return Err(Error::config(format!(
                    "server '{}' requires host",
                    server.name
                )));
            }
        }
        Ok(())
    }

    /// Find a server by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Effective worker count for a server (per-server override, else main).
    pub fn effective_workers(&self, server: &ServerConfig) -> usize {
        server.workers.unwrap_or(self.workers)
    }

    /// Effective backup rate cap for a server.
    pub fn effective_backup_max_rate(&self, server: &ServerConfig) -> u64 {
        server.backup_max_rate.unwrap_or(self.backup_max_rate)
    }

    /// Effective retention for a server.
    pub fn effective_retention(&self, server: &ServerConfig) -> Retention {
        server.retention.unwrap_or(self.retention)
    }
}

/// Per-server configuration (`[server <name>]`).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Server name; also the per-server directory name under `base_dir`.
    pub name: String,
    /// Upstream host.
    pub host: String,
    /// Upstream port.
    pub port: u16,
    /// Replication user.
    pub username: String,
    /// Replication slot name.
    pub wal_slot: String,
    /// Create the slot on first connect (overrides main).
    pub create_slot: Option<bool>,
    /// Name of the server this one follows as a standby.
    pub follow: String,
    /// Per-server workspace override.
    pub workspace: Option<PathBuf>,
    /// Directory that receives a live copy of shipped WAL, empty when off.
    pub wal_shipping: PathBuf,
    /// Hot standby target directories.
    pub hot_standby: Vec<PathBuf>,
    /// Files overriding the restored configuration in the hot standby.
    pub hot_standby_overrides: String,
    /// Tablespace mapping for the hot standby.
    pub hot_standby_tablespaces: String,
    /// Per-server worker override.
    pub workers: Option<usize>,
    /// Per-server backup rate cap override.
    pub backup_max_rate: Option<u64>,
    /// Per-server network rate cap override.
    pub network_max_rate: Option<u64>,
    /// Per-server retention override.
    pub retention: Option<Retention>,
    /// Extra files copied alongside the base backup.
    pub extra: Vec<PathBuf>,
    /// Per-server TLS certificate file.
    pub tls_cert_file: PathBuf,
    /// Per-server TLS key file.
    pub tls_key_file: PathBuf,
    /// Per-server TLS CA file.
    pub tls_ca_file: PathBuf,
}

impl ServerConfig {
    /// A fresh server entry with the given name and defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            host: String::new(),
            port: 5432,
            username: String::new(),
            wal_slot: String::new(),
            create_slot: None,
            follow: String::new(),
            workspace: None,
            wal_shipping: PathBuf::new(),
            hot_standby: Vec::new(),
            hot_standby_overrides: String::new(),
            hot_standby_tablespaces: String::new(),
            workers: None,
            backup_max_rate: None,
            network_max_rate: None,
            retention: None,
            extra: Vec::new(),
            tls_cert_file: PathBuf::new(),
            tls_key_file: PathBuf::new(),
            tls_ca_file: PathBuf::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_parse_and_family() {
        assert_eq!(
            "client-zstd".parse::<Compression>().unwrap(),
            Compression::ClientZstd
        );
        assert_eq!(
            Compression::ClientZstd.family(),
            CompressionFamily::Zstd
        );
        assert!("brotli".parse::<Compression>().is_err());
    }

    #[test]
    fn test_compression_level_clamps() {
        assert_eq!(CompressionFamily::Gzip.clamp_level(99), 9);
        assert_eq!(CompressionFamily::Gzip.clamp_level(0), 1);
        assert_eq!(CompressionFamily::Zstd.clamp_level(-200_000), -131_072);
        assert_eq!(CompressionFamily::Zstd.clamp_level(22), 22);
        assert_eq!(CompressionFamily::Lz4.clamp_level(15), 12);
    }

    #[test]
    fn test_encryption_aliases() {
        assert_eq!("aes".parse::<Encryption>().unwrap(), Encryption::Aes256Cbc);
        assert_eq!(
            "aes-256".parse::<Encryption>().unwrap(),
            Encryption::Aes256Cbc
        );
        assert_eq!(
            "aes-128-ctr".parse::<Encryption>().unwrap(),
            Encryption::Aes128Ctr
        );
        assert_eq!(Encryption::Aes192Cbc.key_len(), 24);
    }

    #[test]
    fn test_storage_engine_bitfield() {
        let engines: StorageEngines = "local, s3".parse().unwrap();
        assert!(engines.local());
        assert!(engines.s3());
        assert!(!engines.ssh());
        assert_eq!(engines.as_string(), "local,s3");
        assert!("local,floppy".parse::<StorageEngines>().is_err());
        assert!("".parse::<StorageEngines>().is_err());
    }

    #[test]
    fn test_retention_parse() {
        let r: Retention = "2,1,1,-".parse().unwrap();
        assert_eq!(r.days, Some(2));
        assert_eq!(r.weeks, Some(1));
        assert_eq!(r.months, Some(1));
        assert_eq!(r.years, None);
        assert_eq!(r.to_string(), "2,1,1,-");
        assert_eq!(r.max_survivors(), 4);

        let r: Retention = "7".parse().unwrap();
        assert_eq!(r.days, Some(7));
        assert_eq!(r.weeks, None);

        assert!("1,2,3,4,5".parse::<Retention>().is_err());
        assert!("a,b".parse::<Retention>().is_err());
    }

    #[test]
    fn test_validate_requires_base_dir() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = Config {
            base_dir: PathBuf::from("/backup"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_overrides() {
        let mut server = ServerConfig::named("primary");
        server.host = "db1".to_string();
        server.workers = Some(8);
        let config = Config {
            base_dir: PathBuf::from("/backup"),
            workers: 4,
            backup_max_rate: 1000,
            servers: vec![server],
            ..Default::default()
        };
        let server = config.server("primary").unwrap();
        assert_eq!(config.effective_workers(server), 8);
        assert_eq!(config.effective_backup_max_rate(server), 1000);
    }
}
