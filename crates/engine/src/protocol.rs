//! Management protocol.
//!
//! Requests and responses travel as frames: a u32 total length (big
//! endian), a compression flag byte, an encryption flag byte, and a JSON
//! payload. The response's top-level `status` is `success`,
//! `restart_required`, or `error`; errors carry `{category, code,
//! message}` and the CLI mirrors the status into its exit code.

use pgharbor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Frame header size: length + compression flag + encryption flag.
const FRAME_HEADER: usize = 6;

/// Upper bound on accepted payloads.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Request categories accepted on the management socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Take a backup
    Backup,
    /// List backups
    ListBackup,
    /// Restore a backup
    Restore,
    /// Verify a backup
    Verify,
    /// Ship pending WAL
    Archive,
    /// Delete a backup
    Delete,
    /// Run a retention sweep
    Retain,
    /// Mark a backup invalid
    Expunge,
    /// Server information
    Info,
    /// Read a configuration key
    ConfGet,
    /// Stage or apply a configuration key
    ConfSet,
    /// Reload the configuration file
    ConfReload,
    /// List configuration keys
    ConfLs,
    /// Engine status
    Status,
    /// Liveness probe
    Ping,
    /// Reset metrics counters
    Reset,
    /// Stop the engine
    Shutdown,
    /// Query or set the WAL streaming mode
    Mode,
    /// Set or clear a backup's keep flag
    Annotate,
}

/// A management request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command category.
    pub command: Category,
    /// Target server, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Backup label, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Free-form parameters (restore target, conf key/value, flags).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    /// A request with just a command.
    pub fn new(command: Category) -> Request {
        Request {
            command,
            server: None,
            label: None,
            params: serde_json::Map::new(),
        }
    }

    /// Set the target server.
    pub fn server(mut self, server: impl Into<String>) -> Request {
        self.server = Some(server.into());
        self
    }

    /// Set the backup label.
    pub fn label(mut self, label: impl Into<String>) -> Request {
        self.label = Some(label.into());
        self
    }

    /// Add one parameter.
    pub fn param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Request {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Read a string parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Read a boolean parameter.
    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }
}

/// Top-level response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The command succeeded.
    Success,
    /// The change is staged; a restart must apply it.
    RestartRequired,
    /// The command failed.
    Error,
}

impl Status {
    /// Exit code the CLI mirrors for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::RestartRequired => 0,
            Status::Error => 1,
        }
    }
}

/// Error body of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Command category the failure belongs to.
    pub category: String,
    /// Stable taxonomy code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// A management response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Top-level status.
    pub status: Status,
    /// Error body when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Command-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Response {
    /// A success response with a payload.
    pub fn success(data: serde_json::Value) -> Response {
        Response {
            status: Status::Success,
            error: None,
            data,
        }
    }

    /// A restart-required response with a payload.
    pub fn restart_required(data: serde_json::Value) -> Response {
        Response {
            status: Status::RestartRequired,
            error: None,
            data,
        }
    }

    /// An error response derived from a failure.
    pub fn from_error(category: &str, error: &Error) -> Response {
        Response {
            status: Status::Error,
            error: Some(ErrorBody {
                category: category.to_string(),
                code: error.code().to_string(),
                message: error.to_string(),
            }),
            data: serde_json::Value::Null,
        }
    }
}

/// Write a length-prefixed frame carrying a JSON payload.
pub fn write_frame<W: Write>(writer: &mut W, payload: &impl Serialize) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    let total = (body.len() + FRAME_HEADER) as u32;
    if total > MAX_FRAME {
        return Err(Error::format("frame exceeds the size cap"));
    }
    let mut frame = Vec::with_capacity(total as usize);
    frame.extend_from_slice(&total.to_be_bytes());
    frame.push(0); // compression flag: plain JSON
    frame.push(0); // encryption flag: plain JSON
    frame.extend_from_slice(&body);
    writer.write_all(&frame).map_err(Error::from)
}

/// Read one frame and deserialize its JSON payload.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; FRAME_HEADER];
    reader.read_exact(&mut header).map_err(Error::from)?;
    let total = u32::from_be_bytes(header[0..4].try_into().unwrap());
    if total < FRAME_HEADER as u32 || total > MAX_FRAME {
        return Err(Error::format(format!("bad frame length {}", total)));
    }
    let compression = header[4];
    let encryption = header[5];
    if compression != 0 || encryption != 0 {
        return Err(Error::format(
            "compressed or encrypted frames require the transport layer",
        ));
    }
    let mut body = vec![0u8; total as usize - FRAME_HEADER];
    reader.read_exact(&mut body).map_err(Error::from)?;
    serde_json::from_slice(&body).map_err(Error::from)
}
