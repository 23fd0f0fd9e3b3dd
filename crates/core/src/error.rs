//! Error types for pgharbor.
//!
//! A single unified error enum covers the whole engine; every variant maps
//! onto one taxonomy kind so management-protocol responses and process exit
//! codes can be derived mechanically from any failure.

use crate::lsn::Lsn;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pgharbor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy kind.
///
/// Kinds are stable identifiers: they appear as the `code` field of error
/// responses on the management socket and drive the CLI exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed configuration, out-of-range numeric, unknown enum value.
    ConfigInvalid,
    /// Handshake, master key, or user lookup failure.
    AuthFailure,
    /// Socket, TLS, SSH, or cloud-transport failure.
    TransportError,
    /// Filesystem read/write failure.
    IoError,
    /// WAL magic mismatch, page header inconsistency, unknown resource manager.
    FormatError,
    /// CRC mismatch at the record level.
    BadRecordCrc,
    /// Continuation crosses into an absent next segment.
    UnexpectedEof,
    /// Manifest checksum mismatch, file checksum mismatch, size mismatch.
    Corruption,
    /// Per-server operation exclusion.
    AlreadyInProgress,
    /// Allocation failure.
    OutOfMemory,
    /// Cooperative cancellation observed.
    Canceled,
}

impl ErrorKind {
    /// Stable taxonomy code for protocol responses.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::AuthFailure => "auth_failure",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::IoError => "io_error",
            ErrorKind::FormatError => "format_error",
            ErrorKind::BadRecordCrc => "bad_record_crc",
            ErrorKind::UnexpectedEof => "unexpected_eof",
            ErrorKind::Corruption => "corruption",
            ErrorKind::AlreadyInProgress => "already_in_progress",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::Canceled => "canceled",
        }
    }
}

/// Error type for the pgharbor engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value or file.
    #[error("invalid configuration: {message}")]
    ConfigInvalid {
        /// What was wrong
        message: String,
    },

    /// Authentication failure (handshake, master key, user lookup).
    #[error("authentication failure: {message}")]
    AuthFailure {
        /// What failed
        message: String,
    },

    /// Transport-level failure (socket, TLS, SSH, cloud SDK).
    #[error("transport error: {message}")]
    Transport {
        /// What failed
        message: String,
    },

    /// Filesystem failure, carrying the path that was touched.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// WAL or artifact format violation.
    #[error("format error: {message}")]
    Format {
        /// What was inconsistent
        message: String,
    },

    /// Record-level CRC mismatch. The reader stops at this LSN.
    #[error("bad record crc at {lsn}: expected {expected:08x}, computed {computed:08x}")]
    BadRecordCrc {
        /// LSN of the failing record
        lsn: Lsn,
        /// CRC stored in the record header
        expected: u32,
        /// CRC computed over the record
        computed: u32,
    },

    /// A record continuation crossed into an absent segment.
    #[error("unexpected end of WAL at {lsn}: {message}")]
    UnexpectedEof {
        /// LSN where the stream ended
        lsn: Lsn,
        /// What was missing
        message: String,
    },

    /// Integrity check failure (manifest, file checksum, size).
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the mismatch
        message: String,
    },

    /// Another operation of the same kind is running on this server.
    #[error("operation already in progress on server {server}: {operation}")]
    AlreadyInProgress {
        /// Server name
        server: String,
        /// Operation kind that was rejected
        operation: String,
    },

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// Cooperative cancellation was observed.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    /// Create a `ConfigInvalid` error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create an `AuthFailure` error.
    pub fn auth(message: impl Into<String>) -> Self {
        Error::AuthFailure {
            message: message.into(),
        }
    }

    /// Create a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }

    /// Create an `Io` error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Format` error.
    pub fn format(message: impl Into<String>) -> Self {
        Error::Format {
            message: message.into(),
        }
    }

    /// Create a `Corruption` error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption {
            message: message.into(),
        }
    }

    /// Create an `AlreadyInProgress` error.
    pub fn already_in_progress(server: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::AlreadyInProgress {
            server: server.into(),
            operation: operation.into(),
        }
    }

    /// Taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Error::AuthFailure { .. } => ErrorKind::AuthFailure,
            Error::Transport { .. } => ErrorKind::TransportError,
            Error::Io { .. } => ErrorKind::IoError,
            Error::Format { .. } => ErrorKind::FormatError,
            Error::BadRecordCrc { .. } => ErrorKind::BadRecordCrc,
            Error::UnexpectedEof { .. } => ErrorKind::UnexpectedEof,
            Error::Corruption { .. } => ErrorKind::Corruption,
            Error::AlreadyInProgress { .. } => ErrorKind::AlreadyInProgress,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::Canceled => ErrorKind::Canceled,
        }
    }

    /// Stable taxonomy code, mirrored into protocol error responses.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Process exit code for a command that failed with this error.
    ///
    /// 0 is success, 1 generic failure, 2 invalid configuration, 3 missing
    /// master key.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigInvalid { .. } => 2,
            Error::AuthFailure { message } if message.contains("master key") => 3,
            _ => 1,
        }
    }

    /// Whether a long-lived loop may retry after this error.
    ///
    /// Only auth and transport kinds are retried, and only by the WAL
    /// shipping loop; single-shot commands never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AuthFailure | ErrorKind::TransportError
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::OutOfMemory {
            return Error::OutOfMemory;
        }
        Error::Io {
            path: PathBuf::new(),
            source: e,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Format {
            message: format!("JSON error: {}", e),
        }
    }
}
