//! Error types for the client read path
//!
//! # Design
//!
//! - **`ReadError`**: terminal outcome of a logical read, surfaced to callers
//! - **`AttemptFailure`**: why a single wave attempt failed; recovered locally
//!   by the retry policy and only ever seen inside `ReadError` as context
//! - **`LocatorError`**, **`TransportError`**: collaborator failures
//! - **`ConfigError`**: rejected engine configuration
//!
//! # Examples
//!
//! ```
//! use chunkfs_read::error::{ReadError, ReadResult};
//!
//! fn checked_end(offset: u64, size: u32) -> ReadResult<u64> {
//!     offset
//!         .checked_add(u64::from(size))
//!         .ok_or_else(|| ReadError::invalid_request("range overflows u64"))
//! }
//!
//! assert!(checked_end(u64::MAX, 1).is_err());
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::chunk::{ChunkId, ChunkVersion, Inode};

/// Result alias for read path operations
pub type ReadResult<T> = std::result::Result<T, ReadError>;

/// Terminal error of a logical read
#[derive(Error, Debug, Clone)]
pub enum ReadError {
    /// Every candidate server failed or the retry budget ran out
    #[error("all replicas exhausted for chunk {chunk_id} after {attempts} attempts: {last_failure}")]
    AllReplicasExhausted {
        chunk_id: ChunkId,
        attempts: u32,
        last_failure: AttemptFailure,
    },

    /// The hard ceiling on a logical read elapsed
    #[error("total read timeout exceeded after {elapsed:?}")]
    TotalTimeoutExceeded { elapsed: Duration },

    /// Chunk metadata could not be resolved
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),

    /// The engine was terminated before or during the call
    #[error("read engine has been terminated")]
    EngineTerminated,

    /// Request rejected before any I/O
    #[error("invalid read request: {0}")]
    InvalidRequest(String),
}

impl ReadError {
    /// Build an `InvalidRequest` error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Build a `TotalTimeoutExceeded` error
    pub fn total_timeout(elapsed: Duration) -> Self {
        Self::TotalTimeoutExceeded { elapsed }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AllReplicasExhausted { .. } | Self::TotalTimeoutExceeded { .. }
        ) || matches!(self, Self::Locator(LocatorError::Unavailable(_)))
    }
}

/// Why a single attempt against one server failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Connection could not be established
    #[error("connect failure to {server}: {reason}")]
    ConnectFailure { server: String, reason: String },

    /// Connect or data wait exceeded its budget
    #[error("attempt timed out")]
    AttemptTimeout,

    /// Server holds a different chunk version
    #[error("version mismatch: expected {expected}, server has {found}")]
    VersionMismatch {
        expected: ChunkVersion,
        found: ChunkVersion,
    },

    /// Reply violated the protocol (too long, bad crc, bad offsets)
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// Server answered with an error status
    #[error("server error: {0}")]
    Server(String),
}

impl AttemptFailure {
    /// Classify a transport error observed by an attempt
    pub fn from_transport(server: &str, err: TransportError) -> Self {
        match err {
            TransportError::Connect(reason) => Self::ConnectFailure {
                server: server.to_string(),
                reason,
            },
            TransportError::Timeout => Self::AttemptTimeout,
            TransportError::VersionMismatch { expected, found } => {
                Self::VersionMismatch { expected, found }
            }
            TransportError::Protocol(msg) => Self::Malformed(msg),
            TransportError::Crc { offset } => Self::Malformed(format!("crc mismatch at {offset}")),
            TransportError::Codec(msg) => Self::Malformed(msg),
            TransportError::Status(msg) => Self::Server(msg),
            TransportError::Io(msg) => Self::Server(msg),
        }
    }
}

/// Chunk locator failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("unknown inode {0}")]
    UnknownInode(Inode),

    #[error("chunk index {index} of inode {inode} is not allocated")]
    NoSuchChunk { inode: Inode, index: u32 },

    #[error("locator unavailable: {0}")]
    Unavailable(String),
}

/// Transport failures reported by `ChunkTransport` and `ServerConnection`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("operation timed out")]
    Timeout,

    #[error("chunk version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        expected: ChunkVersion,
        found: ChunkVersion,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("crc mismatch in block at offset {offset}")]
    Crc { offset: u32 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("server status: {0}")]
    Status(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Rejected engine configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid environment variable {var}={value}")]
    InvalidEnv { var: String, value: String },

    #[error("missing engine collaborator: {0}")]
    MissingCollaborator(&'static str),
}

impl ConfigError {
    /// Build an `InvalidValue` error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
