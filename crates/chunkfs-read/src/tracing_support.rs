//! Structured logging for the read path
//!
//! The engine emits `tracing` events and spans unconditionally; this module
//! installs a subscriber for binaries and tests that want to see them, and
//! holds the helpers used to record read-path events with consistent field
//! names.
//!
//! # Features
//!
//! - **Structured logging**: pretty, compact and JSON output
//! - **Event filtering**: `RUST_LOG` style directives via `EnvFilter`
//! - **Span instrumentation**: dispatcher fetches run inside a `fetch` span
//!
//! # Example
//!
//! ```ignore
//! use chunkfs_read::tracing_support::{init_tracing, TracingConfig, TracingFormat};
//!
//! init_tracing(TracingConfig {
//!     format: TracingFormat::Compact,
//!     filter: "chunkfs_read=debug".to_string(),
//!     ..TracingConfig::default()
//! })?;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directive (default `chunkfs_read=info,warn`)
//! - `CHUNKFS_LOG_FORMAT`: `pretty`, `compact` or `json` (default `pretty`)

use std::time::Duration;

use anyhow::Result;
#[cfg(feature = "subscriber")]
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::chunk::{ChunkId, ChunkPart, Inode};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "chunkfs_read=info,warn";

/// Tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    Pretty,
    Json,
    /// Single line per event
    Compact,
}

impl TracingFormat {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => TracingFormat::Json,
            "compact" => TracingFormat::Compact,
            _ => TracingFormat::Pretty,
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub format: TracingFormat,
    /// Filter directive, e.g. `chunkfs_read=debug`
    pub filter: String,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        let format = std::env::var("CHUNKFS_LOG_FORMAT")
            .map(|s| TracingFormat::parse(&s))
            .unwrap_or(TracingFormat::Pretty);
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        Self {
            format,
            filter,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// Install a global subscriber; call once at startup
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)?;

    match config.format {
        TracingFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_ansi(config.with_ansi)
                .with_target(config.with_target)
                .with_thread_ids(config.with_thread_ids)
                .with_file(config.with_file)
                .with_line_number(config.with_line_number)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        TracingFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(config.with_target)
                .with_thread_ids(config.with_thread_ids)
                .with_file(config.with_file)
                .with_line_number(config.with_line_number)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        TracingFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(config.with_ansi)
                .with_target(config.with_target)
                .with_thread_ids(config.with_thread_ids)
                .with_file(config.with_file)
                .with_line_number(config.with_line_number)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Without the `subscriber` feature the host installs its own subscriber
#[cfg(not(feature = "subscriber"))]
pub fn init_tracing(_config: TracingConfig) -> Result<()> {
    Ok(())
}

/// Span for a unit of read-path work
///
/// ```ignore
/// let _guard = timed_span!("session_read", inode = 7, size = 4096).entered();
/// ```
#[macro_export]
macro_rules! timed_span {
    ($name:expr) => {
        tracing::debug_span!($name)
    };
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug_span!($name, $($field = $value),+)
    };
}

/// A part fetched from a server
pub fn record_fetch(
    chunk_id: ChunkId,
    part: ChunkPart,
    bytes: usize,
    attempts: u32,
    elapsed: Duration,
) {
    tracing::debug!(
        chunk = %chunk_id,
        part = %part,
        bytes,
        attempts,
        elapsed_ms = elapsed.as_millis() as u64,
        "part_fetched"
    );
}

/// A readahead decision
pub fn record_prefetch(inode: Inode, offset: u64, bytes: u64, admitted: bool) {
    tracing::debug!(
        inode = %inode,
        offset,
        bytes,
        admitted,
        "prefetch"
    );
}

/// Bytes handed back to a caller
pub fn record_bytes(operation: &str, bytes: usize) {
    tracing::trace!(
        operation,
        bytes,
        kib = bytes as f64 / 1024.0,
        "bytes_delivered"
    );
}
