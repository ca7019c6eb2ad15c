//! # chunkfs-read
//!
//! Client read engine for a chunk-based network file system.
//!
//! Files are split into fixed-size chunks, each replicated on several chunk
//! servers or striped across them with XOR parity. This crate turns a
//! `(inode, offset, size)` read into chunk fetches and keeps them fast when
//! servers are slow or failing.
//!
//! This crate provides:
//! - A pure retry/timeout policy with connect, wave and total budgets
//! - A wave dispatcher racing attempts across replicas
//! - Adaptive readahead with background prefetch into a shared cache
//! - A bandwidth governor capping speculative traffic
//! - XOR stripe reads with parity prefetch and reconstruction
//! - In-process and TCP transports
//!
//! # Example
//!
//! ```ignore
//! use chunkfs_read::{EngineConfig, Inode, ReadEngine};
//!
//! let engine = ReadEngine::builder(EngineConfig::default())
//!     .locator(locator)
//!     .transport(transport)
//!     .build()?;
//! let mut session = engine.open_session(Inode(1))?;
//! let outcome = session.read(0, 4096).await?;
//! ```

pub mod cache;
pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod governor;
pub mod interest;
pub mod locator;
pub mod policy;
pub mod readahead;
mod reader;
pub mod session;
pub mod tracing_support;
pub mod transport;
pub mod xor;

// Re-exports
pub use cache::{CacheKey, CacheStats, ChunkExtent, ChunkReadCache, ReadCache};
pub use chunk::{
    ByteRange, ChunkDescriptor, ChunkId, ChunkLayout, ChunkLocation, ChunkPart, ChunkVersion,
    Inode,
};
pub use config::{EngineConfig, WaveTimeoutModel, XorPrefetchPolicy};
pub use dispatch::{DispatchStats, FetchedData, PartTarget, WaveDispatcher};
pub use engine::{EngineParts, EngineStats, ReadEngine, ReadEngineBuilder};
pub use error::{
    AttemptFailure, ConfigError, LocatorError, ReadError, ReadResult, TransportError,
};
pub use governor::{Admission, BandwidthGovernor, GovernorStats};
pub use interest::{InterestCounter, ReadInterestRegistry};
pub use locator::{ChunkLocator, MemoryLocator};
pub use policy::{AttemptLedger, Decision, FailReason, RetryTimeoutPolicy};
pub use readahead::{AccessPattern, ReadaheadController};
pub use reader::ReadPurpose;
pub use session::{PrefetchBuffer, ReadOutcome, ReadSession, SessionStats};
pub use tracing_support::{init_tracing, TracingConfig, TracingFormat};
pub use transport::{
    ChunkServer, ChunkServerConfig, ChunkStore, ChunkTransport, MemoryChunkStore,
    MemoryTransport, ServerBehavior, ServerConnection, TcpTransport,
};
pub use xor::{PrefetchXorEngine, StripeGeometry, XorStats};
