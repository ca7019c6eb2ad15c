//! Chunk server transports
//!
//! The dispatcher only sees [`ChunkTransport`] and [`ServerConnection`].
//! Two implementations ship with the crate:
//!
//! - [`tcp`]: length-prefixed bincode frames over TCP, with a matching
//!   [`tcp::ChunkServer`]
//! - [`memory`]: an in-process simulated cluster with fault injection

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::chunk::{ChunkId, ChunkPart, ChunkVersion};
use crate::error::TransportError;

pub mod memory;
pub mod protocol;
pub mod store;
pub mod tcp;

pub use memory::{MemoryTransport, ServerBehavior};
pub use store::{ChunkStore, MemoryChunkStore, StoredPart};
pub use tcp::{ChunkServer, ChunkServerConfig, TcpTransport};

/// Read of one range of one chunk part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReadRequest {
    pub chunk_id: ChunkId,
    /// Version the client expects the server to hold
    pub version: ChunkVersion,
    pub part: ChunkPart,
    pub offset: u32,
    pub size: u32,
}

/// Data returned by a server; may be shorter than requested at end of part
#[derive(Debug, Clone)]
pub struct PartReadReply {
    /// Version the server actually served
    pub version: ChunkVersion,
    pub data: Bytes,
}

/// Opens connections to chunk servers
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn connect(&self, server: SocketAddr)
        -> Result<Box<dyn ServerConnection>, TransportError>;
}

/// An established connection to one chunk server
#[async_trait]
pub trait ServerConnection: Send {
    async fn read(&mut self, request: &PartReadRequest) -> Result<PartReadReply, TransportError>;
}
