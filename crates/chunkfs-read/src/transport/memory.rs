//! In-process simulated chunk servers
//!
//! [`MemoryTransport`] serves parts from per-server [`MemoryChunkStore`]s
//! after a configurable round trip, and lets each server misbehave in a
//! controlled way.
//!
//! # Example
//!
//! ```ignore
//! let transport = MemoryTransport::new(Duration::from_millis(5));
//! let store = transport.add_server(addr);
//! store.put(ChunkId(1), ChunkPart::Standard, ChunkVersion(1), data);
//! transport.set_behavior(addr, ServerBehavior::Hang);
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::store::{ChunkStore, MemoryChunkStore};
use super::{ChunkTransport, PartReadReply, PartReadRequest, ServerConnection};
use crate::chunk::ChunkVersion;
use crate::error::TransportError;

/// Fault injected into a simulated server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerBehavior {
    #[default]
    Healthy,
    /// Extra latency on every read
    Delay(Duration),
    /// Connections are refused
    Unreachable,
    /// Connecting takes this long
    SlowConnect(Duration),
    /// Accepts connections, never answers reads
    Hang,
    /// Serves data labelled with an older chunk version
    StaleVersion,
    /// Every block fails its checksum
    Corrupt,
    /// Replies carry one byte more than requested
    Oversized,
}

#[derive(Debug, Default)]
struct ServerState {
    store: Arc<MemoryChunkStore>,
    behavior: RwLock<ServerBehavior>,
    connects: AtomicU64,
    reads: AtomicU64,
}

/// Simulated cluster
#[derive(Debug)]
pub struct MemoryTransport {
    servers: DashMap<SocketAddr, Arc<ServerState>>,
    round_trip: Duration,
}

impl MemoryTransport {
    pub fn new(round_trip: Duration) -> Self {
        Self {
            servers: DashMap::new(),
            round_trip,
        }
    }

    /// Add a healthy server with an empty store
    pub fn add_server(&self, addr: SocketAddr) -> Arc<MemoryChunkStore> {
        let store = Arc::new(MemoryChunkStore::new());
        self.add_server_with_store(addr, Arc::clone(&store));
        store
    }

    pub fn add_server_with_store(&self, addr: SocketAddr, store: Arc<MemoryChunkStore>) {
        self.servers.insert(
            addr,
            Arc::new(ServerState {
                store,
                ..ServerState::default()
            }),
        );
    }

    pub fn store(&self, addr: SocketAddr) -> Option<Arc<MemoryChunkStore>> {
        self.servers.get(&addr).map(|s| Arc::clone(&s.store))
    }

    pub fn set_behavior(&self, addr: SocketAddr, behavior: ServerBehavior) {
        if let Some(server) = self.servers.get(&addr) {
            *server.behavior.write() = behavior;
        }
    }

    /// Connection attempts seen by `addr`
    pub fn connects(&self, addr: SocketAddr) -> u64 {
        self.servers
            .get(&addr)
            .map_or(0, |s| s.connects.load(Ordering::Relaxed))
    }

    /// Read requests received by `addr`
    pub fn reads(&self, addr: SocketAddr) -> u64 {
        self.servers
            .get(&addr)
            .map_or(0, |s| s.reads.load(Ordering::Relaxed))
    }

    /// Read requests received across the cluster
    pub fn total_reads(&self) -> u64 {
        self.servers
            .iter()
            .map(|s| s.reads.load(Ordering::Relaxed))
            .sum()
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn connect(
        &self,
        server: SocketAddr,
    ) -> Result<Box<dyn ServerConnection>, TransportError> {
        let state = self
            .servers
            .get(&server)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| TransportError::Connect(format!("no route to {server}")))?;

        state.connects.fetch_add(1, Ordering::Relaxed);
        let behavior = *state.behavior.read();
        match behavior {
            ServerBehavior::Unreachable => {
                return Err(TransportError::Connect(format!("{server} refused connection")))
            }
            ServerBehavior::SlowConnect(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        Ok(Box::new(MemoryConnection {
            state,
            round_trip: self.round_trip,
        }))
    }
}

struct MemoryConnection {
    state: Arc<ServerState>,
    round_trip: Duration,
}

#[async_trait]
impl ServerConnection for MemoryConnection {
    async fn read(&mut self, request: &PartReadRequest) -> Result<PartReadReply, TransportError> {
        self.state.reads.fetch_add(1, Ordering::Relaxed);
        let behavior = *self.state.behavior.read();

        match behavior {
            ServerBehavior::Hang => return std::future::pending().await,
            ServerBehavior::Delay(extra) => {
                tokio::time::sleep(self.round_trip.saturating_add(extra)).await
            }
            _ => tokio::time::sleep(self.round_trip).await,
        }

        let stored = self
            .state
            .store
            .part(request.chunk_id, request.part)
            .ok_or_else(|| TransportError::Status(format!("no such chunk {}", request.chunk_id)))?;

        let data = stored.range(request.offset, request.size);
        match behavior {
            ServerBehavior::StaleVersion => Ok(PartReadReply {
                version: ChunkVersion(request.version.0.saturating_sub(1)),
                data,
            }),
            _ if stored.version != request.version => Err(TransportError::VersionMismatch {
                expected: request.version,
                found: stored.version,
            }),
            ServerBehavior::Corrupt => Err(TransportError::Crc {
                offset: request.offset,
            }),
            ServerBehavior::Oversized => {
                let mut padded = BytesMut::from(&data[..]);
                padded.extend_from_slice(&[0u8]);
                Ok(PartReadReply {
                    version: stored.version,
                    data: padded.freeze(),
                })
            }
            _ => Ok(PartReadReply {
                version: stored.version,
                data,
            }),
        }
    }
}
