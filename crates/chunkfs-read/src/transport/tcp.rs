//! TCP transport and reference chunk server
//!
//! # Features
//!
//! - **Client** ([`TcpTransport`]): one request per read, reply streamed as
//!   checksummed blocks; chunk id, block offsets, block sizes and CRCs are all
//!   validated and the final status must account for every byte received
//! - **Server** ([`ChunkServer`]): serves parts from any [`ChunkStore`],
//!   answering version mismatches and missing chunks with a status
//! - **Statistics**: bytes and messages in both directions, connection counts

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::protocol::{
    max_message_length, read_frame, write_frame, Message, ReadData, ReadRequest, ReadStatus,
    StatusCode,
};
use super::store::ChunkStore;
use super::{ChunkTransport, PartReadReply, PartReadRequest, ServerConnection};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::TransportError;

/// Statistics for network operations
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
}

#[derive(Debug, Default)]
struct NetworkStatsInternal {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    active_connections: AtomicU64,
    failed_connections: AtomicU64,
}

impl NetworkStatsInternal {
    fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }
}

fn frame_size(message: &Message) -> usize {
    match message {
        Message::ReadData(block) => block.data.len() + 16,
        _ => 16,
    }
}

/// Client side of the TCP protocol
#[derive(Debug, Clone)]
pub struct TcpTransport {
    block_size: u32,
    stats: Arc<NetworkStatsInternal>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl TcpTransport {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            stats: Arc::new(NetworkStatsInternal::default()),
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }
}

#[async_trait]
impl ChunkTransport for TcpTransport {
    async fn connect(
        &self,
        server: SocketAddr,
    ) -> Result<Box<dyn ServerConnection>, TransportError> {
        let stream = match TcpStream::connect(server).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.failed_connections.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Connect(format!("{server}: {e}")));
            }
        };
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpConnection {
            stream,
            block_size: self.block_size,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct TcpConnection {
    stream: TcpStream,
    block_size: u32,
    stats: Arc<NetworkStatsInternal>,
}

#[async_trait]
impl ServerConnection for TcpConnection {
    async fn read(&mut self, request: &PartReadRequest) -> Result<PartReadReply, TransportError> {
        let message = Message::Read(ReadRequest {
            chunk_id: request.chunk_id,
            version: request.version,
            part: request.part,
            offset: request.offset,
            size: request.size,
        });
        let written = write_frame(&mut self.stream, &message).await?;
        self.stats.sent(written);

        let max_len = max_message_length(self.block_size);
        let mut data = BytesMut::with_capacity(request.size as usize);
        let mut expected_offset = request.offset;
        let mut saw_short_block = false;

        loop {
            let message = read_frame(&mut self.stream, max_len)
                .await?
                .ok_or_else(|| TransportError::Protocol("connection closed mid-reply".into()))?;
            self.stats.received(frame_size(&message));

            match message {
                Message::ReadData(block) => {
                    if block.chunk_id != request.chunk_id {
                        return Err(TransportError::Protocol(format!(
                            "block for chunk {} in reply for {}",
                            block.chunk_id, request.chunk_id
                        )));
                    }
                    if block.offset != expected_offset {
                        return Err(TransportError::Protocol(format!(
                            "block at offset {} but expected {expected_offset}",
                            block.offset
                        )));
                    }
                    if saw_short_block {
                        return Err(TransportError::Protocol("data after a short block".into()));
                    }
                    let len = block.data.len();
                    if len > self.block_size as usize || data.len() + len > request.size as usize {
                        return Err(TransportError::Protocol(format!("block of {len} bytes too long")));
                    }
                    if !block.crc_matches() {
                        return Err(TransportError::Crc {
                            offset: block.offset,
                        });
                    }

                    saw_short_block = len < self.block_size as usize;
                    expected_offset = expected_offset.saturating_add(len as u32);
                    data.extend_from_slice(&block.data);
                }
                Message::ReadStatus(status) => {
                    if status.chunk_id != request.chunk_id {
                        return Err(TransportError::Protocol(format!(
                            "status for chunk {} in reply for {}",
                            status.chunk_id, request.chunk_id
                        )));
                    }
                    return match status.status {
                        StatusCode::Ok if status.length as usize != data.len() => {
                            Err(TransportError::Protocol(format!(
                                "status received too early: {} of {} bytes",
                                data.len(),
                                status.length
                            )))
                        }
                        StatusCode::Ok => Ok(PartReadReply {
                            version: request.version,
                            data: data.freeze(),
                        }),
                        StatusCode::WrongVersion { current } => Err(TransportError::VersionMismatch {
                            expected: request.version,
                            found: current,
                        }),
                        StatusCode::NoSuchChunk => Err(TransportError::Status(format!(
                            "no such chunk {}",
                            request.chunk_id
                        ))),
                        StatusCode::InvalidRequest(msg) | StatusCode::Io(msg) => {
                            Err(TransportError::Status(msg))
                        }
                    };
                }
                Message::Read(_) => {
                    return Err(TransportError::Protocol("unexpected request from server".into()))
                }
            }
        }
    }
}

/// Chunk server configuration
#[derive(Debug, Clone)]
pub struct ChunkServerConfig {
    /// Address to bind (port 0 picks a free port)
    pub bind_address: SocketAddr,
    pub block_size: u32,
    /// Idle time before a client connection is dropped
    pub read_timeout: Duration,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            block_size: DEFAULT_BLOCK_SIZE,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Serves chunk parts over TCP
pub struct ChunkServer {
    listener: TcpListener,
    config: ChunkServerConfig,
    store: Arc<dyn ChunkStore>,
    stats: Arc<NetworkStatsInternal>,
}

impl ChunkServer {
    /// Bind the listening socket
    pub async fn bind(config: ChunkServerConfig, store: Arc<dyn ChunkStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "chunk server listening");
        Ok(Self {
            listener,
            config,
            store,
            stats: Arc::new(NetworkStatsInternal::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;

            let store = Arc::clone(&self.store);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();

            tokio::spawn(async move {
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = Self::handle_connection(stream, store, Arc::clone(&stats), config).await {
                    tracing::warn!(%peer, error = %e, "chunk server connection failed");
                    stats.failed_connections.fetch_add(1, Ordering::Relaxed);
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        store: Arc<dyn ChunkStore>,
        stats: Arc<NetworkStatsInternal>,
        config: ChunkServerConfig,
    ) -> Result<()> {
        // Requests are small; allow a generous frame anyway
        let max_len = max_message_length(config.block_size);

        loop {
            let message = match timeout(config.read_timeout, read_frame(&mut stream, max_len)).await {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            };
            stats.received(frame_size(&message));

            let Message::Read(request) = message else {
                anyhow::bail!("unexpected message from client");
            };
            Self::serve_read(&mut stream, &store, &stats, &config, request).await?;
        }
    }

    async fn serve_read(
        stream: &mut TcpStream,
        store: &Arc<dyn ChunkStore>,
        stats: &NetworkStatsInternal,
        config: &ChunkServerConfig,
        request: ReadRequest,
    ) -> Result<()> {
        let status = |status, length| {
            Message::ReadStatus(ReadStatus {
                chunk_id: request.chunk_id,
                status,
                length,
            })
        };

        let reply = match store.part(request.chunk_id, request.part) {
            None => status(StatusCode::NoSuchChunk, 0),
            Some(part) if part.version != request.version => status(
                StatusCode::WrongVersion {
                    current: part.version,
                },
                0,
            ),
            Some(part) => {
                let data = part.range(request.offset, request.size);
                let mut offset = request.offset;
                for block in data.chunks(config.block_size as usize) {
                    let frame = Message::ReadData(ReadData::new(request.chunk_id, offset, block.to_vec()));
                    stats.sent(write_frame(stream, &frame).await?);
                    offset = offset.saturating_add(block.len() as u32);
                }
                status(StatusCode::Ok, data.len() as u32)
            }
        };

        stats.sent(write_frame(stream, &reply).await?);
        Ok(())
    }
}
