//! Multi-server wave dispatch
//!
//! [`WaveDispatcher::fetch`] reads one range of one chunk part from the
//! servers holding it. It starts with the first candidate; whenever an
//! attempt exhausts its connect or data-wait budget, another wave goes to the
//! next candidate while the earlier attempts keep running. The first valid
//! reply wins and every other attempt is aborted.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = WaveDispatcher::new(config, transport, governor);
//! let fetched = dispatcher.fetch(&target, ByteRange::new(0, 65536), Instant::now()).await?;
//! println!("{} bytes from {} after {} attempts", fetched.data.len(), fetched.server, fetched.attempts);
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::chunk::{ByteRange, ChunkId, ChunkPart, ChunkVersion};
use crate::config::EngineConfig;
use crate::error::{AttemptFailure, ReadError, ReadResult};
use crate::governor::BandwidthGovernor;
use crate::policy::{AttemptLedger, Decision, FailReason, RetryTimeoutPolicy};
use crate::transport::{ChunkTransport, PartReadReply, PartReadRequest};

/// What to fetch and from where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTarget {
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    pub part: ChunkPart,
    /// Candidate servers in preference order
    pub servers: Vec<SocketAddr>,
}

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchedData {
    pub data: Bytes,
    /// Fewer bytes than requested: the part ends inside the range
    pub short: bool,
    pub server: SocketAddr,
    /// Attempts issued, including the winner
    pub attempts: u32,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub fetches: u64,
    pub attempts: u64,
    /// Waves started while an earlier attempt was still alive
    pub redundant_waves: u64,
    pub version_mismatches: u64,
    pub connect_failures: u64,
    pub malformed_replies: u64,
    pub failures: u64,
    pub bytes_fetched: u64,
}

#[derive(Debug, Default)]
struct DispatchStatsInternal {
    fetches: AtomicU64,
    attempts: AtomicU64,
    redundant_waves: AtomicU64,
    version_mismatches: AtomicU64,
    connect_failures: AtomicU64,
    malformed_replies: AtomicU64,
    failures: AtomicU64,
    bytes_fetched: AtomicU64,
}

impl DispatchStatsInternal {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            redundant_waves: self.redundant_waves.load(Ordering::Relaxed),
            version_mismatches: self.version_mismatches.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            malformed_replies: self.malformed_replies.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
        }
    }

    fn count_failure(&self, failure: &AttemptFailure) {
        let counter = match failure {
            AttemptFailure::ConnectFailure { .. } => &self.connect_failures,
            AttemptFailure::VersionMismatch { .. } => &self.version_mismatches,
            AttemptFailure::Malformed(_) => &self.malformed_replies,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum AttemptEvent {
    Connected { seq: u32 },
    Failed { seq: u32, failure: AttemptFailure },
    Replied { seq: u32, reply: PartReadReply },
}

/// Races read attempts across the servers holding a part
pub struct WaveDispatcher {
    transport: Arc<dyn ChunkTransport>,
    governor: Arc<BandwidthGovernor>,
    policy: RetryTimeoutPolicy,
    stats: DispatchStatsInternal,
}

impl WaveDispatcher {
    pub fn new(
        config: &EngineConfig,
        transport: Arc<dyn ChunkTransport>,
        governor: Arc<BandwidthGovernor>,
    ) -> Self {
        Self {
            transport,
            governor,
            policy: RetryTimeoutPolicy::new(config),
            stats: DispatchStatsInternal::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    /// Fetch `range` of `target`, bounded by the total timeout counted from `started`
    #[tracing::instrument(
        level = "debug",
        skip(self, target),
        fields(chunk = %target.chunk_id, part = %target.part, offset = range.offset, size = range.size)
    )]
    pub async fn fetch(
        &self,
        target: &PartTarget,
        range: ByteRange,
        started: Instant,
    ) -> ReadResult<FetchedData> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);

        let request = PartReadRequest {
            chunk_id: target.chunk_id,
            version: target.version,
            part: target.part,
            offset: range.offset,
            size: range.size,
        };
        let mut ledger = AttemptLedger::new(target.servers.len());
        let mut attempts = JoinSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        loop {
            let elapsed = started.elapsed();
            match self.policy.decide(&ledger, elapsed) {
                Decision::Issue { server, timeouts }
                | Decision::RetryNextServer { server, timeouts } => {
                    if ledger.in_flight() > 0 {
                        self.stats.redundant_waves.fetch_add(1, Ordering::Relaxed);
                        self.governor.record_speculative(u64::from(range.size));
                    }
                    let seq = ledger.record_issue(server, elapsed, timeouts);
                    let addr = target.servers[server];
                    self.stats.attempts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(seq, server = %addr, "issuing read attempt");

                    attempts.spawn(run_attempt(
                        Arc::clone(&self.transport),
                        addr,
                        seq,
                        request.clone(),
                        timeouts.connect,
                        tx.clone(),
                    ));
                }
                Decision::Wait(wait) => {
                    let Some(event) = recv_within(&mut rx, wait).await else {
                        continue;
                    };
                    match event {
                        AttemptEvent::Connected { seq } => {
                            ledger.mark_connected(seq, started.elapsed());
                        }
                        AttemptEvent::Failed { seq, failure } => {
                            tracing::debug!(seq, %failure, "read attempt failed");
                            self.stats.count_failure(&failure);
                            ledger.mark_failed(seq, failure);
                        }
                        AttemptEvent::Replied { seq, reply } => {
                            match validate_reply(&request, reply) {
                                Ok((data, short)) => {
                                    let server = ledger
                                        .get(seq)
                                        .map_or(target.servers[0], |a| target.servers[a.server]);
                                    self.stats
                                        .bytes_fetched
                                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                                    // Late replies from the losers go nowhere
                                    attempts.abort_all();
                                    return Ok(FetchedData {
                                        data,
                                        short,
                                        server,
                                        attempts: ledger.len() as u32,
                                    });
                                }
                                Err(failure) => {
                                    if let AttemptFailure::VersionMismatch { found, .. } = &failure {
                                        tracing::warn!(
                                            chunk = %target.chunk_id,
                                            expected = %target.version,
                                            found = %found,
                                            "server returned wrong chunk version"
                                        );
                                    }
                                    self.stats.count_failure(&failure);
                                    ledger.mark_failed(seq, failure);
                                }
                            }
                        }
                    }
                }
                Decision::Fail(reason) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    attempts.abort_all();
                    return Err(match reason {
                        FailReason::TotalTimeout => ReadError::total_timeout(started.elapsed()),
                        FailReason::AllReplicasExhausted => {
                            let last_failure = ledger
                                .last_failure()
                                .cloned()
                                .unwrap_or(AttemptFailure::AttemptTimeout);
                            tracing::warn!(
                                chunk = %target.chunk_id,
                                attempts = ledger.len(),
                                %last_failure,
                                "all replicas exhausted"
                            );
                            ReadError::AllReplicasExhausted {
                                chunk_id: target.chunk_id,
                                attempts: ledger.len() as u32,
                                last_failure,
                            }
                        }
                    });
                }
            }
        }
    }
}

async fn recv_within(
    rx: &mut mpsc::UnboundedReceiver<AttemptEvent>,
    wait: Duration,
) -> Option<AttemptEvent> {
    tokio::select! {
        event = rx.recv() => event,
        _ = tokio::time::sleep(wait) => None,
    }
}

fn validate_reply(
    request: &PartReadRequest,
    reply: PartReadReply,
) -> Result<(Bytes, bool), AttemptFailure> {
    if reply.version != request.version {
        return Err(AttemptFailure::VersionMismatch {
            expected: request.version,
            found: reply.version,
        });
    }
    let len = reply.data.len() as u64;
    if len > u64::from(request.size) {
        return Err(AttemptFailure::Malformed(format!(
            "reply of {len} bytes for a {} byte request",
            request.size
        )));
    }
    Ok((reply.data, len < u64::from(request.size)))
}

async fn run_attempt(
    transport: Arc<dyn ChunkTransport>,
    server: SocketAddr,
    seq: u32,
    request: PartReadRequest,
    connect_budget: Duration,
    events: mpsc::UnboundedSender<AttemptEvent>,
) {
    let server_name = server.to_string();
    let mut connection = match tokio::time::timeout(connect_budget, transport.connect(server)).await
    {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            let failure = AttemptFailure::from_transport(&server_name, e);
            let _ = events.send(AttemptEvent::Failed { seq, failure });
            return;
        }
        Err(_) => {
            let _ = events.send(AttemptEvent::Failed {
                seq,
                failure: AttemptFailure::AttemptTimeout,
            });
            return;
        }
    };

    let _ = events.send(AttemptEvent::Connected { seq });

    let event = match connection.read(&request).await {
        Ok(reply) => AttemptEvent::Replied { seq, reply },
        Err(e) => AttemptEvent::Failed {
            seq,
            failure: AttemptFailure::from_transport(&server_name, e),
        },
    };
    let _ = events.send(event);
}
