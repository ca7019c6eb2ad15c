//! Per-inode read sessions
//!
//! A [`ReadSession`] is the read state of one open file: the cursor, the
//! readahead window and the prefetches running ahead of the cursor. Each
//! [`ReadSession::read`] is one logical read with a single total deadline.
//!
//! # Features
//!
//! - **Chunk splitting**: a read spanning chunks becomes one piece per chunk,
//!   fetched concurrently
//! - **EOF clamping**: reads stop at the file length the locator reports;
//!   EOF is a short [`ReadOutcome`], never an error
//! - **Prefetch consumption**: pieces are cut at prefetch edges, and a piece
//!   inside an in-flight prefetch waits on it instead of issuing its own fetch
//! - **Governed readahead**: prefetch past the cursor only runs when the
//!   bandwidth governor admits it
//!
//! # Example
//!
//! ```ignore
//! let mut session = engine.open_session(Inode(7))?;
//! let outcome = session.read(0, 4096).await?;
//! assert!(outcome.len() <= 4096);
//! session.close();
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::chunk::{ByteRange, ChunkDescriptor, ChunkVersion, Inode};
use crate::engine::EngineShared;
use crate::error::{ReadError, ReadResult};
use crate::governor::Admission;
use crate::readahead::{AccessPattern, ReadaheadController};
use crate::reader::{PieceSource, ReadPurpose};
use crate::tracing_support::{record_bytes, record_prefetch};

/// Largest single prefetch request
const MAX_PREFETCH_PIECE: u64 = 1 << 20;
/// Prefetches a session keeps track of at once
const MAX_TRACKED_PREFETCHES: usize = 64;

/// Result of one logical read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Bytes,
    /// The read was cut short by the end of the file
    pub eof: bool,
}

impl ReadOutcome {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Data fetched ahead of the cursor
#[derive(Debug, Clone)]
pub struct PrefetchBuffer {
    pub chunk_index: u32,
    /// Chunk-relative range the prefetch asked for
    pub range: ByteRange,
    pub data: Bytes,
    pub version: ChunkVersion,
    pub fetched_at: Instant,
    pub is_parity: bool,
}

impl PrefetchBuffer {
    /// Bytes of `range` if this buffer covers it at `version`
    pub fn slice(&self, range: ByteRange, version: ChunkVersion) -> Option<Bytes> {
        if self.version != version || !self.range.contains(&range) {
            return None;
        }
        let start = (range.offset - self.range.offset) as usize;
        let end = (start + range.size as usize).min(self.data.len());
        Some(self.data.slice(start.min(end)..end))
    }
}

#[derive(Debug, Clone)]
enum PrefetchState {
    Pending,
    Ready(PrefetchBuffer),
    Failed,
}

struct InFlightPrefetch {
    end: u64,
    state: watch::Receiver<PrefetchState>,
    handle: AbortHandle,
}

/// Session statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub reads: u64,
    pub bytes_delivered: u64,
    pub cache_hits: u64,
    pub prefetch_hits: u64,
    pub fetches: u64,
    pub holes: u64,
    pub prefetches_issued: u64,
    pub prefetches_completed: u64,
    pub prefetches_denied: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct SessionStatsInternal {
    reads: AtomicU64,
    bytes_delivered: AtomicU64,
    cache_hits: AtomicU64,
    prefetch_hits: AtomicU64,
    fetches: AtomicU64,
    holes: AtomicU64,
    prefetches_issued: AtomicU64,
    prefetches_completed: AtomicU64,
    prefetches_denied: AtomicU64,
    errors: AtomicU64,
}

impl SessionStatsInternal {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            reads: self.reads.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            holes: self.holes.load(Ordering::Relaxed),
            prefetches_issued: self.prefetches_issued.load(Ordering::Relaxed),
            prefetches_completed: self.prefetches_completed.load(Ordering::Relaxed),
            prefetches_denied: self.prefetches_denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct Piece {
    desc: ChunkDescriptor,
    range: ByteRange,
    prefetch: Option<watch::Receiver<PrefetchState>>,
}

fn chunk_index(offset: u64, chunk_size: u64) -> ReadResult<u32> {
    u32::try_from(offset / chunk_size).map_err(|_| {
        ReadError::invalid_request(format!("offset {offset} is past the last addressable chunk"))
    })
}

/// Read state of one open inode
pub struct ReadSession {
    inode: Inode,
    shared: Arc<EngineShared>,
    readahead: ReadaheadController,
    cursor: u64,
    prefetched_until: u64,
    prefetches: BTreeMap<u64, InFlightPrefetch>,
    last_buffer: Option<Bytes>,
    stats: Arc<SessionStatsInternal>,
    closed: bool,
}

impl ReadSession {
    pub(crate) fn new(inode: Inode, shared: Arc<EngineShared>) -> Self {
        let readahead = ReadaheadController::from_config(&shared.config);
        Self {
            inode,
            shared,
            readahead,
            cursor: 0,
            prefetched_until: 0,
            prefetches: BTreeMap::new(),
            last_buffer: None,
            stats: Arc::new(SessionStatsInternal::default()),
            closed: false,
        }
    }

    pub fn inode(&self) -> Inode {
        self.inode
    }

    /// End of the furthest range delivered so far
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Current readahead window in bytes
    pub fn readahead_window(&self) -> u64 {
        self.readahead.window()
    }

    pub fn readahead(&self) -> &ReadaheadController {
        &self.readahead
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    /// Bytes delivered by the last successful read, until released
    pub fn last_buffer(&self) -> Option<&Bytes> {
        self.last_buffer.as_ref()
    }

    pub fn release_buffer(&mut self) {
        self.last_buffer = None;
    }

    /// Prefetches that have not yet published a result
    pub fn pending_prefetches(&self) -> usize {
        self.prefetches
            .values()
            .filter(|p| matches!(*p.state.borrow(), PrefetchState::Pending))
            .count()
    }

    /// Read up to `size` bytes at `offset`
    #[tracing::instrument(level = "debug", skip(self), fields(inode = %self.inode))]
    pub async fn read(&mut self, offset: u64, size: u32) -> ReadResult<ReadOutcome> {
        self.last_buffer = None;
        self.shared.ensure_running()?;
        let end = offset.checked_add(u64::from(size)).ok_or_else(|| {
            ReadError::invalid_request(format!("range {offset}+{size} overflows the file offset"))
        })?;
        SessionStatsInternal::bump(&self.stats.reads);
        if size == 0 {
            return Ok(ReadOutcome {
                data: Bytes::new(),
                eof: false,
            });
        }

        let started = Instant::now();
        self.shared.governor.record_demand(u64::from(size));
        self.retire_prefetches(offset);

        let deadline = started + self.shared.config.total_read_timeout;
        let range = self.read_range(offset, end, started);
        let result = match tokio::time::timeout_at(deadline, range).await {
            Ok(result) => result,
            Err(_) => Err(ReadError::total_timeout(started.elapsed())),
        };
        let (outcome, file_length) = match result {
            Ok(done) => done,
            Err(e) => {
                SessionStatsInternal::bump(&self.stats.errors);
                tracing::debug!(offset, size, error = %e, "read failed");
                return Err(e);
            }
        };

        if self.readahead.feed(offset, size) != AccessPattern::Sequential {
            self.prefetched_until = 0;
        }
        let delivered = outcome.len() as u64;
        self.cursor = self.cursor.max(offset + delivered);
        self.stats
            .bytes_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        record_bytes("session_read", outcome.len());

        if !outcome.eof {
            self.schedule_readahead(file_length);
        }
        self.last_buffer = Some(outcome.data.clone());
        Ok(outcome)
    }

    /// Resolve and read `[offset, end)`; returns the outcome and the file length
    async fn read_range(
        &self,
        offset: u64,
        end: u64,
        started: Instant,
    ) -> ReadResult<(ReadOutcome, u64)> {
        let chunk_size = self.shared.config.chunk_size;
        let mut pieces = Vec::new();
        let mut limit = end;
        let mut file_length;
        let mut pos = offset;

        loop {
            let index = chunk_index(pos, chunk_size)?;
            let desc = self.shared.locator.locate(self.inode, index).await?;
            file_length = desc.file_length;
            limit = limit.min(desc.file_length);
            if pos >= limit {
                break;
            }

            let chunk_start = u64::from(index) * chunk_size;
            let piece_end = limit.min(chunk_start + chunk_size);
            self.split_at_prefetches(desc, chunk_start, pos, piece_end, &mut pieces);

            pos = piece_end;
            if pos >= limit {
                break;
            }
        }

        let eof = limit < end;
        let reads = pieces.into_iter().map(|p| self.read_piece(p, started));
        let mut parts = try_join_all(reads).await?;

        let data = if parts.len() == 1 && parts[0].0.len() == parts[0].1 {
            parts.swap_remove(0).0
        } else {
            let total: usize = parts.iter().map(|(_, want)| *want).sum();
            let mut buf = BytesMut::with_capacity(total);
            for (bytes, want) in &parts {
                let take = bytes.len().min(*want);
                buf.extend_from_slice(&bytes[..take]);
                // Chunk data stored shorter than the file reads as zeros
                buf.resize(buf.len() + (*want - take), 0);
            }
            buf.freeze()
        };

        Ok((ReadOutcome { data, eof }, file_length))
    }

    /// Bytes for one piece and the length it must fill
    async fn read_piece(&self, piece: Piece, started: Instant) -> ReadResult<(Bytes, usize)> {
        let want = piece.range.size as usize;

        if let Some(state) = piece.prefetch {
            if let Some(data) = self.await_prefetch(state, &piece.desc, piece.range).await {
                SessionStatsInternal::bump(&self.stats.prefetch_hits);
                return Ok((data, want));
            }
        }

        let (data, source) = self
            .shared
            .reader
            .read(&piece.desc, piece.range, started, ReadPurpose::Foreground)
            .await?;
        let counter = match source {
            PieceSource::Hole => &self.stats.holes,
            PieceSource::Cache => &self.stats.cache_hits,
            PieceSource::Fetched => &self.stats.fetches,
        };
        SessionStatsInternal::bump(counter);
        Ok((data, want))
    }

    async fn await_prefetch(
        &self,
        mut state: watch::Receiver<PrefetchState>,
        desc: &ChunkDescriptor,
        range: ByteRange,
    ) -> Option<Bytes> {
        let wait = self.shared.config.effective_wave_timeout();
        let published = tokio::time::timeout(
            wait,
            state.wait_for(|s| !matches!(s, PrefetchState::Pending)),
        )
        .await
        .ok()?
        .ok()?
        .clone();

        match published {
            PrefetchState::Ready(buffer) => buffer.slice(range, desc.version),
            PrefetchState::Pending | PrefetchState::Failed => None,
        }
    }

    /// Cut `[start, end)` of one chunk at the edges of tracked prefetches so
    /// every piece is either inside one prefetch or outside all of them
    fn split_at_prefetches(
        &self,
        desc: ChunkDescriptor,
        chunk_start: u64,
        start: u64,
        end: u64,
        pieces: &mut Vec<Piece>,
    ) {
        let mut pos = start;
        while pos < end {
            let covering = self
                .prefetches
                .range(..=pos)
                .next_back()
                .filter(|(_, p)| p.end > pos);
            let (piece_end, prefetch) = match covering {
                Some((_, p)) => (p.end.min(end), Some(p.state.clone())),
                None => {
                    let next = self
                        .prefetches
                        .range(pos + 1..)
                        .next()
                        .map_or(end, |(&at, _)| at);
                    (next.min(end), None)
                }
            };
            pieces.push(Piece {
                desc: desc.clone(),
                range: ByteRange::new((pos - chunk_start) as u32, (piece_end - pos) as u32),
                prefetch,
            });
            pos = piece_end;
        }
    }

    /// Forget prefetches that end before `offset`
    fn retire_prefetches(&mut self, offset: u64) {
        self.prefetches.retain(|_, p| {
            let keep = p.end > offset;
            if !keep {
                p.handle.abort();
            }
            keep
        });
        while self.prefetches.len() > MAX_TRACKED_PREFETCHES {
            if let Some((_, p)) = self.prefetches.pop_first() {
                p.handle.abort();
            }
        }
    }

    fn schedule_readahead(&mut self, file_length: u64) {
        let window = self.readahead.window();
        if window == 0 {
            return;
        }

        let chunk_size = self.shared.config.chunk_size;
        let target = self.cursor.saturating_add(window).min(file_length);
        let mut pos = self.prefetched_until.max(self.cursor);

        while pos < target {
            let chunk_end = (pos / chunk_size + 1).saturating_mul(chunk_size);
            let piece_end = target
                .min(chunk_end)
                .min(pos.saturating_add(MAX_PREFETCH_PIECE));
            let bytes = piece_end - pos;

            let admitted = self.shared.governor.admit(bytes) == Admission::Allow;
            record_prefetch(self.inode, pos, bytes, admitted);
            if !admitted {
                self.readahead.prefetch_denied();
                SessionStatsInternal::bump(&self.stats.prefetches_denied);
                break;
            }

            self.spawn_prefetch(pos, piece_end);
            self.prefetched_until = piece_end;
            pos = piece_end;
        }
    }

    fn spawn_prefetch(&mut self, start: u64, end: u64) {
        let (tx, rx) = watch::channel(PrefetchState::Pending);
        let shared = Arc::clone(&self.shared);
        let stats = Arc::clone(&self.stats);
        let inode = self.inode;
        let mut shutdown = shared.shutdown_signal();

        let span = crate::timed_span!("prefetch", inode = inode.0, start = start, end = end);

        let prefetch = async move {
            let work = async {
                let started = Instant::now();
                let chunk_size = shared.config.chunk_size;
                let index = chunk_index(start, chunk_size)?;
                let desc = shared.locator.locate(inode, index).await?;
                let chunk_start = u64::from(index) * chunk_size;
                let range = ByteRange::new((start - chunk_start) as u32, (end - start) as u32);
                let data = shared.reader.prefetch(&desc, range, started).await?;
                Ok::<_, ReadError>(PrefetchBuffer {
                    chunk_index: index,
                    range,
                    data,
                    version: desc.version,
                    fetched_at: Instant::now(),
                    is_parity: false,
                })
            };
            let stopped = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };

            tokio::select! {
                result = work => {
                    let state = match result {
                        Ok(buffer) => {
                            SessionStatsInternal::bump(&stats.prefetches_completed);
                            PrefetchState::Ready(buffer)
                        }
                        Err(e) => {
                            tracing::debug!(inode = %inode, start, error = %e, "prefetch failed");
                            PrefetchState::Failed
                        }
                    };
                    tx.send_replace(state);
                }
                _ = stopped => {}
            }
        };
        let task = tokio::spawn(prefetch.instrument(span));

        SessionStatsInternal::bump(&self.stats.prefetches_issued);
        self.prefetches.insert(
            start,
            InFlightPrefetch {
                end,
                state: rx,
                handle: task.abort_handle(),
            },
        );
    }

    /// Abort prefetches, drop the retained buffer and release read interest
    pub fn close(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (_, prefetch) in std::mem::take(&mut self.prefetches) {
            prefetch.handle.abort();
        }
        self.last_buffer = None;
        self.shared.interest.release(self.inode);
        self.shared.session_closed();
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl std::fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSession")
            .field("inode", &self.inode)
            .field("cursor", &self.cursor)
            .field("window", &self.readahead.window())
            .field("prefetches", &self.prefetches.len())
            .finish()
    }
}
