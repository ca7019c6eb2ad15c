//! XOR-striped chunk reads and parity prefetch
//!
//! An XOR chunk of width `level` splits its data into blocks; block `b`
//! lives on data part `b % level` at part block `b / level`. A stripe row is
//! one block from every data part, and the parity part holds the XOR of
//! each row. Any `level` of the `level + 1` parts therefore recover a row.
//!
//! # Features
//!
//! - **Stripe reads**: fetch only the data parts a range touches, covering
//!   whole stripe rows so every part buffer lines up with the parity
//! - **Reconstruction**: a failed part (or, with parity prefetch on, a part
//!   stalled past its wave timeout) is rebuilt from parity and the remaining
//!   data parts
//! - **Latency race**: optionally fetch parity alongside the data and finish
//!   on the first `level` arrivals
//! - **Parity prefetch**: readahead of an XOR chunk also pulls the parity rows
//!   into the cache, subject to the bandwidth governor
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use chunkfs_read::chunk::ByteRange;
//! use chunkfs_read::xor::{reconstruct_part, StripeGeometry};
//!
//! let geometry = StripeGeometry::new(2, 4);
//! // Chunk bytes 0..16 striped over two parts: blocks 0 and 2 on part 0, 1 and 3 on part 1
//! let part0 = Bytes::from_static(&[0, 1, 2, 3, 8, 9, 10, 11]);
//! let part1 = Bytes::from_static(&[4, 5, 6, 7, 12, 13, 14, 15]);
//! let parity: Vec<u8> = part0.iter().zip(part1.iter()).map(|(a, b)| a ^ b).collect();
//!
//! let rebuilt = reconstruct_part(8, &parity, &[&part0[..]]);
//! assert_eq!(rebuilt, part1);
//!
//! let range = ByteRange::new(2, 12);
//! let rows = geometry.rows(range);
//! let data = geometry.assemble(range, rows, &[part0, part1]);
//! assert_eq!(&data[..], &[2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cache::{CacheKey, ChunkExtent, ReadCache};
use crate::chunk::{ByteRange, ChunkDescriptor, ChunkPart};
use crate::config::{EngineConfig, XorPrefetchPolicy};
use crate::dispatch::{FetchedData, PartTarget, WaveDispatcher};
use crate::error::{AttemptFailure, ReadError, ReadResult};
use crate::governor::{Admission, BandwidthGovernor};
use crate::reader::ReadPurpose;

/// Inclusive range of stripe rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSpan {
    pub first: u32,
    pub last: u32,
}

impl RowSpan {
    pub fn count(&self) -> u32 {
        self.last - self.first + 1
    }
}

/// Block layout of one XOR chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeGeometry {
    level: u32,
    block_size: u32,
}

impl StripeGeometry {
    pub fn new(level: u8, block_size: u32) -> Self {
        Self {
            level: u32::from(level.max(1)),
            block_size,
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    fn block_span(&self, range: ByteRange) -> (u64, u64) {
        let bs = u64::from(self.block_size);
        let first = u64::from(range.offset) / bs;
        let last = (range.end().max(1) - 1) / bs;
        (first, last.max(first))
    }

    /// Stripe rows covering a chunk range
    pub fn rows(&self, range: ByteRange) -> RowSpan {
        let (first, last) = self.block_span(range);
        let level = u64::from(self.level);
        RowSpan {
            first: (first / level) as u32,
            last: (last / level) as u32,
        }
    }

    /// Range within every part that holds `rows`
    pub fn part_range(&self, rows: RowSpan) -> ByteRange {
        let bs = u64::from(self.block_size);
        let offset = u64::from(rows.first) * bs;
        let size = u64::from(rows.count()) * bs;
        ByteRange::new(offset as u32, size.min(u64::from(u32::MAX)) as u32)
    }

    /// Data parts holding at least one block of the range
    pub fn touched_parts(&self, range: ByteRange) -> BTreeSet<usize> {
        let (first, last) = self.block_span(range);
        let level = u64::from(self.level);
        if last - first + 1 >= level {
            return (0..self.level as usize).collect();
        }
        (first..=last).map(|b| (b % level) as usize).collect()
    }

    /// Reassemble chunk bytes for `range` from row-aligned part buffers
    ///
    /// `parts[i]` must start at `part_range(rows).offset` of data part `i`;
    /// bytes missing past the end of a buffer read as zero.
    pub fn assemble(&self, range: ByteRange, rows: RowSpan, parts: &[Bytes]) -> Bytes {
        let bs = u64::from(self.block_size);
        let level = u64::from(self.level);
        let mut out = BytesMut::with_capacity(range.size as usize);
        let mut pos = u64::from(range.offset);
        let end = range.end();

        while pos < end {
            let block = pos / bs;
            let within = pos % bs;
            let take = (bs - within).min(end - pos);
            let row = block / level - u64::from(rows.first);
            let part_offset = (row * bs + within) as usize;

            let source = parts.get((block % level) as usize).map_or(&[][..], |p| &p[..]);
            let available = source.len().saturating_sub(part_offset).min(take as usize);
            if available > 0 {
                out.extend_from_slice(&source[part_offset..part_offset + available]);
            }
            out.resize(out.len() + (take as usize - available), 0);
            pos += take;
        }
        out.freeze()
    }
}

/// XOR `other` into `acc`; a shorter `other` acts as zero padding
pub fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other.iter()) {
        *a ^= *b;
    }
}

/// Rebuild a part of `len` bytes from parity and the other data parts
pub fn reconstruct_part(len: usize, parity: &[u8], others: &[&[u8]]) -> Bytes {
    let mut out = vec![0u8; len];
    xor_into(&mut out, parity);
    for other in others {
        xor_into(&mut out, other);
    }
    Bytes::from(out)
}

/// XOR engine statistics
#[derive(Debug, Clone, Default)]
pub struct XorStats {
    pub stripe_reads: u64,
    pub reconstructions: u64,
    /// Escalations caused by a stalled data part
    pub stall_escalations: u64,
    pub parity_prefetches: u64,
    pub parity_prefetch_denied: u64,
}

#[derive(Debug, Default)]
struct XorStatsInternal {
    stripe_reads: AtomicU64,
    reconstructions: AtomicU64,
    stall_escalations: AtomicU64,
    parity_prefetches: AtomicU64,
    parity_prefetch_denied: AtomicU64,
}

struct StripeRead<'a> {
    desc: &'a ChunkDescriptor,
    level: u8,
    span: ByteRange,
    started: Instant,
    slots: Vec<Option<Bytes>>,
    issued: Vec<bool>,
    failed: Vec<bool>,
    fetches: JoinSet<(usize, ReadResult<FetchedData>)>,
    last_error: Option<ReadError>,
}

impl StripeRead<'_> {
    fn parity_slot(&self) -> usize {
        usize::from(self.level)
    }

    fn part(&self, slot: usize) -> ChunkPart {
        if slot == self.parity_slot() {
            ChunkPart::XorParity { level: self.level }
        } else {
            ChunkPart::XorData {
                level: self.level,
                index: slot as u8,
            }
        }
    }

    fn key(&self, slot: usize) -> CacheKey {
        CacheKey::new(self.desc.chunk_id, self.part(slot))
    }

    fn missing_data(&self) -> Vec<usize> {
        (0..self.parity_slot())
            .filter(|&s| self.slots[s].is_none())
            .collect()
    }

    /// Whether some combination of outstanding parts can still finish the read
    fn recoverable(&self) -> bool {
        let failed_data = (0..self.parity_slot()).filter(|&s| self.failed[s]).count();
        failed_data == 0 || (failed_data == 1 && !self.failed[self.parity_slot()])
    }
}

/// Reads XOR chunks and prefetches their parity
pub struct PrefetchXorEngine {
    config: Arc<EngineConfig>,
    dispatcher: Arc<WaveDispatcher>,
    cache: Arc<dyn ReadCache>,
    governor: Arc<BandwidthGovernor>,
    stats: XorStatsInternal,
}

impl PrefetchXorEngine {
    pub fn new(
        config: Arc<EngineConfig>,
        dispatcher: Arc<WaveDispatcher>,
        cache: Arc<dyn ReadCache>,
        governor: Arc<BandwidthGovernor>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            cache,
            governor,
            stats: XorStatsInternal::default(),
        }
    }

    pub fn stats(&self) -> XorStats {
        XorStats {
            stripe_reads: self.stats.stripe_reads.load(Ordering::Relaxed),
            reconstructions: self.stats.reconstructions.load(Ordering::Relaxed),
            stall_escalations: self.stats.stall_escalations.load(Ordering::Relaxed),
            parity_prefetches: self.stats.parity_prefetches.load(Ordering::Relaxed),
            parity_prefetch_denied: self.stats.parity_prefetch_denied.load(Ordering::Relaxed),
        }
    }

    fn start_fetch(&self, read: &mut StripeRead<'_>, slot: usize) {
        if read.issued[slot] || read.slots[slot].is_some() {
            return;
        }
        read.issued[slot] = true;

        let part = read.part(slot);
        if let Some(data) = self.cache.lookup(&read.key(slot), read.span, read.desc.version) {
            read.slots[slot] = Some(data);
            return;
        }

        let target = PartTarget {
            chunk_id: read.desc.chunk_id,
            version: read.desc.version,
            part,
            servers: read.desc.servers_for(part),
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let (span, started) = (read.span, read.started);
        read.fetches
            .spawn(async move { (slot, dispatcher.fetch(&target, span, started).await) });
    }

    /// Fetch every part not yet requested, parity included
    fn escalate(&self, read: &mut StripeRead<'_>) {
        for slot in 0..=read.parity_slot() {
            self.start_fetch(read, slot);
        }
    }

    /// Read `range` of an XOR chunk; returns the bytes and whether no fetch was needed
    pub async fn read(
        &self,
        desc: &ChunkDescriptor,
        level: u8,
        range: ByteRange,
        started: Instant,
        purpose: ReadPurpose,
    ) -> ReadResult<(Bytes, bool)> {
        if level == 0 {
            return Err(ReadError::invalid_request(format!(
                "chunk {} has an XOR layout without data parts",
                desc.chunk_id
            )));
        }
        self.stats.stripe_reads.fetch_add(1, Ordering::Relaxed);

        let geometry = StripeGeometry::new(level, self.config.block_size);
        let rows = geometry.rows(range);
        let touched = geometry.touched_parts(range);
        let slots = usize::from(level) + 1;
        let mut read = StripeRead {
            desc,
            level,
            span: geometry.part_range(rows),
            started,
            slots: vec![None; slots],
            issued: vec![false; slots],
            failed: vec![false; slots],
            fetches: JoinSet::new(),
            last_error: None,
        };

        for &slot in &touched {
            self.start_fetch(&mut read, slot);
        }
        if touched.iter().all(|&s| read.slots[s].is_some()) {
            return Ok((self.finish(&geometry, range, rows, &read), true));
        }

        let foreground = purpose == ReadPurpose::Foreground;
        let mut escalated = false;
        if foreground
            && self.config.xor_prefetch
            && self.config.xor_policy == XorPrefetchPolicy::LatencyRace
        {
            self.escalate(&mut read);
            escalated = true;
        }

        let watch_stall = foreground && self.config.xor_prefetch && !escalated;
        let stall = tokio::time::sleep(self.config.effective_wave_timeout());
        tokio::pin!(stall);
        let deadline = started + self.config.total_read_timeout;

        loop {
            if touched.iter().all(|&s| read.slots[s].is_some()) {
                break;
            }

            let missing = read.missing_data();
            let parity = read.parity_slot();
            if missing.len() == 1 {
                if let Some(parity_data) = read.slots[parity].clone() {
                    self.rebuild(&mut read, missing[0], &parity_data);
                    break;
                }
            }

            if !read.recoverable() {
                return Err(read.last_error.take().unwrap_or_else(|| exhausted(desc)));
            }
            if read.fetches.is_empty() {
                if escalated {
                    return Err(read.last_error.take().unwrap_or_else(|| exhausted(desc)));
                }
                self.escalate(&mut read);
                escalated = true;
                continue;
            }

            tokio::select! {
                joined = read.fetches.join_next() => match joined {
                    Some(Ok((slot, Ok(fetched)))) => {
                        self.cache.store(
                            read.key(slot),
                            ChunkExtent::new(read.span.offset, fetched.data.clone(), desc.version)
                                .with_eof(fetched.short)
                                .with_parity(slot == parity),
                        );
                        read.slots[slot] = Some(fetched.data);
                    }
                    Some(Ok((slot, Err(e)))) => {
                        tracing::debug!(
                            chunk = %desc.chunk_id,
                            part = %read.part(slot),
                            error = %e,
                            "xor part fetch failed"
                        );
                        read.failed[slot] = true;
                        read.last_error = Some(e);
                        if !escalated {
                            self.escalate(&mut read);
                            escalated = true;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "xor part task ended abnormally");
                    }
                    None => {}
                },
                _ = &mut stall, if watch_stall && !escalated => {
                    tracing::debug!(chunk = %desc.chunk_id, "xor part stalled, fetching parity");
                    self.stats.stall_escalations.fetch_add(1, Ordering::Relaxed);
                    self.escalate(&mut read);
                    escalated = true;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ReadError::total_timeout(started.elapsed()));
                }
            }
        }

        Ok((self.finish(&geometry, range, rows, &read), false))
    }

    fn rebuild(&self, read: &mut StripeRead<'_>, slot: usize, parity: &Bytes) {
        let others: Vec<&[u8]> = (0..read.parity_slot())
            .filter(|&s| s != slot)
            .filter_map(|s| read.slots[s].as_deref())
            .collect();
        let rebuilt = reconstruct_part(read.span.size as usize, parity, &others);
        self.stats.reconstructions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            chunk = %read.desc.chunk_id,
            part = %read.part(slot),
            "rebuilt xor part from parity"
        );
        read.slots[slot] = Some(rebuilt);
    }

    fn finish(
        &self,
        geometry: &StripeGeometry,
        range: ByteRange,
        rows: RowSpan,
        read: &StripeRead<'_>,
    ) -> Bytes {
        let parts: Vec<Bytes> = read.slots[..read.parity_slot()]
            .iter()
            .map(|s| s.clone().unwrap_or_default())
            .collect();
        geometry.assemble(range, rows, &parts)
    }

    /// Pull the parity rows covering `range` into the cache
    pub async fn prefetch_parity(
        &self,
        desc: &ChunkDescriptor,
        level: u8,
        range: ByteRange,
        started: Instant,
    ) {
        if !self.config.xor_prefetch || level == 0 {
            return;
        }
        let geometry = StripeGeometry::new(level, self.config.block_size);
        let span = geometry.part_range(geometry.rows(range));
        let part = ChunkPart::XorParity { level };
        let key = CacheKey::new(desc.chunk_id, part);
        if self.cache.lookup(&key, span, desc.version).is_some() {
            return;
        }

        if self.governor.admit(u64::from(span.size)) == Admission::Deny {
            self.stats.parity_prefetch_denied.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let target = PartTarget {
            chunk_id: desc.chunk_id,
            version: desc.version,
            part,
            servers: desc.servers_for(part),
        };
        match self.dispatcher.fetch(&target, span, started).await {
            Ok(fetched) => {
                self.stats.parity_prefetches.fetch_add(1, Ordering::Relaxed);
                self.cache.store(
                    key,
                    ChunkExtent::new(span.offset, fetched.data, desc.version)
                        .with_eof(fetched.short)
                        .with_parity(true),
                );
            }
            Err(e) => {
                tracing::debug!(chunk = %desc.chunk_id, error = %e, "parity prefetch failed");
            }
        }
    }
}

fn exhausted(desc: &ChunkDescriptor) -> ReadError {
    ReadError::AllReplicasExhausted {
        chunk_id: desc.chunk_id,
        attempts: 0,
        last_failure: AttemptFailure::AttemptTimeout,
    }
}
