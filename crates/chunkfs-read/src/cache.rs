//! Short-lived cache of fetched chunk ranges
//!
//! Entries are keyed by chunk id and part. Each entry carries the chunk
//! version it was read at: a newer version replaces everything cached for the
//! key, an older version is ignored, and a lookup at a different version
//! misses.
//!
//! # Features
//!
//! - **Concurrent**: `DashMap` of per-key extent lists, no global lock
//! - **Expiry**: extents older than the configured expiration never hit
//! - **Capacity**: oldest extents evicted first once over the byte budget
//! - **EOF-aware**: an extent that ended short of its request satisfies any
//!   lookup running past its end
//! - **Stitching**: a lookup spanning several adjacent extents is served from
//!   all of them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::chunk::{ByteRange, ChunkId, ChunkPart, ChunkVersion};

/// Cache key: one part of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub chunk_id: ChunkId,
    pub part: ChunkPart,
}

impl CacheKey {
    pub fn new(chunk_id: ChunkId, part: ChunkPart) -> Self {
        Self { chunk_id, part }
    }
}

/// A fetched range ready to be cached
#[derive(Debug, Clone)]
pub struct ChunkExtent {
    pub offset: u32,
    pub data: Bytes,
    pub version: ChunkVersion,
    /// The part ends at `offset + data.len()`
    pub eof: bool,
    pub is_parity: bool,
}

impl ChunkExtent {
    pub fn new(offset: u32, data: Bytes, version: ChunkVersion) -> Self {
        Self {
            offset,
            data,
            version,
            eof: false,
            is_parity: false,
        }
    }

    pub fn with_eof(mut self, eof: bool) -> Self {
        self.eof = eof;
        self
    }

    pub fn with_parity(mut self, is_parity: bool) -> Self {
        self.is_parity = is_parity;
        self
    }

    fn end(&self) -> u64 {
        u64::from(self.offset) + self.data.len() as u64
    }

    fn covers(&self, range: &ByteRange) -> bool {
        u64::from(self.offset) <= u64::from(range.offset) && (range.end() <= self.end() || self.eof)
    }

    fn slice(&self, range: &ByteRange) -> Bytes {
        let start = (range.offset - self.offset) as usize;
        let start = start.min(self.data.len());
        let end = start.saturating_add(range.size as usize).min(self.data.len());
        self.data.slice(start..end)
    }
}

/// Storage for fetched ranges shared by every session of an engine
pub trait ReadCache: Send + Sync {
    /// Bytes for `range` of `key` at exactly `version`, if cached and fresh
    fn lookup(&self, key: &CacheKey, range: ByteRange, version: ChunkVersion) -> Option<Bytes>;

    /// Insert a fetched range; stale versions are ignored
    fn store(&self, key: CacheKey, extent: ChunkExtent);

    /// Drop everything cached for a chunk
    fn invalidate(&self, chunk_id: ChunkId);

    fn clear(&self);
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub stale_stores: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub bytes: u64,
    pub parity_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheStatsInternal {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    stale_stores: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug)]
struct StoredExtent {
    extent: ChunkExtent,
    stored_at: Instant,
}

#[derive(Debug)]
struct PartEntry {
    version: ChunkVersion,
    extents: Vec<StoredExtent>,
}

/// Default [`ReadCache`] with expiry and an optional byte capacity
#[derive(Debug)]
pub struct ChunkReadCache {
    entries: DashMap<CacheKey, Arc<RwLock<PartEntry>>>,
    expiration: Duration,
    capacity: u64,
    bytes: AtomicU64,
    parity_bytes: AtomicU64,
    stats: CacheStatsInternal,
}

impl ChunkReadCache {
    /// `capacity` of zero means unbounded
    pub fn new(expiration: Duration, capacity: u64) -> Self {
        Self {
            entries: DashMap::new(),
            expiration,
            capacity,
            bytes: AtomicU64::new(0),
            parity_bytes: AtomicU64::new(0),
            stats: CacheStatsInternal::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stores: self.stats.stores.load(Ordering::Relaxed),
            stale_stores: self.stats.stale_stores.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            parity_bytes: self.parity_bytes.load(Ordering::Relaxed),
        }
    }

    fn account_removed(&self, extent: &ChunkExtent) {
        let len = extent.data.len() as u64;
        self.bytes.fetch_sub(len, Ordering::Relaxed);
        if extent.is_parity {
            self.parity_bytes.fetch_sub(len, Ordering::Relaxed);
        }
    }

    fn account_added(&self, extent: &ChunkExtent) {
        let len = extent.data.len() as u64;
        self.bytes.fetch_add(len, Ordering::Relaxed);
        if extent.is_parity {
            self.parity_bytes.fetch_add(len, Ordering::Relaxed);
        }
    }

    fn expired(&self, stored: &StoredExtent, now: Instant) -> bool {
        now.duration_since(stored.stored_at) >= self.expiration
    }

    fn miss(&self) -> Option<Bytes> {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn evict_to_capacity(&self) {
        if self.capacity == 0 {
            return;
        }
        while self.bytes.load(Ordering::Relaxed) > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter_map(|item| {
                    let entry = item.value().read();
                    entry
                        .extents
                        .iter()
                        .map(|s| s.stored_at)
                        .min()
                        .map(|at| (*item.key(), at))
                })
                .min_by_key(|(_, at)| *at);

            let Some((key, at)) = oldest else {
                break;
            };
            let Some(entry) = self.entries.get(&key).map(|e| Arc::clone(e.value())) else {
                continue;
            };

            let mut entry = entry.write();
            if let Some(pos) = entry.extents.iter().position(|s| s.stored_at == at) {
                let removed = entry.extents.remove(pos);
                self.account_removed(&removed.extent);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            let empty = entry.extents.is_empty();
            drop(entry);
            if empty {
                self.entries.remove_if(&key, |_, e| e.read().extents.is_empty());
            }
        }
    }
}

/// Bytes of `range` from one extent, or from a run of adjacent extents
fn stitch(extents: &[StoredExtent], range: &ByteRange) -> Option<Bytes> {
    if let Some(stored) = extents.iter().find(|s| s.extent.covers(range)) {
        return Some(stored.extent.slice(range));
    }

    let end = range.end();
    let mut pos = u64::from(range.offset);
    let mut out = BytesMut::with_capacity(range.size as usize);
    while pos < end {
        let next = extents
            .iter()
            .map(|s| &s.extent)
            .filter(|e| u64::from(e.offset) <= pos && (pos < e.end() || e.eof))
            .max_by_key(|e| e.end())?;
        let take = end.min(next.end()).saturating_sub(pos);
        out.extend_from_slice(&next.slice(&ByteRange::new(pos as u32, take as u32)));
        if next.eof && next.end() < end {
            break;
        }
        pos += take;
    }
    Some(out.freeze())
}

impl ReadCache for ChunkReadCache {
    fn lookup(&self, key: &CacheKey, range: ByteRange, version: ChunkVersion) -> Option<Bytes> {
        if self.expiration.is_zero() {
            return self.miss();
        }
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            return self.miss();
        };

        let now = Instant::now();
        let mut entry = entry.write();
        if entry.version != version {
            return self.miss();
        }

        let before = entry.extents.len();
        let mut removed = Vec::new();
        entry.extents.retain(|stored| {
            let keep = !self.expired(stored, now);
            if !keep {
                removed.push(stored.extent.clone());
            }
            keep
        });
        for extent in &removed {
            self.account_removed(extent);
        }
        self.stats
            .expirations
            .fetch_add((before - entry.extents.len()) as u64, Ordering::Relaxed);

        match stitch(&entry.extents, &range) {
            Some(data) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            None => self.miss(),
        }
    }

    fn store(&self, key: CacheKey, extent: ChunkExtent) {
        if self.expiration.is_zero() || (extent.data.is_empty() && !extent.eof) {
            return;
        }
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RwLock::new(PartEntry {
                    version: extent.version,
                    extents: Vec::new(),
                }))
            })
            .value()
            .clone();

        {
            let mut entry = entry.write();
            if extent.version < entry.version {
                self.stats.stale_stores.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if extent.version > entry.version {
                for stored in entry.extents.drain(..) {
                    self.account_removed(&stored.extent);
                }
                entry.version = extent.version;
            }

            // Extents fully inside the new one are redundant
            let new_start = u64::from(extent.offset);
            let new_end = extent.end();
            let mut replaced = Vec::new();
            entry.extents.retain(|stored| {
                let inside = u64::from(stored.extent.offset) >= new_start
                    && stored.extent.end() <= new_end;
                if inside {
                    replaced.push(stored.extent.clone());
                }
                !inside
            });
            for old in &replaced {
                self.account_removed(old);
            }

            self.account_added(&extent);
            entry.extents.push(StoredExtent {
                extent,
                stored_at: Instant::now(),
            });
        }

        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        self.evict_to_capacity();
    }

    fn invalidate(&self, chunk_id: ChunkId) {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|item| item.key().chunk_id == chunk_id)
            .map(|item| *item.key())
            .collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                for stored in entry.read().extents.iter() {
                    self.account_removed(&stored.extent);
                }
            }
        }
    }

    fn clear(&self) {
        self.entries.clear();
        self.bytes.store(0, Ordering::Relaxed);
        self.parity_bytes.store(0, Ordering::Relaxed);
    }
}
