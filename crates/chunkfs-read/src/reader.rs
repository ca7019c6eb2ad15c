//! Reads one piece of one chunk, from cache or servers

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::cache::{CacheKey, ChunkExtent, ReadCache};
use crate::chunk::{ByteRange, ChunkDescriptor, ChunkLayout, ChunkPart};
use crate::dispatch::{PartTarget, WaveDispatcher};
use crate::error::ReadResult;
use crate::tracing_support::record_fetch;
use crate::xor::PrefetchXorEngine;

/// Who a chunk read is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPurpose {
    /// A caller is waiting on the bytes
    Foreground,
    /// Readahead on behalf of a session
    Prefetch,
}

/// Where a piece came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PieceSource {
    Hole,
    Cache,
    Fetched,
}

pub(crate) struct ChunkReader {
    cache: Arc<dyn ReadCache>,
    dispatcher: Arc<WaveDispatcher>,
    xor: PrefetchXorEngine,
}

impl ChunkReader {
    pub(crate) fn new(
        cache: Arc<dyn ReadCache>,
        dispatcher: Arc<WaveDispatcher>,
        xor: PrefetchXorEngine,
    ) -> Self {
        Self {
            cache,
            dispatcher,
            xor,
        }
    }

    pub(crate) fn xor(&self) -> &PrefetchXorEngine {
        &self.xor
    }

    /// Read `range` of the chunk; the result may be shorter than asked when
    /// the stored chunk ends early
    pub(crate) async fn read(
        &self,
        desc: &ChunkDescriptor,
        range: ByteRange,
        started: Instant,
        purpose: ReadPurpose,
    ) -> ReadResult<(Bytes, PieceSource)> {
        if desc.chunk_id.is_hole() {
            let mut zeros = BytesMut::new();
            zeros.resize(range.size as usize, 0);
            return Ok((zeros.freeze(), PieceSource::Hole));
        }

        match desc.layout {
            ChunkLayout::Replicated => self.read_replicated(desc, range, started).await,
            ChunkLayout::XorStriped { level } => {
                let (data, cached) = self.xor.read(desc, level, range, started, purpose).await?;
                let source = if cached {
                    PieceSource::Cache
                } else {
                    PieceSource::Fetched
                };
                Ok((data, source))
            }
        }
    }

    /// Readahead read; XOR chunks also pull their parity rows
    pub(crate) async fn prefetch(
        &self,
        desc: &ChunkDescriptor,
        range: ByteRange,
        started: Instant,
    ) -> ReadResult<Bytes> {
        match desc.layout {
            ChunkLayout::XorStriped { level } if !desc.chunk_id.is_hole() => {
                let (data, ()) = tokio::join!(
                    self.read(desc, range, started, ReadPurpose::Prefetch),
                    self.xor.prefetch_parity(desc, level, range, started),
                );
                Ok(data?.0)
            }
            _ => Ok(self
                .read(desc, range, started, ReadPurpose::Prefetch)
                .await?
                .0),
        }
    }

    async fn read_replicated(
        &self,
        desc: &ChunkDescriptor,
        range: ByteRange,
        started: Instant,
    ) -> ReadResult<(Bytes, PieceSource)> {
        let key = CacheKey::new(desc.chunk_id, ChunkPart::Standard);
        if let Some(data) = self.cache.lookup(&key, range, desc.version) {
            return Ok((data, PieceSource::Cache));
        }

        let target = PartTarget {
            chunk_id: desc.chunk_id,
            version: desc.version,
            part: ChunkPart::Standard,
            servers: desc.servers_for(ChunkPart::Standard),
        };
        let fetched = self.dispatcher.fetch(&target, range, started).await?;
        record_fetch(
            desc.chunk_id,
            ChunkPart::Standard,
            fetched.data.len(),
            fetched.attempts,
            started.elapsed(),
        );

        self.cache.store(
            key,
            ChunkExtent::new(range.offset, fetched.data.clone(), desc.version)
                .with_eof(fetched.short),
        );
        Ok((fetched.data, PieceSource::Fetched))
    }
}
