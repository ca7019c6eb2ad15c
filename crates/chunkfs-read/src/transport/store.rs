//! Server-side chunk part storage

use bytes::Bytes;
use dashmap::DashMap;

use crate::chunk::{ChunkId, ChunkPart, ChunkVersion};

/// One part held by a server
#[derive(Debug, Clone)]
pub struct StoredPart {
    pub version: ChunkVersion,
    pub data: Bytes,
}

impl StoredPart {
    /// Bytes of `[offset, offset + size)`, truncated at the end of the part
    pub fn range(&self, offset: u32, size: u32) -> Bytes {
        let len = self.data.len();
        let start = (offset as usize).min(len);
        let end = start.saturating_add(size as usize).min(len);
        self.data.slice(start..end)
    }
}

/// Provides parts to a chunk server
pub trait ChunkStore: Send + Sync {
    fn part(&self, chunk_id: ChunkId, part: ChunkPart) -> Option<StoredPart>;
}

/// Map-backed [`ChunkStore`]
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    parts: DashMap<(ChunkId, ChunkPart), StoredPart>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, chunk_id: ChunkId, part: ChunkPart, version: ChunkVersion, data: impl Into<Bytes>) {
        self.parts.insert(
            (chunk_id, part),
            StoredPart {
                version,
                data: data.into(),
            },
        );
    }

    pub fn remove(&self, chunk_id: ChunkId, part: ChunkPart) -> bool {
        self.parts.remove(&(chunk_id, part)).is_some()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn part(&self, chunk_id: ChunkId, part: ChunkPart) -> Option<StoredPart> {
        self.parts.get(&(chunk_id, part)).map(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_truncates_at_end() {
        let store = MemoryChunkStore::new();
        store.put(ChunkId(1), ChunkPart::Standard, ChunkVersion(1), vec![1u8; 100]);

        let part = store.part(ChunkId(1), ChunkPart::Standard).unwrap();
        assert_eq!(part.range(0, 10).len(), 10);
        assert_eq!(part.range(95, 10).len(), 5);
        assert!(part.range(200, 10).is_empty());
        assert!(store.part(ChunkId(2), ChunkPart::Standard).is_none());
    }
}
