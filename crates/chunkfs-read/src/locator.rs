//! Chunk location lookup
//!
//! The engine resolves `(inode, chunk index)` to a [`ChunkDescriptor`]
//! through a [`ChunkLocator`]. In a deployment this talks to the metadata
//! server; [`MemoryLocator`] keeps the table in process.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::chunk::{ChunkDescriptor, ChunkId, ChunkLayout, ChunkLocation, ChunkVersion, Inode};
use crate::error::LocatorError;

/// Resolves chunk metadata for reads
#[async_trait]
pub trait ChunkLocator: Send + Sync {
    async fn locate(&self, inode: Inode, chunk_index: u32)
        -> Result<ChunkDescriptor, LocatorError>;
}

#[derive(Debug, Clone)]
struct ChunkRecord {
    chunk_id: ChunkId,
    version: ChunkVersion,
    layout: ChunkLayout,
    locations: Vec<ChunkLocation>,
}

#[derive(Debug, Clone, Default)]
struct FileRecord {
    length: u64,
    chunks: Vec<Option<ChunkRecord>>,
}

/// In-process chunk table
///
/// Unallocated chunk indices inside the file length resolve to holes.
#[derive(Debug, Default)]
pub struct MemoryLocator {
    files: DashMap<Inode, FileRecord>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or resize a file
    pub fn set_file_length(&self, inode: Inode, length: u64) {
        self.files.entry(inode).or_default().length = length;
    }

    /// Register chunk `index` of `inode`
    pub fn insert_chunk(
        &self,
        inode: Inode,
        index: u32,
        chunk_id: ChunkId,
        version: ChunkVersion,
        layout: ChunkLayout,
        locations: Vec<ChunkLocation>,
    ) {
        let mut file = self.files.entry(inode).or_default();
        let slot = index as usize;
        if file.chunks.len() <= slot {
            file.chunks.resize(slot + 1, None);
        }
        file.chunks[slot] = Some(ChunkRecord {
            chunk_id,
            version,
            layout,
            locations,
        });
    }

    /// Change the version of an existing chunk; returns false if absent
    pub fn set_version(&self, inode: Inode, index: u32, version: ChunkVersion) -> bool {
        let Some(mut file) = self.files.get_mut(&inode) else {
            return false;
        };
        match file.chunks.get_mut(index as usize) {
            Some(Some(record)) => {
                record.version = version;
                true
            }
            _ => false,
        }
    }

    pub fn remove_file(&self, inode: Inode) {
        self.files.remove(&inode);
    }
}

#[async_trait]
impl ChunkLocator for MemoryLocator {
    async fn locate(
        &self,
        inode: Inode,
        chunk_index: u32,
    ) -> Result<ChunkDescriptor, LocatorError> {
        let file = self
            .files
            .get(&inode)
            .ok_or(LocatorError::UnknownInode(inode))?;

        match file.chunks.get(chunk_index as usize) {
            Some(Some(record)) => Ok(ChunkDescriptor {
                inode,
                index: chunk_index,
                chunk_id: record.chunk_id,
                version: record.version,
                file_length: file.length,
                layout: record.layout,
                locations: record.locations.clone(),
            }),
            _ => Ok(ChunkDescriptor::hole(inode, chunk_index, file.length)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPart;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn test_locate_registered_chunk() {
        let locator = MemoryLocator::new();
        let server: SocketAddr = "10.0.0.1:9422".parse().unwrap();
        locator.set_file_length(Inode(5), 1000);
        locator.insert_chunk(
            Inode(5),
            0,
            ChunkId(11),
            ChunkVersion(2),
            ChunkLayout::Replicated,
            vec![ChunkLocation::new(server, ChunkPart::Standard)],
        );

        let desc = locator.locate(Inode(5), 0).await.unwrap();
        assert_eq!(desc.chunk_id, ChunkId(11));
        assert_eq!(desc.file_length, 1000);
        assert_eq!(desc.servers_for(ChunkPart::Standard), vec![server]);
    }

    #[tokio::test]
    async fn test_unallocated_index_is_hole() {
        let locator = MemoryLocator::new();
        locator.set_file_length(Inode(1), 1 << 30);
        let desc = locator.locate(Inode(1), 3).await.unwrap();
        assert!(desc.chunk_id.is_hole());
        assert!(desc.locations.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_inode() {
        let locator = MemoryLocator::new();
        assert_eq!(
            locator.locate(Inode(9), 0).await.unwrap_err(),
            LocatorError::UnknownInode(Inode(9))
        );
    }

    #[tokio::test]
    async fn test_set_version() {
        let locator = MemoryLocator::new();
        locator.insert_chunk(
            Inode(1),
            1,
            ChunkId(3),
            ChunkVersion(1),
            ChunkLayout::Replicated,
            Vec::new(),
        );
        assert!(locator.set_version(Inode(1), 1, ChunkVersion(2)));
        assert!(!locator.set_version(Inode(1), 0, ChunkVersion(2)));
        let desc = locator.locate(Inode(1), 1).await.unwrap();
        assert_eq!(desc.version, ChunkVersion(2));
    }
}
