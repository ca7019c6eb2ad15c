//! Chunk identity, layout and placement
//!
//! A file is a sequence of fixed-size chunks. Each chunk is either
//! replicated (every location holds the full chunk) or XOR-striped across
//! `level` data parts plus one parity part.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// File identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inode(pub u32);

impl fmt::Display for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-wide chunk identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    /// Id of a chunk that was never written (sparse hole)
    pub const HOLE: ChunkId = ChunkId(0);

    pub fn is_hole(self) -> bool {
        self == Self::HOLE
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Chunk version; bumped on every modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkVersion(pub u32);

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Which piece of a chunk a server holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkPart {
    /// Full copy of a replicated chunk
    Standard,
    /// Data part `index` of an XOR stripe of width `level`
    XorData { level: u8, index: u8 },
    /// Parity part of an XOR stripe of width `level`
    XorParity { level: u8 },
}

impl ChunkPart {
    pub fn is_parity(self) -> bool {
        matches!(self, ChunkPart::XorParity { .. })
    }
}

impl fmt::Display for ChunkPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkPart::Standard => write!(f, "standard"),
            ChunkPart::XorData { level, index } => write!(f, "xor{level}:{index}"),
            ChunkPart::XorParity { level } => write!(f, "xor{level}:parity"),
        }
    }
}

/// Chunk redundancy layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkLayout {
    Replicated,
    /// `level` data parts plus one parity part
    XorStriped { level: u8 },
}

/// One server holding one part of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub server: SocketAddr,
    pub part: ChunkPart,
}

impl ChunkLocation {
    pub fn new(server: SocketAddr, part: ChunkPart) -> Self {
        Self { server, part }
    }
}

/// Resolved chunk metadata for one (inode, chunk index)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub inode: Inode,
    /// Position of the chunk within the file
    pub index: u32,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
    /// File length at resolution time, used for EOF clamping
    pub file_length: u64,
    pub layout: ChunkLayout,
    /// Candidate locations in preference order
    pub locations: Vec<ChunkLocation>,
}

impl ChunkDescriptor {
    /// Descriptor for an unwritten chunk inside the file length
    pub fn hole(inode: Inode, index: u32, file_length: u64) -> Self {
        Self {
            inode,
            index,
            chunk_id: ChunkId::HOLE,
            version: ChunkVersion(0),
            file_length,
            layout: ChunkLayout::Replicated,
            locations: Vec::new(),
        }
    }

    /// Servers holding `part`, in locator order
    pub fn servers_for(&self, part: ChunkPart) -> Vec<SocketAddr> {
        self.locations
            .iter()
            .filter(|loc| loc.part == part)
            .map(|loc| loc.server)
            .collect()
    }

    /// Bytes of file data held by this chunk
    pub fn data_length(&self, chunk_size: u64) -> u64 {
        let start = u64::from(self.index) * chunk_size;
        self.file_length.saturating_sub(start).min(chunk_size)
    }
}

/// Byte range inside a chunk (or inside a part of a chunk)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u32,
    pub size: u32,
}

impl ByteRange {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }

    pub fn contains(&self, other: &ByteRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }
}
