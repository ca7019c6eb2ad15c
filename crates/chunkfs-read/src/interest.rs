//! Read-interest bookkeeping
//!
//! Sessions announce which inodes are being read so the rest of the client
//! (attribute caching, write invalidation) can account for active readers.

use dashmap::DashMap;

use crate::chunk::Inode;

/// Tracks inodes with active readers
pub trait ReadInterestRegistry: Send + Sync {
    fn acquire(&self, inode: Inode);
    fn release(&self, inode: Inode);
}

/// Reference-counting registry
#[derive(Debug, Default)]
pub struct InterestCounter {
    counts: DashMap<Inode, usize>,
}

impl InterestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active readers of `inode`
    pub fn active(&self, inode: Inode) -> usize {
        self.counts.get(&inode).map_or(0, |c| *c)
    }

    /// Inodes with at least one reader
    pub fn inodes(&self) -> Vec<Inode> {
        self.counts.iter().map(|item| *item.key()).collect()
    }
}

impl ReadInterestRegistry for InterestCounter {
    fn acquire(&self, inode: Inode) {
        *self.counts.entry(inode).or_insert(0) += 1;
    }

    fn release(&self, inode: Inode) {
        self.counts.remove_if_mut(&inode, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}
