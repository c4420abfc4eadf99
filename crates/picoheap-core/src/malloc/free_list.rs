//! Address-ordered free list.
//!
//! The list is intrusive: only the head lives here, every other link sits
//! in the first payload word of a free chunk. Chunks appear in strictly
//! increasing address order and never overlap, so a walk doubles as a
//! scan of the arena from low to high addresses.

use super::chunk::Chunk;
use super::region::BreakRegion;

/// Head of the general free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeList {
    head: Option<Chunk>,
}

impl FreeList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// First (lowest-addressed) free chunk.
    pub fn first(&self) -> Option<Chunk> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Points the link owned by `prev` at `next`.
    ///
    /// `prev == None` means the list head. This is the single splice
    /// primitive: unlinking `c` is `link(prev, c.next)`, inserting `c`
    /// after `prev` is `c.set_next(old); link(prev, Some(c))`.
    pub fn link<R: BreakRegion>(&mut self, region: &mut R, prev: Option<Chunk>, next: Option<Chunk>) {
        match prev {
            Some(prev) => prev.set_next(region, next),
            None => self.head = next,
        }
    }

    /// Walks the list from the head.
    pub fn iter<'a, R: BreakRegion>(&self, region: &'a R) -> FreeListIter<'a, R> {
        FreeListIter {
            region,
            current: self.head,
        }
    }

    /// Number of free chunks and their total size in bytes.
    pub fn totals<R: BreakRegion>(&self, region: &R) -> (usize, usize) {
        self.iter(region)
            .fold((0, 0), |(count, bytes), chunk| (count + 1, bytes + chunk.size(region)))
    }
}

/// Iterator over the general free list.
pub struct FreeListIter<'a, R> {
    region: &'a R,
    current: Option<Chunk>,
}

impl<R: BreakRegion> Iterator for FreeListIter<'_, R> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.current?;
        self.current = chunk.next(self.region);
        Some(chunk)
    }
}
