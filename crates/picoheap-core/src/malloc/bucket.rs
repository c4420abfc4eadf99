//! Bucket cache for small chunks.
//!
//! One singly linked LIFO list per size class. Every chunk in bucket `b`
//! is exactly `bucket_size(b)` bytes, so a pop never splits and a push
//! never coalesces. Links are threaded through the chunks' own payloads.

use super::chunk::Chunk;
use super::region::BreakRegion;
use super::size_class::NUM_BUCKETS;

/// Heads of the per-class free lists plus a running count.
#[derive(Debug, Clone)]
pub struct BucketCache {
    heads: [Option<Chunk>; NUM_BUCKETS],
    total_cached: usize,
}

impl BucketCache {
    /// Creates a cache with every bucket empty.
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_BUCKETS],
            total_cached: 0,
        }
    }

    /// Pops a chunk from `bucket`.
    ///
    /// Returns `None` if the bucket is empty (caller should fall back to the
    /// general free list).
    pub fn pop<R: BreakRegion>(&mut self, region: &R, bucket: usize) -> Option<Chunk> {
        let head = self.heads.get(bucket).copied().flatten()?;
        self.heads[bucket] = head.next(region);
        self.total_cached -= 1;
        Some(head)
    }

    /// Pushes `chunk` onto `bucket`.
    pub fn push<R: BreakRegion>(&mut self, region: &mut R, bucket: usize, chunk: Chunk) {
        chunk.set_next(region, self.heads[bucket]);
        self.heads[bucket] = Some(chunk);
        self.total_cached += 1;
    }

    /// Whether `chunk` is currently cached in `bucket`.
    pub fn contains<R: BreakRegion>(&self, region: &R, bucket: usize, chunk: Chunk) -> bool {
        self.iter(region, bucket).any(|cached| cached == chunk)
    }

    /// Walks the chunks cached in `bucket`, most recently pushed first.
    pub fn iter<'a, R: BreakRegion>(&self, region: &'a R, bucket: usize) -> BucketIter<'a, R> {
        BucketIter {
            region,
            current: self.heads.get(bucket).copied().flatten(),
        }
    }

    /// Number of chunks in `bucket`.
    pub fn len<R: BreakRegion>(&self, region: &R, bucket: usize) -> usize {
        self.iter(region, bucket).count()
    }

    /// Total number of cached chunks across all buckets.
    pub fn total_cached(&self) -> usize {
        self.total_cached
    }

    /// Returns true if no bucket holds a chunk.
    pub fn is_empty(&self) -> bool {
        self.total_cached == 0
    }
}

impl Default for BucketCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over one bucket.
pub struct BucketIter<'a, R> {
    region: &'a R,
    current: Option<Chunk>,
}

impl<R: BreakRegion> Iterator for BucketIter<'_, R> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.current?;
        self.current = chunk.next(self.region);
        Some(chunk)
    }
}
