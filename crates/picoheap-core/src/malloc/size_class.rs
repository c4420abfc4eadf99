//! Size classes for the small-chunk buckets.
//!
//! Classes are chunk sizes (header included), doubling from
//! [`MIN_CHUNK_SIZE`]. A chunk size is mapped to a bucket by rounding up to
//! the next class, so every chunk that ever sits in bucket `b` is exactly
//! [`bucket_size(b)`](bucket_size) bytes.

use super::chunk::MIN_CHUNK_SIZE;

/// Number of bucket classes.
pub const NUM_BUCKETS: usize = 6;

/// Largest chunk size served from a bucket.
pub const MAX_BUCKET_SIZE: usize = MIN_CHUNK_SIZE << (NUM_BUCKETS - 1);

/// Computes the bucket for a chunk of `chunk_size` bytes.
///
/// Rounds up to the next class. Sizes above [`MAX_BUCKET_SIZE`] return
/// `None` to signal the general free-list path.
pub fn bucket_index(chunk_size: usize) -> Option<usize> {
    if chunk_size > MAX_BUCKET_SIZE {
        return None;
    }
    let classes = chunk_size.max(MIN_CHUNK_SIZE).div_ceil(MIN_CHUNK_SIZE);
    Some(classes.next_power_of_two().trailing_zeros() as usize)
}

/// Returns the chunk size of bucket `index`.
///
/// Returns 0 for out-of-range indices.
pub fn bucket_size(index: usize) -> usize {
    if index < NUM_BUCKETS {
        MIN_CHUNK_SIZE << index
    } else {
        0
    }
}

/// Bucket whose class is exactly `chunk_size`, if any.
pub fn exact_bucket(chunk_size: usize) -> Option<usize> {
    bucket_index(chunk_size).filter(|&b| bucket_size(b) == chunk_size)
}
