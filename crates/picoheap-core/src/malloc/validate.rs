//! Heap consistency checks.
//!
//! Walks the general free list and every bucket and reports the first
//! broken invariant. The checks never mutate the heap and never follow a
//! link outside the arena, so they are safe to run on a corrupted heap.

use thiserror::Error;

use super::arena::Arena;
use super::bucket::BucketCache;
use super::chunk::{CHUNK_ALIGN, Chunk, HEAD_ALIGN, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use super::free_list::FreeList;
use super::region::BreakRegion;
use super::size_class::{NUM_BUCKETS, bucket_size, exact_bucket};

/// A broken heap invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("chunk {head:#x}: payload misaligned")]
    MisalignedPayload { head: usize },
    #[error("chunk {head:#x}: header misaligned")]
    MisalignedHeader { head: usize },
    #[error("chunk {head:#x}: size {size} below the minimum chunk")]
    Undersized { head: usize, size: usize },
    #[error("chunk {head:#x}: size {size:#x} exceeds the chunk limit")]
    Oversized { head: usize, size: usize },
    #[error("chunk {head:#x}: size {size} not header aligned")]
    MisalignedSize { head: usize, size: usize },
    #[error("chunk {head:#x}+{size} lies outside the arena")]
    OutsideArena { head: usize, size: usize },
    #[error("free chunk {head:#x} ends at {end:#x}, past its successor {next:#x}")]
    OutOfOrder { head: usize, end: usize, next: usize },
    #[error("free chunk {head:#x} of bucket size {size} sits on the general list")]
    BucketSizedOnFreeList { head: usize, size: usize },
    #[error("bucket {bucket} holds chunk {head:#x} of size {size}, expected {expected}")]
    WrongBucketSize {
        bucket: usize,
        head: usize,
        size: usize,
        expected: usize,
    },
    #[error("bucket {bucket} does not terminate")]
    BucketCycle { bucket: usize },
    #[error("buckets hold {found} chunks, cache counts {expected}")]
    BucketCountMismatch { expected: usize, found: usize },
}

/// Checks the invariants every chunk must satisfy on its own.
pub fn check_chunk<R: BreakRegion>(region: &R, chunk: Chunk) -> Result<(), InvariantViolation> {
    let head = chunk.head();
    if chunk.payload() % CHUNK_ALIGN != 0 {
        return Err(InvariantViolation::MisalignedPayload { head });
    }
    if head % HEAD_ALIGN != 0 {
        return Err(InvariantViolation::MisalignedHeader { head });
    }
    let size = chunk.size(region);
    if size < MIN_CHUNK_SIZE {
        return Err(InvariantViolation::Undersized { head, size });
    }
    if size >= MAX_CHUNK_SIZE {
        return Err(InvariantViolation::Oversized { head, size });
    }
    if size % HEAD_ALIGN != 0 {
        return Err(InvariantViolation::MisalignedSize { head, size });
    }
    Ok(())
}

/// Reads and checks a chunk reached through a free link.
fn check_linked<R: BreakRegion>(
    region: &R,
    arena: &Arena,
    chunk: Chunk,
) -> Result<usize, InvariantViolation> {
    let head = chunk.head();
    // The header itself must be inside the arena before it can be read.
    if !arena.contains(head, MIN_CHUNK_SIZE) {
        return Err(InvariantViolation::OutsideArena {
            head,
            size: MIN_CHUNK_SIZE,
        });
    }
    check_chunk(region, chunk)?;
    let size = chunk.size(region);
    if !arena.contains(head, size) {
        return Err(InvariantViolation::OutsideArena { head, size });
    }
    Ok(size)
}

/// Checks the whole free structure.
///
/// The general list must be address ordered with no overlap; when a bucket
/// cache is present, no general chunk may have a bucket class size and
/// every bucket chunk must have exactly its class size.
pub fn check_heap<R: BreakRegion>(
    region: &R,
    arena: &Arena,
    free_list: &FreeList,
    buckets: Option<&BucketCache>,
) -> Result<(), InvariantViolation> {
    let mut cursor = free_list.first();
    while let Some(chunk) = cursor {
        let size = check_linked(region, arena, chunk)?;
        let head = chunk.head();
        if buckets.is_some() && exact_bucket(size).is_some() {
            return Err(InvariantViolation::BucketSizedOnFreeList { head, size });
        }
        let next = chunk.next(region);
        if let Some(next) = next {
            let end = head + size;
            if end > next.head() {
                return Err(InvariantViolation::OutOfOrder {
                    head,
                    end,
                    next: next.head(),
                });
            }
        }
        cursor = next;
    }

    let Some(cache) = buckets else {
        return Ok(());
    };

    // A well-formed bucket cannot hold more chunks than fit in the arena.
    let bound = arena.span() / MIN_CHUNK_SIZE;
    let mut found = 0;
    for bucket in 0..NUM_BUCKETS {
        let expected = bucket_size(bucket);
        for (seen, chunk) in cache.iter(region, bucket).enumerate() {
            if seen > bound {
                return Err(InvariantViolation::BucketCycle { bucket });
            }
            let size = check_linked(region, arena, chunk)?;
            if size != expected {
                return Err(InvariantViolation::WrongBucketSize {
                    bucket,
                    head: chunk.head(),
                    size,
                    expected,
                });
            }
            found += 1;
        }
    }
    if found != cache.total_cached() {
        return Err(InvariantViolation::BucketCountMismatch {
            expected: cache.total_cached(),
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::chunk::HEAD_SIZE;
    use crate::malloc::region::VecRegion;

    struct Fixture {
        region: VecRegion,
        arena: Arena,
        list: FreeList,
    }

    /// Arena of adjacent chunks with the given sizes, none of them linked.
    fn fixture(sizes: &[usize]) -> (Fixture, Vec<Chunk>) {
        let mut region = VecRegion::new(1 << 16);
        let mut arena = Arena::new();
        let mut chunks = Vec::new();
        for &size in sizes {
            let chunk = Chunk::at(arena.grow(&mut region, size).unwrap());
            chunk.set_size(&mut region, size);
            chunks.push(chunk);
        }
        let list = FreeList::new();
        (
            Fixture {
                region,
                arena,
                list,
            },
            chunks,
        )
    }

    fn link_all(f: &mut Fixture, chunks: &[Chunk]) {
        let mut prev = None;
        for &chunk in chunks {
            chunk.set_next(&mut f.region, None);
            f.list.link(&mut f.region, prev, Some(chunk));
            prev = Some(chunk);
        }
    }

    #[test]
    fn test_empty_heap_is_valid() {
        let (f, _) = fixture(&[]);
        assert_eq!(check_heap(&f.region, &f.arena, &f.list, None), Ok(()));
        let cache = BucketCache::new();
        assert_eq!(check_heap(&f.region, &f.arena, &f.list, Some(&cache)), Ok(()));
    }

    #[test]
    fn test_check_chunk_flags_each_field() {
        let (mut f, chunks) = fixture(&[48]);
        let chunk = chunks[0];
        assert_eq!(check_chunk(&f.region, chunk), Ok(()));

        chunk.set_size(&mut f.region, MIN_CHUNK_SIZE - HEAD_ALIGN);
        assert!(matches!(
            check_chunk(&f.region, chunk),
            Err(InvariantViolation::Undersized { .. })
        ));

        chunk.set_size(&mut f.region, MAX_CHUNK_SIZE);
        assert!(matches!(
            check_chunk(&f.region, chunk),
            Err(InvariantViolation::Oversized { .. })
        ));

        chunk.set_size(&mut f.region, MIN_CHUNK_SIZE + 1);
        assert!(matches!(
            check_chunk(&f.region, chunk),
            Err(InvariantViolation::MisalignedSize { .. })
        ));

        chunk.set_size(&mut f.region, 48);
        let shifted = Chunk::at(chunk.head() + 1);
        assert!(matches!(
            check_chunk(&f.region, shifted),
            Err(InvariantViolation::MisalignedPayload { .. })
        ));
    }

    #[test]
    fn test_ordered_list_is_valid() {
        let (mut f, chunks) = fixture(&[48, 48, 48]);
        link_all(&mut f, &[chunks[0], chunks[2]]);
        assert_eq!(check_heap(&f.region, &f.arena, &f.list, None), Ok(()));
    }

    #[test]
    fn test_out_of_order_list_is_rejected() {
        let (mut f, chunks) = fixture(&[48, 48]);
        link_all(&mut f, &[chunks[1], chunks[0]]);
        assert!(matches!(
            check_heap(&f.region, &f.arena, &f.list, None),
            Err(InvariantViolation::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_overlapping_neighbours_are_rejected() {
        let (mut f, chunks) = fixture(&[48, 48]);
        link_all(&mut f, &chunks);
        chunks[0].set_size(&mut f.region, 48 + 16);
        assert_eq!(
            check_heap(&f.region, &f.arena, &f.list, None),
            Err(InvariantViolation::OutOfOrder {
                head: chunks[0].head(),
                end: chunks[0].head() + 64,
                next: chunks[1].head(),
            })
        );
    }

    #[test]
    fn test_link_outside_arena_is_rejected() {
        let (mut f, chunks) = fixture(&[48]);
        link_all(&mut f, &chunks);
        let top = f.arena.top().unwrap();
        f.region.write_word(chunks[0].payload(), top + HEAD_SIZE);
        assert!(matches!(
            check_heap(&f.region, &f.arena, &f.list, None),
            Err(InvariantViolation::OutsideArena { .. })
        ));
    }

    #[test]
    fn test_bucket_sized_general_chunk_is_rejected_only_with_buckets() {
        let size = bucket_size(1);
        let (mut f, chunks) = fixture(&[size]);
        link_all(&mut f, &chunks);
        assert_eq!(check_heap(&f.region, &f.arena, &f.list, None), Ok(()));

        let cache = BucketCache::new();
        assert!(matches!(
            check_heap(&f.region, &f.arena, &f.list, Some(&cache)),
            Err(InvariantViolation::BucketSizedOnFreeList { .. })
        ));
    }

    #[test]
    fn test_bucket_chunk_of_wrong_size_is_rejected() {
        let (mut f, chunks) = fixture(&[bucket_size(0), bucket_size(2)]);
        let mut cache = BucketCache::new();
        cache.push(&mut f.region, 0, chunks[0]);
        cache.push(&mut f.region, 1, chunks[1]);
        assert_eq!(
            check_heap(&f.region, &f.arena, &f.list, Some(&cache)),
            Err(InvariantViolation::WrongBucketSize {
                bucket: 1,
                head: chunks[1].head(),
                size: bucket_size(2),
                expected: bucket_size(1),
            })
        );
    }

    #[test]
    fn test_bucket_cycle_is_detected() {
        let (mut f, chunks) = fixture(&[bucket_size(0)]);
        let mut cache = BucketCache::new();
        cache.push(&mut f.region, 0, chunks[0]);
        // Second push of the same chunk links it to itself.
        cache.push(&mut f.region, 0, chunks[0]);
        assert_eq!(
            check_heap(&f.region, &f.arena, &f.list, Some(&cache)),
            Err(InvariantViolation::BucketCycle { bucket: 0 })
        );
    }
}
