//! Core allocator state.
//!
//! One [`MallocState`] owns one arena: its break region, the general free
//! list, the optional bucket cache and the lifecycle log. Allocation tries
//! the bucket for the request's class, then walks the general list first
//! fit (splitting, consuming whole, or growing the tail chunk in place),
//! and finally carves a fresh chunk off the arena. Freed chunks go back to
//! their bucket, or into the general list in address order, merged with
//! both free neighbours.

use std::fmt;

use thiserror::Error;

use super::arena::{Arena, GrowError};
use super::bucket::BucketCache;
use super::chunk::{
    CHUNK_ALIGN, Chunk, HEAD_ALIGN, HEAD_SIZE, MAX_ALLOCATION_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE, align_up, chunk_size,
};
use super::free_list::FreeList;
use super::log::{
    AllocatorLogLevel, AllocatorLogRecord, LifecycleLog, LogEvent, LogSnapshot,
};
use super::region::BreakRegion;
use super::size_class::{NUM_BUCKETS, bucket_index, bucket_size, exact_bucket};
use super::validate::{self, InvariantViolation};
use crate::config::{HeapConfig, HeapMode};

/// Why an allocator call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MallocError {
    #[error("request of {requested} bytes exceeds the {max}-byte allocation limit")]
    RequestTooLarge { requested: usize, max: usize },
    #[error("out of memory serving a {requested}-byte request")]
    OutOfMemory { requested: usize },
    #[error("double free of {ptr:#x}")]
    DoubleFree { ptr: usize },
    #[error("{ptr:#x} is not a live allocation of this heap")]
    ForeignPointer { ptr: usize },
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
}

/// Heap usage summary, laid out after the C `struct mallinfo` fields this
/// allocator can fill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallInfo {
    /// Bytes between arena start and top.
    pub arena: usize,
    /// Chunks on the general free list.
    pub ordblks: usize,
    /// Chunks parked in buckets.
    pub smblks: usize,
    /// Bytes not free in either structure.
    pub uordblks: usize,
    /// Bytes on the general free list.
    pub fordblks: usize,
    /// Bytes parked in buckets.
    pub fsmblks: usize,
}

/// Free neighbours of a chunk about to be inserted into the general list.
#[derive(Debug, Clone, Copy)]
struct Neighbours {
    /// Owner of the link that points at `before`.
    before_prev: Option<Chunk>,
    /// Last free chunk below the inserted one.
    before: Option<Chunk>,
    /// First free chunk above the inserted one.
    after: Option<Chunk>,
}

/// Allocator state for one arena.
pub struct MallocState<R> {
    region: R,
    arena: Arena,
    free_list: FreeList,
    buckets: Option<BucketCache>,
    config: HeapConfig,
    log: LifecycleLog,
}

impl<R> MallocState<R> {
    /// Creates an empty allocator over `region` with hosted defaults.
    pub const fn new(region: R) -> Self {
        Self::with_config(region, HeapConfig::hosted())
    }

    /// Creates an empty allocator over `region`.
    pub const fn with_config(region: R, config: HeapConfig) -> Self {
        let buckets = if config.buckets {
            Some(BucketCache::new())
        } else {
            None
        };
        Self {
            region,
            arena: Arena::new(),
            free_list: FreeList::new(),
            buckets,
            config,
            log: LifecycleLog::new(config.log_level, config.log_capacity),
        }
    }

    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Switches validation on or off.
    pub fn set_mode(&mut self, mode: HeapMode) {
        self.config = self.config.with_mode(mode);
    }

    /// Whether every locked operation is bracketed by a heap check.
    pub fn validates(&self) -> bool {
        self.config.validate
    }

    pub fn buckets_enabled(&self) -> bool {
        self.buckets.is_some()
    }

    pub fn arena_start(&self) -> Option<usize> {
        self.arena.start()
    }

    pub fn arena_top(&self) -> Option<usize> {
        self.arena.top()
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }

    /// Returns a view of allocator lifecycle log records, oldest first.
    pub fn lifecycle_logs(&self) -> impl Iterator<Item = &AllocatorLogRecord> {
        self.log.records()
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }
}

impl<R: BreakRegion> MallocState<R> {
    fn snapshot(&self) -> LogSnapshot {
        LogSnapshot {
            arena_bytes: self.arena.span(),
            free_chunks: self.free_list.iter(&self.region).count(),
            bucket_chunks: self.buckets.as_ref().map_or(0, BucketCache::total_cached),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        bucket: Option<usize>,
        outcome: &'static str,
        details: fmt::Arguments<'_>,
    ) {
        if !self.log.enabled(level) {
            return;
        }
        let snapshot = self.snapshot();
        self.log.push(
            LogEvent {
                level,
                symbol,
                event,
                ptr,
                size,
                bucket,
                outcome,
            },
            details,
            snapshot,
        );
    }

    /// Allocates `size` zeroed bytes.
    ///
    /// Returns the payload address, aligned to [`CHUNK_ALIGN`].
    pub fn malloc(&mut self, size: usize) -> Result<usize, MallocError> {
        if size > MAX_ALLOCATION_SIZE {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "malloc",
                "request_too_large",
                None,
                Some(size),
                None,
                "failed",
                format_args!("max={MAX_ALLOCATION_SIZE}"),
            );
            return Err(MallocError::RequestTooLarge {
                requested: size,
                max: MAX_ALLOCATION_SIZE,
            });
        }

        let mut alloc_size = chunk_size(size);
        let mut bucket = None;
        if self.buckets.is_some()
            && let Some(b) = bucket_index(alloc_size)
        {
            // Quantize so whatever the general path produces can go back
            // to this bucket when freed.
            alloc_size = bucket_size(b);
            bucket = Some(b);
            let hit = match self.buckets.as_mut() {
                Some(cache) => cache.pop(&self.region, b),
                None => None,
            };
            if let Some(chunk) = hit {
                return Ok(self.hand_out(chunk, size, bucket, "bucket"));
            }
        }

        match self.allocate_general(alloc_size, bucket.is_some()) {
            Ok((chunk, path)) => Ok(self.hand_out(chunk, size, bucket, path)),
            Err(err) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "out_of_memory",
                    None,
                    Some(size),
                    bucket,
                    "failed",
                    format_args!("alloc_size={alloc_size};cause={err}"),
                );
                Err(MallocError::OutOfMemory { requested: size })
            }
        }
    }

    fn hand_out(
        &mut self,
        chunk: Chunk,
        size: usize,
        bucket: Option<usize>,
        path: &'static str,
    ) -> usize {
        chunk.zero_payload(&mut self.region);
        let ptr = chunk.payload();
        let chunk_bytes = chunk.size(&self.region);
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "malloc",
            "alloc",
            Some(ptr),
            Some(size),
            bucket,
            "success",
            format_args!("path={path};chunk={chunk_bytes}"),
        );
        ptr
    }

    /// First-fit search of the general list, falling back to the arena.
    ///
    /// With `exact` set the chunk comes back exactly `alloc_size` bytes, so
    /// a bucket-class request can later return to its bucket. Free chunks
    /// that would leave an unsplittable remainder are passed over then.
    fn allocate_general(
        &mut self,
        alloc_size: usize,
        exact: bool,
    ) -> Result<(Chunk, &'static str), GrowError> {
        let mut prev = None;
        let mut cursor = self.free_list.first();
        while let Some(chunk) = cursor {
            let size = chunk.size(&self.region);
            if size >= alloc_size {
                let next = chunk.next(&self.region);
                let rem = size - alloc_size;
                if rem == 0 || (rem < MIN_CHUNK_SIZE && !exact) {
                    // Too small to stand alone; stays as padding.
                    self.free_list.link(&mut self.region, prev, next);
                    return Ok((chunk, "whole"));
                }
                if rem < MIN_CHUNK_SIZE {
                    prev = Some(chunk);
                    cursor = next;
                    continue;
                }

                chunk.set_size(&mut self.region, alloc_size);
                let remainder = Chunk::at(chunk.head() + alloc_size);
                remainder.set_size(&mut self.region, rem);
                match (self.buckets.as_mut(), exact_bucket(rem)) {
                    (Some(cache), Some(b)) => {
                        self.free_list.link(&mut self.region, prev, next);
                        cache.push(&mut self.region, b, remainder);
                    }
                    _ => {
                        remainder.set_next(&mut self.region, next);
                        self.free_list.link(&mut self.region, prev, Some(remainder));
                    }
                }
                return Ok((chunk, "split"));
            }

            if chunk.next(&self.region).is_none() && self.grow_chunk(chunk, alloc_size, exact) {
                self.free_list.link(&mut self.region, prev, None);
                return Ok((chunk, "tail_grow"));
            }

            prev = Some(chunk);
            // Re-read: a failed tail growth may have linked recovered memory here.
            cursor = chunk.next(&self.region);
        }

        let head = self.arena.grow(&mut self.region, alloc_size)?;
        let chunk = Chunk::at(head);
        chunk.set_size(&mut self.region, alloc_size);
        Ok((chunk, "arena"))
    }

    /// Grows `chunk` in place to at least `new_size` bytes, or exactly
    /// `new_size` with `exact` set.
    ///
    /// Only the chunk that ends exactly at the arena top can grow. If the
    /// break turns out to have moved under us, the memory we did get is
    /// recovered as a free chunk and the growth fails.
    fn grow_chunk(&mut self, chunk: Chunk, new_size: usize, exact: bool) -> bool {
        let end = chunk.end(&self.region);
        if self.arena.top() != Some(end) {
            return false;
        }
        let size = chunk.size(&self.region);
        let shortfall = new_size - size;
        // Every extension must be able to stand alone as a chunk if the
        // break turns out to have moved.
        if exact && shortfall < MIN_CHUNK_SIZE {
            return false;
        }
        let add = shortfall.max(MIN_CHUNK_SIZE);
        if size + add >= MAX_CHUNK_SIZE {
            return false;
        }

        match self.arena.grow(&mut self.region, add) {
            Ok(head) if head == end => {
                chunk.set_size(&mut self.region, size + add);
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "malloc",
                    "tail_grow",
                    Some(chunk.payload()),
                    Some(size + add),
                    None,
                    "success",
                    format_args!("added={add}"),
                );
                true
            }
            Ok(head) => {
                let stray = Chunk::at(head);
                stray.set_size(&mut self.region, add);
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "foreign_break_growth",
                    Some(stray.payload()),
                    Some(add),
                    None,
                    "recovered",
                    format_args!("expected={end:#x};got={head:#x}"),
                );
                if let Err(err) = self.release(stray) {
                    self.record_lifecycle(
                        AllocatorLogLevel::Error,
                        "malloc",
                        "recovery_failed",
                        Some(stray.payload()),
                        Some(add),
                        None,
                        "leaked",
                        format_args!("{err}"),
                    );
                }
                false
            }
            Err(err) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Debug,
                    "malloc",
                    "tail_grow",
                    Some(chunk.payload()),
                    Some(new_size),
                    None,
                    "failed",
                    format_args!("{err}"),
                );
                false
            }
        }
    }

    /// Resolves a payload address to a chunk of this arena.
    fn chunk_for(&self, ptr: usize) -> Option<Chunk> {
        if ptr % CHUNK_ALIGN != 0 {
            return None;
        }
        let chunk = Chunk::from_payload(ptr)?;
        if !self.arena.contains(chunk.head(), MIN_CHUNK_SIZE) {
            return None;
        }
        let size = chunk.size(&self.region);
        if size < MIN_CHUNK_SIZE
            || size % HEAD_ALIGN != 0
            || !self.arena.contains(chunk.head(), size)
        {
            return None;
        }
        Some(chunk)
    }

    /// Frees a previously allocated block.
    ///
    /// No-op if `ptr` is 0 (null equivalent). A pointer this heap never
    /// handed out, or one that is already free, is reported and leaves the
    /// heap untouched.
    pub fn free(&mut self, ptr: usize) -> Result<(), MallocError> {
        if ptr == 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "free",
                "free_null",
                Some(ptr),
                None,
                None,
                "noop",
                format_args!("null_pointer"),
            );
            return Ok(());
        }

        let Some(chunk) = self.chunk_for(ptr) else {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "free",
                "unknown_free_pointer",
                Some(ptr),
                None,
                None,
                "ignored",
                format_args!("pointer_outside_arena_or_misaligned"),
            );
            return Err(MallocError::ForeignPointer { ptr });
        };

        let size = chunk.size(&self.region);
        match self.release(chunk) {
            Ok((path, bucket)) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "free",
                    "free",
                    Some(ptr),
                    Some(size),
                    bucket,
                    "success",
                    format_args!("path={path}"),
                );
                Ok(())
            }
            Err(err) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "free",
                    "double_free_detected",
                    Some(ptr),
                    Some(size),
                    None,
                    "ignored",
                    format_args!("{err}"),
                );
                Err(err)
            }
        }
    }

    /// Allocates `size` zeroed bytes whose address is a multiple of `align`.
    ///
    /// Over-allocates by `align` plus a minimum chunk, then hands the
    /// unaligned front and any splittable tail back to the free structures.
    /// `align` 0 is treated like the minimum alignment.
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<usize, MallocError> {
        if align & align.wrapping_sub(1) != 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "memalign",
                "invalid_alignment",
                None,
                Some(size),
                None,
                "failed",
                format_args!("align={align}"),
            );
            return Err(MallocError::InvalidAlignment { align });
        }
        let align = align.max(MIN_CHUNK_SIZE);
        if MAX_ALLOCATION_SIZE
            .checked_sub(align)
            .is_none_or(|limit| size > limit)
        {
            return Err(MallocError::RequestTooLarge {
                requested: size,
                max: MAX_ALLOCATION_SIZE.saturating_sub(align),
            });
        }

        let payload = align_up(size.max(1), CHUNK_ALIGN);
        let ptr = self
            .malloc(payload + align + MIN_CHUNK_SIZE)
            .map_err(|err| match err {
                MallocError::RequestTooLarge { max, .. } => MallocError::RequestTooLarge {
                    requested: size,
                    max,
                },
                _ => MallocError::OutOfMemory { requested: size },
            })?;

        let mut chunk = Chunk::at(ptr - HEAD_SIZE);
        let mut aligned = align_up(ptr, align);
        let mut front = aligned - ptr;
        if front != 0 {
            if front < MIN_CHUNK_SIZE {
                aligned += align;
                front += align;
            }
            let total = chunk.size(&self.region);
            let moved = Chunk::at(aligned - HEAD_SIZE);
            moved.set_size(&mut self.region, total - front);
            chunk.set_size(&mut self.region, front);
            self.release_spare(chunk);
            chunk = moved;
        }

        let size_now = chunk.size(&self.region);
        let back = size_now - chunk_size(payload);
        if back >= MIN_CHUNK_SIZE {
            chunk.set_size(&mut self.region, size_now - back);
            let tail = Chunk::at(chunk.head() + size_now - back);
            tail.set_size(&mut self.region, back);
            self.release_spare(tail);
        }

        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "memalign",
            "alloc",
            Some(aligned),
            Some(size),
            None,
            "success",
            format_args!("align={align};front={front};back={back}"),
        );
        Ok(aligned)
    }

    /// Returns a piece trimmed off a live chunk to the free structures.
    fn release_spare(&mut self, piece: Chunk) {
        if let Err(err) = self.release(piece) {
            let size = piece.size(&self.region);
            self.record_lifecycle(
                AllocatorLogLevel::Error,
                "memalign",
                "trim_failed",
                Some(piece.payload()),
                Some(size),
                None,
                "leaked",
                format_args!("{err}"),
            );
        }
    }

    /// Finds where `chunk` would sit in the general list.
    ///
    /// Fails if it overlaps a chunk that is already free.
    fn locate(&self, chunk: Chunk, size: usize) -> Result<Neighbours, MallocError> {
        let mut neighbours = Neighbours {
            before_prev: None,
            before: None,
            after: self.free_list.first(),
        };
        while let Some(r) = neighbours.after {
            if r.head() > chunk.head() {
                break;
            }
            neighbours.before_prev = neighbours.before;
            neighbours.before = Some(r);
            neighbours.after = r.next(&self.region);
        }

        let double_free = MallocError::DoubleFree {
            ptr: chunk.payload(),
        };
        if let Some(before) = neighbours.before
            && before.end(&self.region) > chunk.head()
        {
            return Err(double_free);
        }
        if let Some(after) = neighbours.after
            && chunk.head() + size > after.head()
        {
            return Err(double_free);
        }
        Ok(neighbours)
    }

    /// Returns `chunk` to its bucket or to the general list.
    ///
    /// Reports the path taken and the bucket the chunk ended up in.
    fn release(&mut self, chunk: Chunk) -> Result<(&'static str, Option<usize>), MallocError> {
        let size = chunk.size(&self.region);

        if self.buckets.is_some()
            && let Some(b) = exact_bucket(size)
        {
            if self.config.validate {
                self.locate(chunk, size)?;
                if self
                    .buckets
                    .as_ref()
                    .is_some_and(|cache| cache.contains(&self.region, b, chunk))
                {
                    return Err(MallocError::DoubleFree {
                        ptr: chunk.payload(),
                    });
                }
            }
            if let Some(cache) = self.buckets.as_mut() {
                cache.push(&mut self.region, b, chunk);
            }
            return Ok(("bucket", Some(b)));
        }

        let Neighbours {
            before_prev,
            before,
            after,
        } = self.locate(chunk, size)?;

        let mut merged = chunk;
        let mut merged_size = size;
        let mut owner = before;
        if let Some(before) = before {
            let before_size = before.size(&self.region);
            if before.head() + before_size == chunk.head() && before_size + size < MAX_CHUNK_SIZE {
                merged = before;
                merged_size += before_size;
                owner = before_prev;
            }
        }

        let mut next = after;
        if let Some(after) = after {
            let after_size = after.size(&self.region);
            if merged.head() + merged_size == after.head() && merged_size + after_size < MAX_CHUNK_SIZE
            {
                merged_size += after_size;
                next = after.next(&self.region);
            }
        }

        merged.set_size(&mut self.region, merged_size);
        match (self.buckets.as_mut(), exact_bucket(merged_size)) {
            (Some(cache), Some(b)) => {
                self.free_list.link(&mut self.region, owner, next);
                cache.push(&mut self.region, b, merged);
                Ok(("coalesce_to_bucket", Some(b)))
            }
            _ => {
                merged.set_next(&mut self.region, next);
                self.free_list.link(&mut self.region, owner, Some(merged));
                let path = if merged_size == size { "insert" } else { "coalesce" };
                Ok((path, None))
            }
        }
    }

    /// Bytes the caller may use at `ptr`; 0 for null.
    pub fn usable_size(&self, ptr: usize) -> Result<usize, MallocError> {
        if ptr == 0 {
            return Ok(0);
        }
        self.chunk_for(ptr)
            .map(|chunk| chunk.usable(&self.region))
            .ok_or(MallocError::ForeignPointer { ptr })
    }

    /// Summarizes arena and free-structure usage.
    ///
    /// Checks the heap first when validation is enabled.
    pub fn mallinfo(&self) -> MallInfo {
        if self.config.validate {
            self.assert_consistent();
        }
        let (ordblks, fordblks) = self.free_list.totals(&self.region);
        let (smblks, fsmblks) = match &self.buckets {
            Some(cache) => (0..NUM_BUCKETS).fold((0, 0), |(count, bytes), b| {
                let len = cache.len(&self.region, b);
                (count + len, bytes + len * bucket_size(b))
            }),
            None => (0, 0),
        };
        let arena = self.arena.span();
        MallInfo {
            arena,
            ordblks,
            smblks,
            uordblks: arena.saturating_sub(fordblks + fsmblks),
            fordblks,
            fsmblks,
        }
    }

    /// Free chunks on the general list as `(header address, size)` pairs.
    pub fn free_chunks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_list
            .iter(&self.region)
            .map(|chunk| (chunk.head(), chunk.size(&self.region)))
    }

    /// Number of chunks parked in bucket `b`.
    pub fn bucket_len(&self, b: usize) -> usize {
        self.buckets
            .as_ref()
            .map_or(0, |cache| cache.len(&self.region, b))
    }

    /// Checks every free-structure invariant.
    pub fn check_heap(&self) -> Result<(), InvariantViolation> {
        validate::check_heap(
            &self.region,
            &self.arena,
            &self.free_list,
            self.buckets.as_ref(),
        )
    }

    /// Panics on the first broken invariant in debug builds.
    pub fn validate_heap(&self) {
        #[cfg(debug_assertions)]
        self.assert_consistent();
    }

    /// Panics on the first broken invariant.
    pub(crate) fn assert_consistent(&self) {
        if let Err(violation) = self.check_heap() {
            panic!("heap invariant violated: {violation}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::region::VecRegion;
    use crate::malloc::size_class::MAX_BUCKET_SIZE;

    fn state() -> MallocState<VecRegion> {
        MallocState::new(VecRegion::new(1 << 20)).with_validation()
    }

    fn general_only() -> MallocState<VecRegion> {
        MallocState::with_config(
            VecRegion::new(1 << 20),
            HeapConfig::hosted().with_buckets(false).with_validation(true),
        )
    }

    impl MallocState<VecRegion> {
        fn with_validation(mut self) -> Self {
            self.set_mode(HeapMode::Checked);
            self
        }
    }

    /// Request size whose chunk is exactly `size` bytes.
    fn request_for(size: usize) -> usize {
        size - HEAD_SIZE - (CHUNK_ALIGN - HEAD_ALIGN)
    }

    #[test]
    fn test_malloc_basic() {
        let mut state = state();
        let ptr = state.malloc(100).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(ptr % CHUNK_ALIGN, 0);
        assert!(state.usable_size(ptr).unwrap() >= 100);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_malloc_zero() {
        let mut state = state();
        let ptr = state.malloc(0).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(state.usable_size(ptr).unwrap(), MIN_CHUNK_SIZE - HEAD_SIZE);
    }

    #[test]
    fn test_malloc_too_large_leaves_arena_untouched() {
        let mut state = state();
        let err = state.malloc(MAX_ALLOCATION_SIZE + 1).unwrap_err();
        assert_eq!(
            err,
            MallocError::RequestTooLarge {
                requested: MAX_ALLOCATION_SIZE + 1,
                max: MAX_ALLOCATION_SIZE,
            }
        );
        assert_eq!(state.arena_top(), None);
        assert_eq!(state.region().extensions(), 0);
    }

    #[test]
    fn test_malloc_zero_fills_recycled_memory() {
        let mut state = general_only();
        let ptr = state.malloc(200).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.region_mut().bytes_mut(ptr, 200).fill(0xAB);
        state.free(ptr).unwrap();

        let again = state.malloc(200).unwrap();
        assert_eq!(again, ptr);
        assert!(state.region().bytes(again, 200).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_null() {
        let mut state = state();
        assert_eq!(state.free(0), Ok(()));
        assert_eq!(state.usable_size(0), Ok(0));
    }

    #[test]
    fn test_free_unknown() {
        let mut state = state();
        let ptr = state.malloc(32).unwrap();
        assert_eq!(
            state.free(0xDEAD_0000),
            Err(MallocError::ForeignPointer { ptr: 0xDEAD_0000 })
        );
        assert_eq!(
            state.free(ptr + 1),
            Err(MallocError::ForeignPointer { ptr: ptr + 1 })
        );
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_first_fit_reuses_freed_chunk() {
        let mut state = general_only();
        let p1 = state.malloc(16).unwrap();
        let p2 = state.malloc(16).unwrap();
        assert_ne!(p1, p2);
        state.free(p1).unwrap();
        assert_eq!(state.malloc(16).unwrap(), p1);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_whole_chunk_consumed_below_split_threshold() {
        let mut state = general_only();
        let free_size = 256;
        let a = state.malloc(request_for(free_size)).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();

        // Leftover would be one alignment step short of a minimum chunk.
        let alloc_size = free_size - MIN_CHUNK_SIZE + HEAD_ALIGN;
        let b = state.malloc(request_for(alloc_size)).unwrap();
        assert_eq!(b, a);
        assert_eq!(state.usable_size(b).unwrap(), free_size - HEAD_SIZE);
        assert_eq!(state.free_chunks().count(), 0);
    }

    #[test]
    fn test_chunk_split_at_threshold() {
        let mut state = general_only();
        let free_size = 256;
        let a = state.malloc(request_for(free_size)).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();

        let alloc_size = free_size - MIN_CHUNK_SIZE;
        let b = state.malloc(request_for(alloc_size)).unwrap();
        assert_eq!(b, a);
        assert_eq!(state.usable_size(b).unwrap(), alloc_size - HEAD_SIZE);
        let free: Vec<_> = state.free_chunks().collect();
        assert_eq!(free, vec![(b - HEAD_SIZE + alloc_size, MIN_CHUNK_SIZE)]);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let mut state = general_only();
        let a = state.malloc(100).unwrap();
        let b = state.malloc(100).unwrap();
        let c = state.malloc(100).unwrap();
        let _guard = state.malloc(8).unwrap();
        let each = state.usable_size(a).unwrap() + HEAD_SIZE;

        state.free(a).unwrap();
        state.free(c).unwrap();
        assert_eq!(state.free_chunks().count(), 2);

        state.free(b).unwrap();
        let free: Vec<_> = state.free_chunks().collect();
        assert_eq!(free, vec![(a - HEAD_SIZE, 3 * each)]);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_double_free_detected_without_mutation() {
        let mut state = general_only();
        let a = state.malloc(100).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();
        let before: Vec<_> = state.free_chunks().collect();

        assert_eq!(state.free(a), Err(MallocError::DoubleFree { ptr: a }));
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), before);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_double_free_inside_coalesced_chunk_detected() {
        let mut state = general_only();
        let a = state.malloc(100).unwrap();
        let b = state.malloc(100).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();
        state.free(b).unwrap();
        // `b` now lives inside the merged chunk headed by `a`.
        assert_eq!(state.free(b), Err(MallocError::DoubleFree { ptr: b }));
    }

    #[test]
    fn test_bucket_round_trip() {
        let mut state = state();
        let ptr = state.malloc(8).unwrap();
        let chunk = state.usable_size(ptr).unwrap() + HEAD_SIZE;
        let b = bucket_index(chunk).unwrap();
        assert_eq!(chunk, bucket_size(b));

        state.free(ptr).unwrap();
        assert_eq!(state.bucket_len(b), 1);
        assert_eq!(state.free_chunks().count(), 0);

        assert_eq!(state.malloc(8).unwrap(), ptr);
        assert_eq!(state.bucket_len(b), 0);
    }

    #[test]
    fn test_bucket_double_free_detected_when_validating() {
        let mut state = state();
        let ptr = state.malloc(8).unwrap();
        state.free(ptr).unwrap();
        assert_eq!(state.free(ptr), Err(MallocError::DoubleFree { ptr }));
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_split_remainder_of_bucket_size_goes_to_bucket() {
        let mut state = state();
        let big = MAX_BUCKET_SIZE * 2;
        let a = state.malloc(request_for(big)).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();

        let take = big - bucket_size(0);
        state.malloc(request_for(take)).unwrap();
        assert_eq!(state.free_chunks().count(), 0);
        assert_eq!(state.bucket_len(0), 1);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_coalesced_bucket_size_moves_to_bucket() {
        // Small chunks off their class size only arise without buckets, so
        // build the layout first and switch the cache on before the merge.
        let mut state = general_only();
        let a = state.malloc(request_for(1024)).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();

        // Leave a 24-byte remainder, then let a small request consume it whole.
        let x = state.malloc(request_for(1000)).unwrap();
        let odd = state.malloc(8).unwrap();
        assert_eq!(odd, a + 1000);
        assert_eq!(state.usable_size(odd).unwrap(), 24 - HEAD_SIZE);

        // Free `x` and re-split it so a 40-byte chunk sits right below `odd`.
        state.free(x).unwrap();
        state.malloc(request_for(960)).unwrap();
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(a - HEAD_SIZE + 960, 40)]);

        // 40 + 24 lands exactly on a bucket class.
        state.buckets = Some(BucketCache::new());
        state.free(odd).unwrap();
        assert_eq!(state.free_chunks().count(), 0);
        assert_eq!(state.bucket_len(2), 1);
        assert_eq!(bucket_size(2), 64);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_small_request_skips_chunk_it_cannot_split() {
        let mut state = state();
        let a = state.malloc(request_for(1096)).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();
        state.malloc(request_for(1024)).unwrap();
        let leftover = a - HEAD_SIZE + 1024;
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(leftover, 72)]);

        // Class 64 would leave 8 bytes of the 72-byte chunk.
        let class = bucket_index(chunk_size(50)).unwrap();
        let ptr = state.malloc(50).unwrap();
        assert_ne!(ptr, leftover + HEAD_SIZE);
        assert_eq!(state.usable_size(ptr).unwrap() + HEAD_SIZE, bucket_size(class));

        state.free(ptr).unwrap();
        assert_eq!(state.bucket_len(class), 1);
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(leftover, 72)]);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_small_request_does_not_overgrow_tail() {
        let mut state = state();
        let a = state.malloc(request_for(1080)).unwrap();
        state.free(a).unwrap();
        state.malloc(request_for(1024)).unwrap();
        let tail = a - HEAD_SIZE + 1024;
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(tail, 56)]);

        // Growing the 56-byte tail by a minimum chunk would give 72, not 64.
        let class = bucket_index(chunk_size(50)).unwrap();
        let ptr = state.malloc(50).unwrap();
        assert_eq!(state.usable_size(ptr).unwrap() + HEAD_SIZE, bucket_size(class));

        state.free(ptr).unwrap();
        assert_eq!(state.bucket_len(class), 1);
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(tail, 56)]);
        assert_eq!(state.check_heap(), Ok(()));
    }

    #[test]
    fn test_small_request_grows_tail_to_exact_class() {
        let mut state = state();
        let a = state.malloc(request_for(1064)).unwrap();
        state.free(a).unwrap();
        state.malloc(request_for(1024)).unwrap();
        let tail = a - HEAD_SIZE + 1024;
        assert_eq!(state.free_chunks().collect::<Vec<_>>(), vec![(tail, 40)]);

        let class = bucket_index(chunk_size(50)).unwrap();
        let ptr = state.malloc(50).unwrap();
        assert_eq!(ptr, tail + HEAD_SIZE);
        assert_eq!(state.usable_size(ptr).unwrap() + HEAD_SIZE, bucket_size(class));
        assert_eq!(state.arena_top(), Some(tail + bucket_size(class)));

        state.free(ptr).unwrap();
        assert_eq!(state.bucket_len(class), 1);
        assert_eq!(state.free_chunks().count(), 0);
    }

    #[test]
    fn test_memalign_rejects_non_power_of_two() {
        let mut state = state();
        assert_eq!(
            state.memalign(24, 100),
            Err(MallocError::InvalidAlignment { align: 24 })
        );
        assert_eq!(state.arena_top(), None);
    }

    #[test]
    fn test_memalign_rejects_oversized_request() {
        let mut state = state();
        assert!(matches!(
            state.memalign(4096, MAX_ALLOCATION_SIZE),
            Err(MallocError::RequestTooLarge { requested, .. }) if requested == MAX_ALLOCATION_SIZE
        ));
        assert!(matches!(
            state.memalign(1 << (usize::BITS - 1), 1),
            Err(MallocError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_memalign_aligns_and_returns_spare() {
        for mut state in [state(), general_only()] {
            let mut live = Vec::new();
            for align in [0, 8, 16, 64, 256, 4096] {
                for size in [0, 1, 100, 3000] {
                    let ptr = state.memalign(align, size).unwrap();
                    assert_eq!(ptr % align.max(CHUNK_ALIGN), 0, "align={align} size={size}");
                    assert!(state.usable_size(ptr).unwrap() >= size);
                    assert!(state.region().bytes(ptr, size).iter().all(|&b| b == 0));
                    state.region_mut().bytes_mut(ptr, size).fill(0x77);
                    assert_eq!(state.check_heap(), Ok(()));
                    live.push((ptr, size));
                }
            }
            for (ptr, size) in live {
                assert!(state.region().bytes(ptr, size).iter().all(|&b| b == 0x77));
                state.free(ptr).unwrap();
                assert_eq!(state.check_heap(), Ok(()));
            }
            let info = state.mallinfo();
            assert_eq!(info.uordblks, 0);
        }
    }

    #[test]
    fn test_memalign_trims_front_and_back() {
        let mut state = general_only();
        let ptr = state.memalign(4096, 64).unwrap();
        assert_eq!(ptr % 4096, 0);
        assert_eq!(state.usable_size(ptr).unwrap() + HEAD_SIZE, chunk_size(64));

        // Unaligned front and spare tail are both back on the free list.
        let free: Vec<_> = state.free_chunks().collect();
        assert_eq!(free.len(), 2);
        assert!(free[0].0 + free[0].1 <= ptr - HEAD_SIZE);
        assert_eq!(free[1].0, ptr - HEAD_SIZE + chunk_size(64));

        state.free(ptr).unwrap();
        assert_eq!(state.free_chunks().count(), 1);
    }

    #[test]
    fn test_tail_chunk_grows_in_place() {
        let mut state = general_only();
        let a = state.malloc(64).unwrap();
        state.free(a).unwrap();
        let extensions = state.region().extensions();

        let b = state.malloc(4096).unwrap();
        assert_eq!(b, a);
        assert_eq!(state.region().extensions(), extensions + 1);
        assert_eq!(state.arena_top(), Some(state.region().brk()));
        assert_eq!(state.free_chunks().count(), 0);
    }

    #[test]
    fn test_foreign_growth_recovered_as_free_chunk() {
        let mut state = general_only();
        let a = state.malloc(64).unwrap();
        state.free(a).unwrap();
        state.region_mut().inject_foreign_growth(64);

        // The stray extension becomes the new tail and is grown to fit.
        let b = state.malloc(200).unwrap();
        assert_eq!(b, a + chunk_size(64) + 64);
        assert_eq!(state.usable_size(b).unwrap(), chunk_size(200) - HEAD_SIZE);
        assert_eq!(
            state.free_chunks().collect::<Vec<_>>(),
            vec![(a - HEAD_SIZE, chunk_size(64))]
        );
        assert_eq!(state.check_heap(), Ok(()));

        let logs = state.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "foreign_break_growth"
        }));
    }

    #[test]
    fn test_out_of_memory_reported() {
        let mut state = general_only();
        let a = state.malloc(32).unwrap();
        state.region_mut().set_exhausted(true);
        assert_eq!(
            state.malloc(64),
            Err(MallocError::OutOfMemory { requested: 64 })
        );
        assert_eq!(state.usable_size(a).unwrap(), chunk_size(32) - HEAD_SIZE);
    }

    #[test]
    fn test_mallinfo_accounts_every_byte() {
        let mut state = state();
        let small = state.malloc(8).unwrap();
        let large = state.malloc(1000).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(small).unwrap();
        state.free(large).unwrap();

        let info = state.mallinfo();
        assert_eq!(info.arena, state.arena_top().unwrap() - state.arena_start().unwrap());
        assert_eq!(info.ordblks, 1);
        assert_eq!(info.smblks, 1);
        assert_eq!(info.fsmblks, bucket_size(0));
        assert_eq!(info.fordblks, chunk_size(1000));
        assert_eq!(info.uordblks + info.fordblks + info.fsmblks, info.arena);
    }

    #[test]
    fn test_lifecycle_logs_include_trace_and_decision_ids() {
        let mut state = state();
        let ptr = state.malloc(64).unwrap();
        state.free(ptr).unwrap();

        let logs = state.drain_lifecycle_logs();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::malloc::"))
        );
        assert!(
            logs.iter()
                .any(|entry| entry.level == AllocatorLogLevel::Trace && entry.symbol == "malloc")
        );
        assert!(
            logs.iter()
                .any(|entry| entry.symbol == "free" && entry.outcome == "success")
        );
        assert_eq!(state.lifecycle_logs().count(), 0);
    }

    #[test]
    fn test_lifecycle_logs_warn_on_double_free_and_unknown_pointer() {
        let mut state = general_only();
        let ptr = state.malloc(100).unwrap();
        state.free(ptr).unwrap();
        let _ = state.free(ptr);
        let _ = state.free(0xBEEF);

        let logs = state.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "double_free_detected"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "unknown_free_pointer"
        }));
    }

    #[test]
    fn test_embedded_config_keeps_no_logs() {
        let mut state =
            MallocState::with_config(VecRegion::new(1 << 16), HeapConfig::embedded());
        let ptr = state.malloc(64).unwrap();
        state.free(ptr).unwrap();
        assert_eq!(state.lifecycle_logs().count(), 0);
    }

    #[test]
    #[should_panic(expected = "heap invariant violated")]
    fn test_assert_consistent_panics_on_corruption() {
        let mut state = general_only();
        let a = state.malloc(100).unwrap();
        let _guard = state.malloc(8).unwrap();
        state.free(a).unwrap();
        // Smash the free chunk's size word.
        state.region_mut().write_word(a - HEAD_SIZE, 3);
        state.assert_consistent();
    }
}
