//! Chunk layout and size arithmetic.
//!
//! ```text
//!            +--------------------------------------+
//!   head --> | size (whole chunk, header included)  |
//!            +--------------------------------------+
//! payload -> | in use: caller data                  |
//!            | free:   address of next free chunk   |
//!            | ...                                  |
//!            +--------------------------------------+
//! ```
//!
//! The payload is aligned to [`CHUNK_ALIGN`]; the header in front of it
//! only to [`HEAD_ALIGN`]. Chunk sizes are chosen so a chunk that starts
//! right where the previous one ends keeps its payload aligned.

use std::mem;

use super::region::{BreakRegion, WORD};

/// Bytes of header in front of every payload.
pub const HEAD_SIZE: usize = WORD;

/// Alignment of the header word.
pub const HEAD_ALIGN: usize = mem::align_of::<usize>();

/// Alignment of every payload handed to callers.
pub const CHUNK_ALIGN: usize = max(
    max(mem::align_of::<*const u8>(), mem::align_of::<usize>()),
    max(mem::align_of::<u64>(), mem::align_of::<f64>()),
);

/// Smallest chunk: a header plus room for the free-list link.
pub const MIN_CHUNK_SIZE: usize = align_up(HEAD_SIZE + WORD, HEAD_ALIGN);

/// Exclusive upper bound on any chunk size.
pub const MAX_CHUNK_SIZE: usize = 0x8000_0000;

/// Largest request `malloc` accepts.
pub const MAX_ALLOCATION_SIZE: usize = MAX_CHUNK_SIZE - (HEAD_SIZE + 2 * CHUNK_ALIGN);

const fn max(a: usize, b: usize) -> usize {
    if a >= b { a } else { b }
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Total chunk size needed to serve a request of `request` bytes.
///
/// Callers must have rejected requests above [`MAX_ALLOCATION_SIZE`].
#[inline]
pub const fn chunk_size(request: usize) -> usize {
    let size = align_up(request, CHUNK_ALIGN) + HEAD_SIZE + (CHUNK_ALIGN - HEAD_ALIGN);
    max(MIN_CHUNK_SIZE, size)
}

/// Handle to a chunk, identified by the address of its header.
///
/// A `Chunk` is only an address; its size and link live in region memory
/// and are read through the accessors below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk(usize);

impl Chunk {
    /// Chunk whose header starts at `head`.
    #[inline]
    pub const fn at(head: usize) -> Self {
        Self(head)
    }

    /// Chunk owning the payload at `ptr`, if `ptr` can be a payload at all.
    #[inline]
    pub fn from_payload(ptr: usize) -> Option<Self> {
        match ptr.checked_sub(HEAD_SIZE) {
            Some(head) if head != 0 => Some(Self(head)),
            _ => None,
        }
    }

    /// Address of the header.
    #[inline]
    pub const fn head(self) -> usize {
        self.0
    }

    /// Address handed to the caller.
    #[inline]
    pub const fn payload(self) -> usize {
        self.0 + HEAD_SIZE
    }

    #[inline]
    pub fn size<R: BreakRegion>(self, region: &R) -> usize {
        region.read_word(self.0)
    }

    #[inline]
    pub fn set_size<R: BreakRegion>(self, region: &mut R, size: usize) {
        region.write_word(self.0, size);
    }

    /// First byte past the chunk.
    #[inline]
    pub fn end<R: BreakRegion>(self, region: &R) -> usize {
        self.0 + self.size(region)
    }

    /// Bytes the caller may use.
    #[inline]
    pub fn usable<R: BreakRegion>(self, region: &R) -> usize {
        self.size(region) - HEAD_SIZE
    }

    /// Successor on whichever free list holds this chunk.
    #[inline]
    pub fn next<R: BreakRegion>(self, region: &R) -> Option<Chunk> {
        match region.read_word(self.payload()) {
            0 => None,
            head => Some(Self(head)),
        }
    }

    #[inline]
    pub fn set_next<R: BreakRegion>(self, region: &mut R, next: Option<Chunk>) {
        region.write_word(self.payload(), next.map_or(0, Chunk::head));
    }

    /// Clears the payload.
    pub fn zero_payload<R: BreakRegion>(self, region: &mut R) {
        let usable = self.usable(region);
        region.zero(self.payload(), usable);
    }
}
