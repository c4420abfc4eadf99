//! Break-arena memory allocator.
//!
//! A first-fit allocator for targets whose only source of memory is a
//! program break that moves upward. Memory is carved into chunks:
//! - Small chunks are recycled through power-of-two buckets.
//! - Everything else lives on one address-ordered free list that is
//!   searched first fit, split, coalesced on free, and whose topmost chunk
//!   can grow in place when the break is extended.
//!
//! The allocator never dereferences raw pointers. All arena memory is
//! reached through a [`BreakRegion`], so this module stays safe Rust; the
//! ABI crate supplies regions backed by real memory.

pub mod allocator;
pub mod arena;
pub mod bucket;
pub mod chunk;
pub mod free_list;
pub mod heap;
pub mod log;
pub mod region;
pub mod size_class;
pub mod validate;

pub use allocator::{MallInfo, MallocError, MallocState};
pub use arena::{Arena, GrowError};
pub use chunk::{CHUNK_ALIGN, MAX_ALLOCATION_SIZE, MIN_CHUNK_SIZE, chunk_size};
pub use heap::Heap;
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use region::{BreakRegion, VecRegion};
pub use validate::InvariantViolation;
