//! # picoheap-core
//!
//! Safe Rust core of a break-arena `malloc` for embedded targets.
//!
//! This crate owns the allocator itself: chunk layout, arena growth, the
//! small-chunk buckets, the first-fit free list, coalescing, heap
//! validation and the locked [`malloc::Heap`] wrapper. No `unsafe` code is
//! permitted at the crate level; memory is addressed through the
//! [`malloc::BreakRegion`] trait.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod malloc;
