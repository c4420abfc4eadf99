//! # picoheap-abi
//!
//! C ABI surface for the picoheap allocator.
//!
//! The crate owns one process-wide heap over either an in-image static
//! array (the default, matching a linker-reserved embedded heap) or the
//! process break (`system-break` feature). With the `interpose` feature the
//! entry points are exported under their C names and can replace the libc
//! allocator when built as a `cdylib`.

pub mod malloc_abi;
pub mod region;
