//! Error number definitions.
//!
//! Thread-local errno storage for the allocator entry points. Only the
//! codes the allocator reports are defined here.

use std::cell::Cell;

use crate::malloc::MallocError;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Invalid argument.
pub const EINVAL: i32 = 22;

/// Returns the current thread-local errno value.
///
/// Equivalent to reading C `errno`.
pub fn get_errno() -> i32 {
    ERRNO.get()
}

/// Sets the current thread-local errno value.
///
/// Equivalent to assigning to C `errno`.
pub fn set_errno(value: i32) {
    ERRNO.set(value);
}

/// errno an allocator failure is reported with.
pub fn errno_for(err: &MallocError) -> i32 {
    match err {
        MallocError::RequestTooLarge { .. }
        | MallocError::OutOfMemory { .. }
        | MallocError::DoubleFree { .. } => ENOMEM,
        MallocError::ForeignPointer { .. } | MallocError::InvalidAlignment { .. } => EINVAL,
    }
}
