//! Thread-safe heap.
//!
//! [`Heap`] serializes every operation on one [`MallocState`] behind a
//! single `parking_lot` mutex. The guard releases the lock on every exit
//! path, including failures and panics. In checked mode the whole free
//! structure is validated right after the lock is taken and again just
//! before it is released.

use parking_lot::Mutex;

use super::allocator::{MallInfo, MallocError, MallocState};
use super::log::AllocatorLogRecord;
use super::region::BreakRegion;
use super::validate::InvariantViolation;
use crate::config::{HeapConfig, HeapMode};

/// A [`MallocState`] shared between threads.
pub struct Heap<R> {
    state: Mutex<MallocState<R>>,
}

impl<R> Heap<R> {
    /// Creates a heap over `region` with hosted defaults.
    pub const fn new(region: R) -> Self {
        Self::with_config(region, HeapConfig::hosted())
    }

    /// Creates a heap over `region`.
    ///
    /// `const` so a heap can live in a `static` without lazy initialization.
    pub const fn with_config(region: R, config: HeapConfig) -> Self {
        Self {
            state: Mutex::new(MallocState::with_config(region, config)),
        }
    }
}

impl<R: BreakRegion> Heap<R> {
    /// Runs `f` with exclusive access to the allocator state.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut MallocState<R>) -> T) -> T {
        let mut state = self.state.lock();
        if state.validates() {
            state.assert_consistent();
        }
        let out = f(&mut state);
        if state.validates() {
            state.assert_consistent();
        }
        out
    }

    /// See [`MallocState::malloc`].
    pub fn malloc(&self, size: usize) -> Result<usize, MallocError> {
        self.with_state(|state| state.malloc(size))
    }

    /// See [`MallocState::free`].
    pub fn free(&self, ptr: usize) -> Result<(), MallocError> {
        self.with_state(|state| state.free(ptr))
    }

    /// See [`MallocState::memalign`].
    pub fn memalign(&self, align: usize, size: usize) -> Result<usize, MallocError> {
        self.with_state(|state| state.memalign(align, size))
    }

    pub fn usable_size(&self, ptr: usize) -> Result<usize, MallocError> {
        self.with_state(|state| state.usable_size(ptr))
    }

    pub fn mallinfo(&self) -> MallInfo {
        self.with_state(|state| state.mallinfo())
    }

    /// Checks every heap invariant, regardless of mode.
    pub fn check_heap(&self) -> Result<(), InvariantViolation> {
        self.state.lock().check_heap()
    }

    /// Panics on the first broken invariant in debug builds.
    pub fn validate_heap(&self) {
        self.state.lock().validate_heap();
    }

    pub fn set_mode(&self, mode: HeapMode) {
        self.state.lock().set_mode(mode);
    }

    pub fn mode(&self) -> HeapMode {
        if self.state.lock().validates() {
            HeapMode::Checked
        } else {
            HeapMode::Fast
        }
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.state.lock().drain_lifecycle_logs()
    }
}
