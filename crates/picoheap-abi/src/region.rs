//! Break regions backed by real memory.
//!
//! - [`StaticBreak`] hands out a fixed array linked into the image, the
//!   way an embedded linker script reserves `__heap_start .. __heap_end`.
//! - [`SystemBreak`] moves the process break with `sbrk(2)`.
//!
//! Word access dereferences the address it is given. The core allocator
//! only passes addresses inside memory these regions have handed out.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use picoheap_core::malloc::BreakRegion;

/// Backing store for a [`StaticBreak`].
///
/// Zero-initialized, so it lands in `.bss` and costs no image space.
#[repr(C, align(16))]
pub struct HeapMemory<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
    claimed: AtomicBool,
}

// SAFETY: the bytes are only reached through the single `StaticBreak` that
// wins `claim`, and that region is itself only used under the heap lock.
unsafe impl<const N: usize> Sync for HeapMemory<N> {}

impl<const N: usize> HeapMemory<N> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
            claimed: AtomicBool::new(false),
        }
    }

    /// Marks the memory as owned. Only the first caller wins.
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn base(&self) -> usize {
        self.bytes.get() as usize
    }
}

impl<const N: usize> Default for HeapMemory<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Break region over a `'static` [`HeapMemory`].
///
/// The memory is claimed on the first extension; a second region built
/// over the same memory never grows.
pub struct StaticBreak<const N: usize> {
    memory: &'static HeapMemory<N>,
    used: usize,
    owner: bool,
}

impl<const N: usize> StaticBreak<N> {
    pub const fn new(memory: &'static HeapMemory<N>) -> Self {
        Self {
            memory,
            used: 0,
            owner: false,
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total bytes this region can ever hand out.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> BreakRegion for StaticBreak<N> {
    fn extend(&mut self, delta: isize) -> Option<usize> {
        let delta = usize::try_from(delta).ok()?;
        if !self.owner {
            if !self.memory.claim() {
                return None;
            }
            self.owner = true;
        }
        let next = self.used.checked_add(delta)?;
        if next > N {
            return None;
        }
        let previous = self.memory.base() + self.used;
        self.used = next;
        Some(previous)
    }

    fn read_word(&self, addr: usize) -> usize {
        debug_assert!(self.in_bounds(addr, mem::size_of::<usize>()));
        // SAFETY: `addr` lies in the claimed array, below the break.
        unsafe { (addr as *const usize).read_unaligned() }
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        debug_assert!(self.in_bounds(addr, mem::size_of::<usize>()));
        // SAFETY: as for `read_word`; the heap lock gives us exclusive access.
        unsafe { (addr as *mut usize).write_unaligned(value) }
    }

    fn zero(&mut self, addr: usize, len: usize) {
        debug_assert!(self.in_bounds(addr, len));
        // SAFETY: as for `write_word`.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) }
    }
}

impl<const N: usize> StaticBreak<N> {
    fn in_bounds(&self, addr: usize, len: usize) -> bool {
        let base = self.memory.base();
        addr >= base && addr.saturating_add(len) <= base + self.used
    }
}

/// Break region over the process break.
///
/// Assumes nothing else in the process moves the break; if something does,
/// the allocator notices the gap and recovers what it was given.
#[cfg(all(unix, feature = "system-break"))]
#[derive(Debug, Default)]
pub struct SystemBreak {
    _private: (),
}

#[cfg(all(unix, feature = "system-break"))]
impl SystemBreak {
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(unix, feature = "system-break"))]
impl BreakRegion for SystemBreak {
    fn extend(&mut self, delta: isize) -> Option<usize> {
        // SAFETY: sbrk has no memory-safety preconditions; failure is (void *)-1.
        let previous = unsafe { libc::sbrk(delta as libc::intptr_t) };
        if previous as isize == -1 {
            None
        } else {
            Some(previous as usize)
        }
    }

    fn read_word(&self, addr: usize) -> usize {
        // SAFETY: `addr` lies below the break in memory this region handed out.
        unsafe { (addr as *const usize).read_unaligned() }
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        // SAFETY: as for `read_word`; the heap lock gives us exclusive access.
        unsafe { (addr as *mut usize).write_unaligned(value) }
    }

    fn zero(&mut self, addr: usize, len: usize) {
        // SAFETY: as for `write_word`.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) }
    }
}
