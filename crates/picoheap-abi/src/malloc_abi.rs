//! ABI layer for the allocator entry points (`malloc`, `free`, `cfree`,
//! the aligned family, `malloc_usable_size`, `mallinfo`, `malloc_stats`,
//! `getpagesize`).
//!
//! Every call goes through one process-wide [`Heap`]. Without the
//! `interpose` feature the functions keep their Rust-mangled names, so a
//! test binary can call them without replacing its own allocator.

use std::ffi::{c_int, c_void};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use picoheap_core::config::{HeapConfig, heap_mode};
use picoheap_core::errno::{EINVAL, ENOMEM, errno_for, set_errno};
use picoheap_core::malloc::chunk::align_up;
use picoheap_core::malloc::{Heap, MAX_ALLOCATION_SIZE, MallInfo as CoreMallInfo, MallocError};

#[cfg(not(all(unix, feature = "system-break")))]
use crate::region::{HeapMemory, StaticBreak};
#[cfg(all(unix, feature = "system-break"))]
use crate::region::SystemBreak;

/// Size of the in-image heap used when the process break is not.
pub const STATIC_HEAP_SIZE: usize = 8 << 20;

/// Nominal page size: `getpagesize` and the `valloc` alignment.
pub const PAGE_SIZE: usize = 0x1000;

// The log ring would allocate from the heap it instruments.
const GLOBAL_CONFIG: HeapConfig = HeapConfig::embedded().with_buckets(cfg!(feature = "buckets"));

#[cfg(not(all(unix, feature = "system-break")))]
type GlobalRegion = StaticBreak<STATIC_HEAP_SIZE>;
#[cfg(all(unix, feature = "system-break"))]
type GlobalRegion = SystemBreak;

#[cfg(not(all(unix, feature = "system-break")))]
static HEAP_MEMORY: HeapMemory<STATIC_HEAP_SIZE> = HeapMemory::new();

#[cfg(not(all(unix, feature = "system-break")))]
static HEAP: Heap<GlobalRegion> = Heap::with_config(StaticBreak::new(&HEAP_MEMORY), GLOBAL_CONFIG);
#[cfg(all(unix, feature = "system-break"))]
static HEAP: Heap<GlobalRegion> = Heap::with_config(SystemBreak::new(), GLOBAL_CONFIG);

static MODE_APPLIED: AtomicBool = AtomicBool::new(false);

/// Global heap instance.
///
/// The first caller applies `PICOHEAP_MODE`. Resolving it reads the
/// environment, which may allocate and land back here; that nested call
/// sees the flag already set and runs in the build's default mode.
fn global_heap() -> &'static Heap<GlobalRegion> {
    if !MODE_APPLIED.swap(true, Ordering::AcqRel) {
        let mode = heap_mode();
        HEAP.set_mode(mode);
    }
    &HEAP
}

fn set_abi_errno(val: c_int) {
    set_errno(val);
    #[cfg(all(feature = "interpose", target_os = "linux"))]
    // SAFETY: __errno_location returns a valid TLS pointer for this thread.
    unsafe {
        *libc::__errno_location() = val;
    }
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// C `malloc` -- allocates `size` zeroed bytes.
///
/// Returns null with `errno = ENOMEM` if the request is too large or the
/// heap cannot grow. `malloc(0)` returns a unique minimum-size block.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match global_heap().malloc(size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            set_abi_errno(errno_for(&err));
            std::ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// C `free` -- returns a block to the heap.
///
/// Null is a no-op. A detected double free leaves the heap untouched and
/// sets `errno = ENOMEM`; a pointer this heap never handed out is ignored.
///
/// # Safety
///
/// `ptr` must be null or have been returned by `malloc`.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if let Err(err @ MallocError::DoubleFree { .. }) = global_heap().free(ptr as usize) {
        set_abi_errno(errno_for(&err));
    }
}

/// Historical alias of `free`.
///
/// # Safety
///
/// Same contract as [`free`].
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    // SAFETY: forwarded contract.
    unsafe { free(ptr) }
}

// ---------------------------------------------------------------------------
// aligned allocation
// ---------------------------------------------------------------------------

fn aligned_or_null(align: usize, size: usize) -> *mut c_void {
    match global_heap().memalign(align, size) {
        Ok(ptr) => ptr as *mut c_void,
        Err(err) => {
            set_abi_errno(errno_for(&err));
            std::ptr::null_mut()
        }
    }
}

/// C `memalign` -- allocates `size` zeroed bytes aligned to `align`.
///
/// Returns null with `errno = EINVAL` if `align` is not a power of two, or
/// `errno = ENOMEM` if the heap cannot serve the request.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_or_null(align, size)
}

/// C11 `aligned_alloc`, same as `memalign`.
///
/// # Safety
///
/// Same contract as [`memalign`].
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    aligned_or_null(align, size)
}

/// POSIX `posix_memalign` -- stores an aligned block in `*memptr`.
///
/// Returns 0 on success, `EINVAL` if `align` is not a power of two
/// multiple of the pointer size, `ENOMEM` otherwise. `errno` and `*memptr`
/// are left alone on failure.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    if !align.is_power_of_two() || !align.is_multiple_of(std::mem::size_of::<*mut c_void>()) {
        return EINVAL;
    }
    match global_heap().memalign(align, size) {
        Ok(ptr) => {
            // SAFETY: caller guarantees `memptr` is writable.
            unsafe { *memptr = ptr as *mut c_void };
            0
        }
        Err(_) => ENOMEM,
    }
}

/// C `valloc` -- page-aligned allocation.
///
/// # Safety
///
/// Same contract as [`memalign`].
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    aligned_or_null(PAGE_SIZE, size)
}

/// C `pvalloc` -- page-aligned allocation rounded up to whole pages.
///
/// # Safety
///
/// Same contract as [`memalign`].
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    if size > MAX_ALLOCATION_SIZE - PAGE_SIZE {
        set_abi_errno(ENOMEM);
        return std::ptr::null_mut();
    }
    aligned_or_null(PAGE_SIZE, align_up(size, PAGE_SIZE))
}

// ---------------------------------------------------------------------------
// introspection
// ---------------------------------------------------------------------------

/// Bytes usable at `ptr`, or 0 for null and foreign pointers.
///
/// # Safety
///
/// `ptr` must be null or a live block returned by `malloc`.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    global_heap().usable_size(ptr as usize).unwrap_or(0)
}

/// C `struct mallinfo`, glibc layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallInfo {
    pub arena: c_int,
    pub ordblks: c_int,
    pub smblks: c_int,
    pub hblks: c_int,
    pub hblkhd: c_int,
    pub usmblks: c_int,
    pub fsmblks: c_int,
    pub uordblks: c_int,
    pub fordblks: c_int,
    pub keepcost: c_int,
}

fn clamp(value: usize) -> c_int {
    c_int::try_from(value).unwrap_or(c_int::MAX)
}

impl From<CoreMallInfo> for MallInfo {
    fn from(info: CoreMallInfo) -> Self {
        Self {
            arena: clamp(info.arena),
            ordblks: clamp(info.ordblks),
            smblks: clamp(info.smblks),
            hblks: 0,
            hblkhd: 0,
            usmblks: 0,
            fsmblks: clamp(info.fsmblks),
            uordblks: clamp(info.uordblks),
            fordblks: clamp(info.fordblks),
            keepcost: 0,
        }
    }
}

/// C `mallinfo` -- heap usage summary.
///
/// # Safety
///
/// Always safe to call; `unsafe` only for ABI uniformity.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn mallinfo() -> MallInfo {
    global_heap().mallinfo().into()
}

/// C `malloc_stats` -- prints the heap summary to stderr.
///
/// # Safety
///
/// Always safe to call; `unsafe` only for ABI uniformity.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_stats() {
    let info = global_heap().mallinfo();
    let mut err = std::io::stderr().lock();
    // Nothing useful to do if stderr is gone.
    let _ = writeln!(
        err,
        "max system bytes = {:10}\nsystem bytes     = {:10}\nin use bytes     = {:10}\nfree bytes       = {:10}\nsmall free       = {:10}",
        info.arena,
        info.arena,
        info.uordblks,
        info.fordblks + info.fsmblks,
        info.fsmblks,
    );
}

/// C `getpagesize`.
///
/// # Safety
///
/// Always safe to call; `unsafe` only for ABI uniformity.
#[cfg_attr(all(feature = "interpose", not(test)), unsafe(no_mangle))]
pub unsafe extern "C" fn getpagesize() -> c_int {
    PAGE_SIZE as c_int
}
