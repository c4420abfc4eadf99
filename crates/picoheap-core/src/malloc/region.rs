//! Break regions: the memory the allocator carves chunks out of.
//!
//! A region only ever grows upward, one `extend` call at a time, the way
//! `sbrk(2)` moves a program break. The allocator never dereferences
//! addresses itself; every header read, link update and zero-fill goes
//! through the region, so the safe core can run over a plain byte vector
//! while the ABI layer backs the same trait with real memory.

use std::mem;

/// Width of one header word in bytes.
pub const WORD: usize = mem::size_of::<usize>();

/// Logical address of the first byte of a [`VecRegion`] unless told otherwise.
pub const DEFAULT_BASE: usize = 0x1000; // Start above zero page

/// A monotonic break plus word-level access to the memory below it.
///
/// Addresses are plain `usize` values. Address `0` is never part of a
/// region; the allocator uses it as the null free-list link.
pub trait BreakRegion {
    /// Moves the break up by `delta` bytes.
    ///
    /// Returns the break as it was before the call, or `None` if the region
    /// cannot grow. A negative `delta` is never passed by the allocator.
    fn extend(&mut self, delta: isize) -> Option<usize>;

    /// Reads the word stored at `addr`.
    fn read_word(&self, addr: usize) -> usize;

    /// Stores `value` at `addr`.
    fn write_word(&mut self, addr: usize, value: usize);

    /// Clears `len` bytes starting at `addr`.
    fn zero(&mut self, addr: usize, len: usize);
}

/// Growable byte vector standing in for a program break.
///
/// Used by tests, benchmarks and hosted callers that want a private arena.
/// The base address does not have to be aligned, which lets callers
/// reproduce targets whose initial break sits at an odd address. Two hooks
/// model a hostile environment: [`VecRegion::set_exhausted`] makes every
/// extension fail, and [`VecRegion::inject_foreign_growth`] moves the break
/// behind the allocator's back before the next extension.
#[derive(Debug, Clone)]
pub struct VecRegion {
    base: usize,
    bytes: Vec<u8>,
    limit: usize,
    exhausted: bool,
    foreign_growth: usize,
    extensions: u64,
}

impl VecRegion {
    /// Creates an empty region at [`DEFAULT_BASE`] that may grow to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self::with_base(DEFAULT_BASE, limit)
    }

    /// Creates an empty region whose first byte has logical address `base`.
    ///
    /// A zero base is bumped to one so no byte ever sits at the null address.
    pub fn with_base(base: usize, limit: usize) -> Self {
        let base = base.max(1);
        let limit = limit.min(usize::MAX - base);
        Self {
            base,
            bytes: Vec::new(),
            limit,
            exhausted: false,
            foreign_growth: 0,
            extensions: 0,
        }
    }

    /// Logical address of the first byte.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Current break (one past the last byte handed out).
    pub fn brk(&self) -> usize {
        self.base + self.bytes.len()
    }

    /// Maximum number of bytes the region will ever hold.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of successful `extend` calls so far.
    pub fn extensions(&self) -> u64 {
        self.extensions
    }

    /// Makes every later extension fail (`true`) or behave normally (`false`).
    pub fn set_exhausted(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
    }

    /// Moves the break forward by `bytes` just before the next extension,
    /// as if some other break user had run in between.
    pub fn inject_foreign_growth(&mut self, bytes: usize) {
        self.foreign_growth = self.foreign_growth.saturating_add(bytes);
    }

    /// Reads `len` bytes starting at `addr`.
    pub fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        let at = addr - self.base;
        &self.bytes[at..at + len]
    }

    /// Mutable view of `len` bytes starting at `addr`.
    pub fn bytes_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        let at = addr - self.base;
        &mut self.bytes[at..at + len]
    }

    fn grow_by(&mut self, delta: usize) -> Option<usize> {
        let used = self.bytes.len();
        let next = used.checked_add(delta)?;
        if next > self.limit {
            return None;
        }
        self.bytes.resize(next, 0);
        Some(self.base + used)
    }
}

impl BreakRegion for VecRegion {
    fn extend(&mut self, delta: isize) -> Option<usize> {
        if self.exhausted {
            return None;
        }
        let delta = usize::try_from(delta).ok()?;
        if self.foreign_growth > 0 {
            let foreign = std::mem::take(&mut self.foreign_growth);
            self.grow_by(foreign)?;
        }
        let previous = self.grow_by(delta)?;
        self.extensions += 1;
        Some(previous)
    }

    fn read_word(&self, addr: usize) -> usize {
        let mut word = [0u8; WORD];
        word.copy_from_slice(self.bytes(addr, WORD));
        usize::from_ne_bytes(word)
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        self.bytes_mut(addr, WORD)
            .copy_from_slice(&value.to_ne_bytes());
    }

    fn zero(&mut self, addr: usize, len: usize) {
        self.bytes_mut(addr, len).fill(0);
    }
}
