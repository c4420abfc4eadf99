//! Arena growth on top of a [`BreakRegion`].
//!
//! The first extension of a region can land anywhere; every chunk after
//! that is sized so the next one abuts it with an aligned payload. Padding
//! is therefore only requested once we know it is needed, with a second,
//! exactly-sized extension.

use thiserror::Error;

use super::chunk::{CHUNK_ALIGN, HEAD_SIZE, align_up};
use super::region::BreakRegion;

/// Why an arena extension produced no usable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrowError {
    /// The request does not fit the signed displacement of the break call.
    #[error("request of {requested} bytes overflows the break displacement")]
    DisplacementOverflow { requested: usize },
    /// The region refused to grow.
    #[error("break region exhausted")]
    Exhausted,
    /// The alignment padding did not land right after the first extension.
    #[error("alignment padding landed at {got:#x}, expected {expected:#x}")]
    NonContiguous { expected: usize, got: usize },
}

/// Bounds of everything the allocator has taken from its region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arena {
    start: Option<usize>,
    top: Option<usize>,
}

impl Arena {
    /// An arena that has not grown yet.
    pub const fn new() -> Self {
        Self {
            start: None,
            top: None,
        }
    }

    /// Header address of the first chunk ever carved, once there is one.
    pub fn start(&self) -> Option<usize> {
        self.start
    }

    /// Break as of the last extension made by this arena.
    pub fn top(&self) -> Option<usize> {
        self.top
    }

    /// Bytes between `start` and `top`.
    pub fn span(&self) -> usize {
        match (self.start, self.top) {
            (Some(start), Some(top)) => top - start,
            _ => 0,
        }
    }

    /// Whether `[head, head + len)` lies inside the arena.
    pub fn contains(&self, head: usize, len: usize) -> bool {
        match (self.start, self.top) {
            (Some(start), Some(top)) => head >= start && head.saturating_add(len) <= top,
            _ => false,
        }
    }

    /// Takes `len` fresh bytes from the region.
    ///
    /// Returns the header address of a chunk that owns `len` bytes and whose
    /// payload is [`CHUNK_ALIGN`]-aligned.
    pub fn grow<R: BreakRegion>(&mut self, region: &mut R, len: usize) -> Result<usize, GrowError> {
        let delta =
            isize::try_from(len).map_err(|_| GrowError::DisplacementOverflow { requested: len })?;
        let raw = region.extend(delta).ok_or(GrowError::Exhausted)?;
        let raw_end = raw + len;
        self.set_top(raw_end);

        let head = align_up(raw + HEAD_SIZE, CHUNK_ALIGN) - HEAD_SIZE;
        if head != raw {
            // Only the very first extension of a region should get here.
            let adjust = head - raw;
            let extra = region.extend(adjust as isize).ok_or(GrowError::Exhausted)?;
            if extra != raw_end {
                self.set_top(extra + adjust);
                return Err(GrowError::NonContiguous {
                    expected: raw_end,
                    got: extra,
                });
            }
            self.set_top(extra + adjust);
        }

        if self.start.is_none() {
            self.start = Some(head);
        }
        Ok(head)
    }

    fn set_top(&mut self, top: usize) {
        self.top = Some(self.top.map_or(top, |current| current.max(top)));
    }
}
