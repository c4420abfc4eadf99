//! Heap configuration.
//!
//! Two layers:
//! - [`HeapConfig`] is fixed when a heap is built: whether the small-chunk
//!   buckets exist, whether validation starts enabled, and how much
//!   lifecycle logging is kept.
//! - [`HeapMode`] can be switched at runtime and only toggles validation.
//!   The process-wide mode comes from the `PICOHEAP_MODE` environment
//!   variable:
//!   - `fast`: no validation on the allocation path.
//!   - `checked`: the whole free structure is validated every time the heap
//!     lock is taken and released. Default in debug builds.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::malloc::AllocatorLogLevel;

/// Runtime validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapMode {
    /// No validation on the allocation path.
    Fast,
    /// Validate the heap on every lock acquire and release.
    Checked,
}

impl Default for HeapMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Checked
        } else {
            Self::Fast
        }
    }
}

impl HeapMode {
    /// Parse from string (case-insensitive). Unknown values give the
    /// build's default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "release" | "off" | "none" => Self::Fast,
            "checked" | "debug" | "on" | "validate" => Self::Checked,
            _ => Self::default(),
        }
    }

    /// Returns true if the heap should be validated around every operation.
    #[must_use]
    pub const fn validates(self) -> bool {
        matches!(self, Self::Checked)
    }
}

/// Construction-time heap settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Serve small requests from power-of-two buckets.
    pub buckets: bool,
    /// Validate the heap around every locked operation.
    pub validate: bool,
    /// Least severe lifecycle record kept; `None` disables logging.
    pub log_level: Option<AllocatorLogLevel>,
    /// Number of lifecycle records retained before the oldest is dropped.
    pub log_capacity: usize,
}

impl HeapConfig {
    /// Hosted defaults: buckets on, build-default validation, logging on.
    pub const fn hosted() -> Self {
        Self {
            buckets: true,
            validate: cfg!(debug_assertions),
            log_level: Some(AllocatorLogLevel::Trace),
            log_capacity: 4096,
        }
    }

    /// Settings for a heap that backs the process allocator itself.
    ///
    /// Logging is off: the log ring would be allocated from the heap it
    /// describes.
    pub const fn embedded() -> Self {
        Self {
            buckets: true,
            validate: cfg!(debug_assertions),
            log_level: None,
            log_capacity: 0,
        }
    }

    #[must_use]
    pub const fn with_buckets(mut self, buckets: bool) -> Self {
        self.buckets = buckets;
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    #[must_use]
    pub const fn with_mode(self, mode: HeapMode) -> Self {
        self.with_validation(mode.validates())
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: Option<AllocatorLogLevel>) -> Self {
        self.log_level = level;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::hosted()
    }
}

// Process-wide mode: unresolved, being resolved, or a `HeapMode` code.
// Reading the environment allocates, and when this crate backs the process
// allocator that allocation lands back here mid-resolution. Those nested
// calls see RESOLVING and get the build default.
static CACHED_MODE: AtomicU8 = AtomicU8::new(UNRESOLVED);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;

impl HeapMode {
    const fn code(self) -> u8 {
        match self {
            Self::Fast => 2,
            Self::Checked => 3,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(Self::Fast),
            3 => Some(Self::Checked),
            _ => None,
        }
    }
}

/// Process-wide heap mode, read from `PICOHEAP_MODE` once.
#[must_use]
pub fn heap_mode() -> HeapMode {
    match CACHED_MODE.compare_exchange(UNRESOLVED, RESOLVING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            let mode = std::env::var("PICOHEAP_MODE")
                .map(|v| HeapMode::from_str_loose(&v))
                .unwrap_or_default();
            CACHED_MODE.store(mode.code(), Ordering::Release);
            mode
        }
        Err(code) => HeapMode::from_code(code).unwrap_or_default(),
    }
}
