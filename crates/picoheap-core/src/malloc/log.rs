//! Structured allocator lifecycle records.
//!
//! Every allocator decision can leave a record carrying a monotonic
//! decision id, a correlation trace id and a snapshot of the free
//! structures. Records live in a bounded ring; once it is full the oldest
//! record is dropped.

use std::collections::VecDeque;
use std::fmt;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `mallinfo`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `tail_grow`, ...).
    pub event: &'static str,
    /// Payload address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Bucket class involved in the event.
    pub bucket: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: bytes between arena start and top.
    pub arena_bytes: usize,
    /// Snapshot: chunks on the general free list.
    pub free_chunks: usize,
    /// Snapshot: chunks parked in buckets.
    pub bucket_chunks: usize,
}

/// Point-in-time view of the free structures attached to each record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LogSnapshot {
    pub arena_bytes: usize,
    pub free_chunks: usize,
    pub bucket_chunks: usize,
}

/// What happened, independent of heap state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogEvent {
    pub level: AllocatorLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub bucket: Option<usize>,
    pub outcome: &'static str,
}

/// Bounded, level-filtered ring of lifecycle records.
#[derive(Debug, Clone)]
pub(crate) struct LifecycleLog {
    min_level: Option<AllocatorLogLevel>,
    capacity: usize,
    records: VecDeque<AllocatorLogRecord>,
    next_decision_id: u64,
}

impl LifecycleLog {
    pub const fn new(min_level: Option<AllocatorLogLevel>, capacity: usize) -> Self {
        Self {
            min_level,
            capacity,
            records: VecDeque::new(),
            next_decision_id: 1,
        }
    }

    /// Whether a record at `level` would be kept.
    ///
    /// Callers check this before computing snapshots or formatting
    /// details, so a disabled log never allocates.
    pub fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.capacity > 0 && self.min_level.is_some_and(|min| level >= min)
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    pub fn push(&mut self, event: LogEvent, details: fmt::Arguments<'_>, snapshot: LogSnapshot) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("core::malloc::{}::{:016x}", event.symbol, decision_id);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(AllocatorLogRecord {
            decision_id,
            trace_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            bucket: event.bucket,
            outcome: event.outcome,
            details: details.to_string(),
            arena_bytes: snapshot.arena_bytes,
            free_chunks: snapshot.free_chunks,
            bucket_chunks: snapshot.bucket_chunks,
        });
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocatorLogRecord> {
        self.records.iter()
    }

    pub fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }
}
