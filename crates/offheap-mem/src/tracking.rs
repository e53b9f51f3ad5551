//! Lightweight peak/usage counters.
//!
//! Keep these cheap: they sit on the reservoir and hot access paths.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicUsize::new(0),
        }
    }

    /// Record a new "used bytes" value; updates peak if higher.
    pub fn record_used(&self, used_bytes: usize) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while used_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                used_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    tracing::trace!(used_bytes, "reservoir peak");
                    break;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

/// Monotonic counters for swap and relocation activity.
#[derive(Default)]
pub struct SwapCounters {
    pub(crate) rounds: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) flushed_slots: AtomicU64,
    pub(crate) flushed_bytes: AtomicU64,
    pub(crate) relocations: AtomicU64,
    pub(crate) reloaded_bytes: AtomicU64,
    pub(crate) io_failures: AtomicU64,
}

impl SwapCounters {
    pub fn snapshot(&self) -> SwapSnapshot {
        SwapSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            flushed_slots: self.flushed_slots.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            relocations: self.relocations.load(Ordering::Relaxed),
            reloaded_bytes: self.reloaded_bytes.load(Ordering::Relaxed),
            io_failures: self.io_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapSnapshot {
    pub rounds: u64,
    pub evictions: u64,
    pub flushed_slots: u64,
    pub flushed_bytes: u64,
    pub relocations: u64,
    pub reloaded_bytes: u64,
    pub io_failures: u64,
}
