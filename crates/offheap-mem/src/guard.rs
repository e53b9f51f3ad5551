//! Virtual-memory budget + RAII lease.
//!
//! Every region the reservoir maps is paid for with a `BudgetLease`. The
//! lease lives inside the `Region`, so the bytes come back exactly when the
//! mapping goes away (panic-safe).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offheap_core::budget::{BudgetGuard, MemoryBudget};

use crate::tracking::PeakTracker;

/// Shared inner state for the budget.
struct BudgetInner {
    capacity: usize,
    used: AtomicUsize,
    leases: AtomicUsize,
    peak: PeakTracker,
}

impl BudgetInner {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            leases: AtomicUsize::new(0),
            peak: PeakTracker::new(),
        }
    }

    fn try_acquire(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = match cur.checked_add(bytes) {
                Some(next) if next <= self.capacity => next,
                _ => return false,
            };
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.leases.fetch_add(1, Ordering::Relaxed);
                    self.peak.record_used(next);
                    return true;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
        self.leases.fetch_sub(1, Ordering::Relaxed);
    }
}

/// CAS-guarded byte budget shared by every size class.
#[derive(Clone)]
pub struct VirtualBudget {
    inner: Arc<BudgetInner>,
}

impl VirtualBudget {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner::new(capacity_bytes)),
        }
    }

    /// Outstanding leases (one per mapped region).
    pub fn lease_count(&self) -> usize {
        self.inner.leases.load(Ordering::Relaxed)
    }

    /// Highest `used_bytes` ever observed.
    pub fn peak_bytes(&self) -> usize {
        self.inner.peak.peak()
    }
}

/// RAII lease over budgeted bytes. Dropping it returns them.
pub struct BudgetLease {
    inner: Arc<BudgetInner>,
    bytes: usize,
    tag: &'static str,
}

impl Drop for BudgetLease {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            // NOTE: do not log here to keep drop path fast.
            self.bytes = 0;
        }
    }
}

impl BudgetGuard for BudgetLease {
    fn bytes(&self) -> usize {
        self.bytes
    }
    fn tag(&self) -> &'static str {
        self.tag
    }
}

impl std::fmt::Debug for BudgetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLease")
            .field("bytes", &self.bytes)
            .field("tag", &self.tag)
            .finish()
    }
}

impl MemoryBudget for VirtualBudget {
    type Guard = BudgetLease;

    // Zero-byte leases are refused: a region always has a size.
    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard> {
        if bytes == 0 || !self.inner.try_acquire(bytes) {
            return None;
        }
        Some(BudgetLease {
            inner: Arc::clone(&self.inner),
            bytes,
            tag,
        })
    }

    fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}
