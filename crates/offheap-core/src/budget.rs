//! Virtual-memory budget interfaces.
//!
//! The reservoir in `offheap-mem` is the only implementor. Keeping the traits
//! here lets the CLI and tests reason about occupancy without pulling in the
//! allocator.

/// RAII lease over a number of budgeted bytes.
///
/// Dropping the lease hands the bytes back. Implementations must be `Send`
/// because regions (and their leases) migrate between threads.
pub trait BudgetGuard: Send {
    /// Bytes held by this lease.
    fn bytes(&self) -> usize;

    /// Debug tag recorded at acquisition.
    fn tag(&self) -> &'static str {
        "lease"
    }
}

/// The off-heap footprint cap.
///
/// `try_acquire` is all-or-nothing: it never hands out a partial lease. A
/// `None` tells the caller to evict something or give up.
pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard>;

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> usize;

    /// Currently leased bytes (advisory; may be stale by the time it is read).
    fn used_bytes(&self) -> usize;

    fn available_bytes(&self) -> usize {
        self.capacity_bytes().saturating_sub(self.used_bytes())
    }

    /// Leased fraction of the capacity, in `[0, 1]`.
    fn occupancy(&self) -> f64 {
        let cap = self.capacity_bytes();
        if cap == 0 {
            return 1.0;
        }
        self.used_bytes() as f64 / cap as f64
    }
}
