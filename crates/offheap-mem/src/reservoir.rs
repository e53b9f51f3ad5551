//! Bounded pool of virtual-memory regions shared by every size class.
//!
//! The reservoir never maps more than its budget. Each region it hands out
//! carries the lease that paid for it, so a region returns to the reservoir
//! simply by being dropped (slab release or superblock eviction).

use std::sync::Arc;

use offheap_core::budget::MemoryBudget;
use offheap_core::Platform;

use crate::error::Result;
use crate::guard::VirtualBudget;
use crate::region::Region;

pub struct Reservoir {
    platform: Arc<dyn Platform>,
    budget: VirtualBudget,
    huge_pages: bool,
    lock_memory: bool,
}

impl Reservoir {
    pub fn new(
        platform: Arc<dyn Platform>,
        budget_bytes: usize,
        huge_pages: bool,
        lock_memory: bool,
    ) -> Self {
        Self {
            platform,
            budget: VirtualBudget::new(budget_bytes),
            huge_pages,
            lock_memory,
        }
    }

    /// Map a region of `size` bytes if the budget allows it.
    ///
    /// `Ok(None)` means the budget is exhausted and the caller should swap.
    /// Platform failures (mmap, mlock) are errors.
    pub fn try_reserve(&self, size: usize) -> Result<Option<Region>> {
        let Some(lease) = self.budget.try_acquire(size, "superblock") else {
            tracing::trace!(size, used = self.used_bytes(), "reservoir exhausted");
            return Ok(None);
        };
        let region = Region::map(
            Arc::clone(&self.platform),
            lease,
            self.huge_pages,
            self.lock_memory,
        )?;
        tracing::debug!(addr = region.addr(), size, used = self.used_bytes(), "region reserved");
        Ok(Some(region))
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn budget(&self) -> &VirtualBudget {
        &self.budget
    }

    pub fn capacity_bytes(&self) -> usize {
        self.budget.capacity_bytes()
    }

    pub fn used_bytes(&self) -> usize {
        self.budget.used_bytes()
    }

    pub fn available_bytes(&self) -> usize {
        self.budget.available_bytes()
    }

    pub fn peak_bytes(&self) -> usize {
        self.budget.peak_bytes()
    }

    pub fn occupancy(&self) -> f64 {
        self.budget.occupancy()
    }

    /// Regions currently mapped.
    pub fn region_count(&self) -> usize {
        self.budget.lease_count()
    }
}

impl std::fmt::Debug for Reservoir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservoir")
            .field("capacity", &self.capacity_bytes())
            .field("used", &self.used_bytes())
            .field("regions", &self.region_count())
            .finish()
    }
}
