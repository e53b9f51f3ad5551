//! A slab whose region can be evicted.
//!
//! State lives in one `RwLock<Option<Region>>`: `Some` is ACTIVE, `None` is
//! INACTIVE (terminal). EVICTING is simply "write lock held". Readers and
//! writers use `try_read` and treat a failure as a stale handle; only
//! eviction and release take the write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use offheap_core::id::SlabId;
use offheap_core::Platform;

use crate::error::Result;
use crate::handle::ConsumerHandle;
use crate::region::Region;
use crate::slab::{FreeOutcome, Slab};
use crate::tracking::SwapCounters;

/// What one eviction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    /// Slots that were live when the region went away.
    pub drained: usize,
    /// Dirty slots written to their backing files.
    pub flushed: usize,
    pub flushed_bytes: usize,
    /// Virtual bytes returned to the reservoir.
    pub region_bytes: usize,
}

pub struct Superblock {
    slab: Slab,
    state: RwLock<Option<Region>>,
    owners: Mutex<HashMap<usize, Weak<ConsumerHandle>>>,
    usage: AtomicU64,
}

impl Superblock {
    pub fn new(id: SlabId, region: Region, element_size: usize) -> Result<Self> {
        let slab = Slab::new(id, region.addr(), region.len(), element_size)?;
        tracing::debug!(
            slab = %id,
            element_size,
            capacity = slab.capacity(),
            region = region.len(),
            "superblock created"
        );
        Ok(Self {
            slab,
            state: RwLock::new(Some(region)),
            owners: Mutex::new(HashMap::new()),
            usage: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> SlabId {
        self.slab.id()
    }

    pub fn slab(&self) -> &Slab {
        &self.slab
    }

    pub fn element_size(&self) -> usize {
        self.slab.element_size()
    }

    pub fn region_size(&self) -> usize {
        self.slab.region_size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.slab.contains(addr)
    }

    /// Non-blocking liveness probe. A superblock under eviction reads as
    /// inactive.
    pub fn is_active(&self) -> bool {
        self.state.try_read().map_or(false, |s| s.is_some())
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Registered owners (occupied slots that eviction would drain).
    pub fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }

    pub fn allocate(&self) -> Option<usize> {
        self.slab.allocate()
    }

    /// Record `handle` as the owner of its slot.
    ///
    /// Fails if the superblock went inactive after the slot was handed out;
    /// the slot died with the region and the caller must place again.
    pub(crate) fn register(&self, handle: &Arc<ConsumerHandle>) -> bool {
        let state = self.state.read();
        if state.is_none() {
            return false;
        }
        self.owners
            .lock()
            .insert(handle.address(), Arc::downgrade(handle));
        true
    }

    /// Hot path: run `f` against the region without blocking.
    ///
    /// `None` if the superblock is being evicted or already inactive.
    pub fn try_access<R>(&self, f: impl FnOnce(&Region) -> R) -> Option<R> {
        let state = self.state.try_read()?;
        let region = state.as_ref()?;
        self.usage.fetch_add(1, Ordering::Relaxed);
        Some(f(region))
    }

    /// Like [`try_access`](Self::try_access) but waits out an eviction in
    /// progress. Used by relocation and reload, never by the hot path.
    pub fn with_region<R>(&self, f: impl FnOnce(&Region) -> R) -> Option<R> {
        let state = self.state.read();
        let region = state.as_ref()?;
        self.usage.fetch_add(1, Ordering::Relaxed);
        Some(f(region))
    }

    /// Block until no eviction holds the lock; report whether still active.
    pub fn wait_active(&self) -> bool {
        self.state.read().is_some()
    }

    /// Return `addr` to the slab, decommitting the pages it covered.
    ///
    /// Freeing into an inactive superblock is a no-op: the slot went away
    /// with the region. Frees are serialized on the owner table, so of two
    /// racing frees of one address exactly one pushes the slot. A free of a
    /// slot that has already been handed out again cannot be told apart from
    /// a legitimate one; callers must own the address.
    pub(crate) fn free(&self, addr: usize) -> Result<FreeOutcome> {
        let state = self.state.read();
        let Some(region) = state.as_ref() else {
            return Ok(FreeOutcome::Freed);
        };
        self.slab.slot_of(addr)?;
        let mut owners = self.owners.lock();
        // The slot may be reused the moment it is pushed, so decommit first.
        if self.slab.is_free(addr) {
            tracing::warn!(slab = %self.id(), addr, "double free ignored");
            return Ok(FreeOutcome::AlreadyFree);
        }
        if let Err(e) = region.decommit(addr - region.addr(), self.element_size()) {
            // The pages stay resident until the region goes; the slot is
            // still good.
            tracing::warn!(slab = %self.id(), addr, error = %e, "decommit failed");
        }
        let outcome = self.slab.free(addr)?;
        if outcome == FreeOutcome::Freed {
            owners.remove(&addr);
        }
        Ok(outcome)
    }

    /// One-shot release once no slot is live. Drops the region, which
    /// unmaps it and returns its bytes to the reservoir.
    pub fn try_release(&self) -> bool {
        let mut state = self.state.write();
        if state.is_none() || !self.slab.try_release() {
            return false;
        }
        let region = state.take();
        drop(state);
        drop(region);
        tracing::debug!(slab = %self.id(), "superblock released");
        true
    }

    /// Flush dirty slots, deactivate every owner handle, and give the region
    /// back.
    ///
    /// A flush failure leaves the superblock fully active and returns the
    /// error; slots flushed before it simply become clean. `Ok(None)` means
    /// the superblock was already inactive.
    pub fn evict(&self, platform: &dyn Platform, counters: &SwapCounters) -> Result<Option<Eviction>> {
        let mut state = self.state.write();
        let Some(region) = state.as_ref() else {
            return Ok(None);
        };

        let owners: Vec<Arc<ConsumerHandle>> = self
            .owners
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let element_size = self.element_size();
        let mut eviction = Eviction {
            drained: owners.len(),
            region_bytes: region.len(),
            ..Eviction::default()
        };

        for handle in owners.iter().filter(|h| h.is_active() && h.is_dirty()) {
            let bytes = region.slice(handle.address() - region.addr(), element_size)?;
            if let Err(e) = handle.backing().flush(platform, bytes) {
                counters.io_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    slab = %self.id(),
                    path = %handle.backing().path().display(),
                    error = %e,
                    "flush failed, superblock stays active"
                );
                return Err(e);
            }
            handle.clear_dirty();
            eviction.flushed += 1;
            eviction.flushed_bytes += element_size;
        }

        for handle in &owners {
            handle.deactivate();
        }
        self.owners.lock().clear();
        self.slab.retire();
        let region = state.take();
        drop(state);
        drop(region);

        counters.evictions.fetch_add(1, Ordering::Relaxed);
        counters
            .flushed_slots
            .fetch_add(eviction.flushed as u64, Ordering::Relaxed);
        counters
            .flushed_bytes
            .fetch_add(eviction.flushed_bytes as u64, Ordering::Relaxed);
        tracing::debug!(
            slab = %self.id(),
            drained = eviction.drained,
            flushed = eviction.flushed,
            "superblock evicted"
        );
        Ok(Some(eviction))
    }

    /// Halve the usage counter so old heat fades.
    pub fn decay_usage(&self) {
        let _ = self
            .usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |u| Some(u / 2));
    }
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("slab", &self.slab)
            .field("active", &self.is_active())
            .field("usage", &self.usage())
            .finish()
    }
}
