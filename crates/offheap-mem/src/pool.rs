//! Per-size-class list of superblocks.
//!
//! The list is copy-on-write: allocation walks an `Arc` snapshot without
//! holding any lock, and only publishing or removing a superblock takes the
//! (short) write lock. Growth is serialized by a single-creator CAS gate so
//! a burst of misses maps one new region, not one per thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use offheap_core::id::SlabId;

use crate::error::{Error, Result};
use crate::reservoir::Reservoir;
use crate::slab::FreeOutcome;
use crate::superblock::Superblock;

/// Spins a caller waits on another thread's growth before giving up.
const GROW_SPIN_LIMIT: usize = 4096;

/// A slot handed out by a pool.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub superblock: Arc<Superblock>,
    pub addr: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub element_size: usize,
    pub superblocks: usize,
    pub live_slots: usize,
    pub capacity_slots: usize,
    pub region_bytes: usize,
    pub usage: u64,
}

enum Growth {
    Grew(Allocation),
    /// Another thread holds the creator gate.
    Busy,
    /// The reservoir refused a new region.
    Exhausted,
}

/// Clears the creator gate on every exit path.
struct CreatorGate<'a>(&'a AtomicBool);

impl Drop for CreatorGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SlabPool {
    element_size: usize,
    region_size: usize,
    superblocks: RwLock<Arc<Vec<Arc<Superblock>>>>,
    creating: AtomicBool,
    ids: Arc<AtomicU64>,
}

impl SlabPool {
    /// `ids` is shared across pools so slab ids stay unique per allocator.
    pub fn new(element_size: usize, region_size: usize, ids: Arc<AtomicU64>) -> Self {
        Self {
            element_size,
            region_size,
            superblocks: RwLock::new(Arc::new(Vec::new())),
            creating: AtomicBool::new(false),
            ids,
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Current superblock list.
    pub fn superblocks(&self) -> Arc<Vec<Arc<Superblock>>> {
        Arc::clone(&self.superblocks.read())
    }

    fn try_existing(&self) -> Option<Allocation> {
        self.superblocks().iter().find_map(|sb| {
            sb.allocate().map(|addr| Allocation {
                superblock: Arc::clone(sb),
                addr,
            })
        })
    }

    /// Hand out one element.
    ///
    /// Fails with [`Error::ReservoirExhausted`] when every superblock is
    /// full and the reservoir cannot grant another region; the caller is
    /// expected to swap and retry.
    pub fn allocate(&self, reservoir: &Reservoir) -> Result<Allocation> {
        for _ in 0..GROW_SPIN_LIMIT {
            if let Some(allocation) = self.try_existing() {
                return Ok(allocation);
            }
            match self.grow(reservoir)? {
                Growth::Grew(allocation) => return Ok(allocation),
                Growth::Busy => std::thread::yield_now(),
                Growth::Exhausted => return Err(Error::ReservoirExhausted),
            }
        }
        Err(Error::ReservoirExhausted)
    }

    fn grow(&self, reservoir: &Reservoir) -> Result<Growth> {
        if self
            .creating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Growth::Busy);
        }
        let _gate = CreatorGate(&self.creating);

        // Someone may have published a superblock (or freed a slot) while
        // we raced for the gate.
        if let Some(allocation) = self.try_existing() {
            return Ok(Growth::Grew(allocation));
        }

        let Some(region) = reservoir.try_reserve(self.region_size)? else {
            return Ok(Growth::Exhausted);
        };
        let id = SlabId::new(self.ids.fetch_add(1, Ordering::Relaxed));
        let superblock = Arc::new(Superblock::new(id, region, self.element_size)?);
        // Take the first slot before publishing so the new region is not
        // drained by other threads before its creator gets anything.
        let addr = superblock
            .allocate()
            .ok_or(Error::InvalidSize(self.element_size))?;

        {
            let mut list = self.superblocks.write();
            let mut next = Vec::with_capacity(list.len() + 1);
            next.extend(list.iter().cloned());
            next.push(Arc::clone(&superblock));
            *list = Arc::new(next);
        }
        Ok(Growth::Grew(Allocation { superblock, addr }))
    }

    /// Free `addr` into whichever superblock owns it, releasing that
    /// superblock if it drains to zero.
    pub(crate) fn free(&self, addr: usize) -> Result<FreeOutcome> {
        let superblock = self
            .superblocks()
            .iter()
            .find(|sb| sb.contains(addr))
            .cloned()
            .ok_or(Error::InvalidAddress { addr })?;
        self.free_in(&superblock, addr)
    }

    /// Free `addr` into a known superblock.
    pub(crate) fn free_in(&self, superblock: &Arc<Superblock>, addr: usize) -> Result<FreeOutcome> {
        let outcome = superblock.free(addr)?;
        if outcome == FreeOutcome::Freed && superblock.slab().live() == 0 && superblock.try_release() {
            self.remove(superblock);
        }
        Ok(outcome)
    }

    /// Unpublish a superblock. Returns whether it was listed.
    pub fn remove(&self, superblock: &Arc<Superblock>) -> bool {
        let mut list = self.superblocks.write();
        if !list.iter().any(|sb| Arc::ptr_eq(sb, superblock)) {
            return false;
        }
        let next: Vec<_> = list
            .iter()
            .filter(|sb| !Arc::ptr_eq(sb, superblock))
            .cloned()
            .collect();
        *list = Arc::new(next);
        true
    }

    pub fn stats(&self) -> PoolStats {
        let list = self.superblocks();
        let mut stats = PoolStats {
            element_size: self.element_size,
            superblocks: list.len(),
            ..PoolStats::default()
        };
        for sb in list.iter() {
            stats.live_slots += sb.slab().live().max(0) as usize;
            stats.capacity_slots += sb.slab().capacity();
            stats.region_bytes += sb.region_size();
            stats.usage += sb.usage();
        }
        stats
    }
}

impl std::fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabPool")
            .field("element_size", &self.element_size)
            .field("region_size", &self.region_size)
            .field("superblocks", &self.superblocks().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offheap_io::MemoryPlatform;
    use std::collections::HashSet;
    use std::thread;

    fn setup(budget: usize) -> (Arc<MemoryPlatform>, Reservoir, SlabPool) {
        let platform = Arc::new(MemoryPlatform::new());
        let reservoir = Reservoir::new(platform.clone(), budget, false, false);
        let pool = SlabPool::new(1024, 4096, Arc::new(AtomicU64::new(1)));
        (platform, reservoir, pool)
    }

    #[test]
    fn test_grows_one_superblock_at_a_time() {
        let (_p, reservoir, pool) = setup(2 * 4096);
        let addrs: Vec<_> = (0..4)
            .map(|_| pool.allocate(&reservoir).unwrap().addr)
            .collect();
        assert_eq!(pool.stats().superblocks, 1);
        pool.allocate(&reservoir).unwrap();
        assert_eq!(pool.stats().superblocks, 2);
        assert_eq!(pool.stats().live_slots, 5);
        assert_eq!(addrs.iter().collect::<HashSet<_>>().len(), 4);
    }

    #[test]
    fn test_exhausted_reservoir_is_reported() {
        let (_p, reservoir, pool) = setup(4096);
        for _ in 0..4 {
            pool.allocate(&reservoir).unwrap();
        }
        assert!(matches!(
            pool.allocate(&reservoir),
            Err(Error::ReservoirExhausted)
        ));
    }

    #[test]
    fn test_draining_a_superblock_releases_it() {
        let (platform, reservoir, pool) = setup(4096);
        let a = pool.allocate(&reservoir).unwrap();
        let b = pool.allocate(&reservoir).unwrap();
        assert_eq!(pool.free(a.addr).unwrap(), FreeOutcome::Freed);
        assert_eq!(pool.stats().superblocks, 1);
        assert_eq!(pool.free(b.addr).unwrap(), FreeOutcome::Freed);
        assert_eq!(pool.stats().superblocks, 0);
        assert_eq!(reservoir.used_bytes(), 0);
        assert_eq!(platform.mapped_regions(), 0);
        assert!(!a.superblock.is_active());
        assert!(matches!(
            pool.free(a.addr),
            Err(Error::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_concurrent_allocation_creates_no_duplicates() {
        let (_p, reservoir, pool) = setup(16 * 4096);
        let reservoir = Arc::new(reservoir);
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let reservoir = Arc::clone(&reservoir);
                thread::spawn(move || {
                    (0..8)
                        .map(|_| pool.allocate(&reservoir).unwrap().addr)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(seen.insert(addr));
            }
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(pool.stats().superblocks, 16);
    }

    #[test]
    fn test_racing_double_free_pushes_once() {
        let (_p, reservoir, pool) = setup(4 * 4096);
        for _ in 0..50 {
            let keep = pool.allocate(&reservoir).unwrap();
            let victim = pool.allocate(&reservoir).unwrap();
            let live_before = victim.superblock.slab().live();
            let outcomes: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..2).map(|_| s.spawn(|| pool.free(victim.addr))).collect();
                handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
            });
            assert_eq!(
                outcomes.iter().filter(|o| **o == FreeOutcome::Freed).count(),
                1
            );
            assert_eq!(victim.superblock.slab().live(), live_before - 1);
            pool.free(keep.addr).unwrap();
        }
    }
}
