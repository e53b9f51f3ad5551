//! Consumer-facing facade: size classes, chunk lifecycle, and the
//! relocation protocol.
//!
//! Reads and writes never block on the happy path. They `try_read` the
//! superblock behind the chunk's current handle; if that fails, or the handle
//! is no longer active, the chunk is relocated (re-placed and reloaded from
//! its backing file) under the chunk's own handle lock and the access is
//! retried against the new handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use offheap_core::id::ChunkId;
use offheap_core::{AllocatorConfig, Platform, ResourceKind, ResourceLimit};

use crate::error::{Error, Result};
use crate::handle::{BackingFile, Chunk, ChunkHeader, ConsumerHandle};
use crate::pool::{Allocation, PoolStats, SlabPool};
use crate::region::Region;
use crate::reservoir::Reservoir;
use crate::slab::FreeOutcome;
use crate::swap::{SwapController, SwapOutcome};
use crate::tracking::SwapSnapshot;

/// Element sizes are multiples of this.
pub const SIZE_ALIGN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub budget_bytes: usize,
    pub reserved_bytes: usize,
    pub peak_bytes: usize,
    pub occupancy: f64,
    pub superblocks: usize,
    pub live_chunks: usize,
    pub swap: SwapSnapshot,
    pub pools: Vec<PoolStats>,
}

pub struct OffHeapAllocator {
    config: AllocatorConfig,
    platform: Arc<dyn Platform>,
    reservoir: Reservoir,
    pools: RwLock<HashMap<usize, Arc<SlabPool>>>,
    swap: SwapController,
    slab_ids: Arc<AtomicU64>,
    chunk_ids: AtomicU64,
    live_chunks: AtomicUsize,
}

/// Round a requested size up to its size class.
pub fn size_class(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::InvalidSize(size));
    }
    size.checked_add(SIZE_ALIGN - 1)
        .map(|s| s / SIZE_ALIGN * SIZE_ALIGN)
        .ok_or(Error::InvalidSize(size))
}

impl OffHeapAllocator {
    pub fn new(config: AllocatorConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        config.validate()?;
        let budget = clamp_budget(platform.as_ref(), config.budget_bytes)?;
        let smallest = region_granule(&config, platform.as_ref(), config.superblock_bytes);
        if budget < smallest {
            return Err(offheap_core::Error::Config(format!(
                "budget of {budget} bytes cannot hold one {smallest}-byte superblock"
            ))
            .into());
        }
        if config.lock_memory {
            raise_memlock(platform.as_ref(), budget);
        }
        let reservoir = Reservoir::new(
            Arc::clone(&platform),
            budget,
            config.huge_pages,
            config.lock_memory,
        );
        tracing::info!(
            budget,
            superblock = config.superblock_bytes,
            swap_dir = %config.swap_dir,
            "off-heap allocator ready"
        );
        Ok(Self {
            swap: SwapController::new(config.cold_usage_threshold, config.swap_target_ratio),
            config,
            platform,
            reservoir,
            pools: RwLock::new(HashMap::new()),
            slab_ids: Arc::new(AtomicU64::new(1)),
            chunk_ids: AtomicU64::new(1),
            live_chunks: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn reservoir(&self) -> &Reservoir {
        &self.reservoir
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Allocate a chunk of `size` bytes. The chunk starts zeroed.
    pub fn allocate(&self, size: usize) -> Result<Chunk> {
        let element = size_class(size)?;
        let id = ChunkId::new(self.chunk_ids.fetch_add(1, Ordering::Relaxed));
        let path = PathBuf::from(&self.config.swap_dir).join(format!("chunk-{}.bin", id.get()));
        let backing = Arc::new(BackingFile::new(path, element));

        for _ in 0..self.config.max_alloc_retries {
            let Some(handle) = self.place(element, &backing)? else {
                continue;
            };
            // Partial pages of a reused slot keep the previous tenant's bytes.
            handle
                .owner()
                .with_region(|r| r.zero(handle.address() - r.addr(), element))
                .transpose()?;
            self.live_chunks.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(chunk = %id, size, element, addr = handle.address(), "chunk allocated");
            return Ok(Arc::new(ChunkHeader::new(id, size, element, backing, handle)));
        }
        Err(self.out_of_memory(element))
    }

    /// Free a chunk. Its slot goes back to the pool and its backing file is
    /// deleted. A second free is rejected with [`Error::DoubleFree`].
    pub fn free(&self, chunk: &Chunk) -> Result<()> {
        let slot = chunk.lock_handle();
        let handle = Arc::clone(&slot);
        if chunk.is_freed() {
            tracing::warn!(chunk = %chunk.id(), addr = handle.address(), "double free");
            return Err(Error::DoubleFree {
                addr: handle.address(),
            });
        }
        let pool = self.pool_for(chunk.element_size());
        // A handle whose superblock was evicted has no slot left to return.
        // On error the chunk stays live so the caller can retry.
        let outcome = pool.free_in(handle.owner(), handle.address())?;
        chunk.mark_freed();
        if outcome == FreeOutcome::AlreadyFree {
            return Err(Error::DoubleFree {
                addr: handle.address(),
            });
        }
        drop(slot);
        if let Err(e) = chunk.backing().discard(self.platform.as_ref()) {
            tracing::error!(chunk = %chunk.id(), error = %e, "failed to remove backing file");
        }
        self.live_chunks.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy `buf.len()` bytes from the chunk at `offset`.
    pub fn read(&self, chunk: &Chunk, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.access(chunk, offset, buf.len(), false, |region, at| {
            region.read(at, buf)
        })
    }

    /// Copy `data` into the chunk at `offset`, marking it dirty.
    pub fn write(&self, chunk: &Chunk, offset: usize, data: &[u8]) -> Result<()> {
        self.access(chunk, offset, data.len(), true, |region, at| {
            region.write(at, data)
        })
    }

    fn access(
        &self,
        chunk: &Chunk,
        offset: usize,
        len: usize,
        dirty: bool,
        mut op: impl FnMut(&Region, usize) -> Result<()>,
    ) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= chunk.size() => {}
            _ => {
                return Err(Error::OutOfBounds {
                    offset,
                    len,
                    size: chunk.size(),
                })
            }
        }
        for _ in 0..self.config.max_alloc_retries {
            if chunk.is_freed() {
                return Err(Error::Released);
            }
            let handle = chunk.handle();
            if handle.is_active() {
                let done = handle.owner().try_access(|region| {
                    let at = handle.address() - region.addr() + offset;
                    let result = op(region, at);
                    if dirty && result.is_ok() {
                        // Under the read lock, so eviction cannot miss it.
                        handle.mark_dirty();
                    }
                    result
                });
                if let Some(result) = done {
                    return result;
                }
            }
            self.relocate(chunk)?;
        }
        Err(self.out_of_memory(chunk.element_size()))
    }

    /// Make sure the chunk has an active handle, reloading it from its
    /// backing file if its superblock was evicted.
    pub fn relocate(&self, chunk: &Chunk) -> Result<()> {
        let mut slot = chunk.lock_handle();
        if chunk.is_freed() {
            return Err(Error::Released);
        }
        let stale = Arc::clone(&slot);
        // Lost a race with a reader or an eviction that never happened.
        if stale.is_active() && stale.owner().wait_active() {
            return Ok(());
        }

        let element = chunk.element_size();
        let mut image = vec![0u8; element];
        let loaded = chunk
            .backing()
            .load(self.platform.as_ref(), &mut image)
            .map_err(|e| {
                self.swap.counters().io_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(chunk = %chunk.id(), error = %e, "reload failed");
                e
            })?;

        for _ in 0..self.config.max_alloc_retries {
            let Some(fresh) = self.place(element, chunk.backing())? else {
                continue;
            };
            let written = fresh
                .owner()
                .with_region(|r| r.write(fresh.address() - r.addr(), &image));
            match written {
                Some(result) => result?,
                // Evicted before we could fill it. Place again.
                None => continue,
            }
            let counters = self.swap.counters();
            counters.relocations.fetch_add(1, Ordering::Relaxed);
            if loaded {
                counters
                    .reloaded_bytes
                    .fetch_add(element as u64, Ordering::Relaxed);
            }
            tracing::debug!(
                chunk = %chunk.id(),
                from = stale.address(),
                to = fresh.address(),
                loaded,
                "chunk relocated"
            );
            *slot = fresh;
            return Ok(());
        }
        Err(self.out_of_memory(element))
    }

    /// Claim a slot of size class `element` and register a handle for it.
    ///
    /// `Ok(None)` when the slot's superblock was evicted before the handle
    /// could be registered; the caller should try again.
    fn place(&self, element: usize, backing: &Arc<BackingFile>) -> Result<Option<Arc<ConsumerHandle>>> {
        let Allocation { superblock, addr } = self.claim(element)?;
        let slot = superblock.slab().slot_of(addr)?;
        let handle = Arc::new(ConsumerHandle::new(
            addr,
            slot,
            Arc::clone(&superblock),
            Arc::clone(backing),
        ));
        Ok(superblock.register(&handle).then_some(handle))
    }

    /// Allocate from the size class's pool, swapping when the reservoir is
    /// full.
    fn claim(&self, element: usize) -> Result<Allocation> {
        let pool = self.pool_for(element);
        let needed = pool.region_size();
        if needed > self.reservoir.capacity_bytes() {
            return Err(self.out_of_memory(element));
        }
        // Only completed rounds count against the bound; a round run by
        // another thread is waited out.
        let mut rounds = 0;
        while rounds < self.config.max_alloc_retries {
            match pool.allocate(&self.reservoir) {
                Ok(allocation) => return Ok(allocation),
                Err(Error::ReservoirExhausted) => {}
                Err(e) => return Err(e),
            }
            let pools = self.pool_list();
            match self
                .swap
                .run(&pools, &self.reservoir, self.platform.as_ref(), needed)
            {
                SwapOutcome::Busy => self.swap.wait_idle(),
                SwapOutcome::Completed(report) => {
                    rounds += 1;
                    if report.evicted == 0 && self.reservoir.available_bytes() < needed {
                        return Err(self.out_of_memory(element));
                    }
                }
            }
        }
        Err(self.out_of_memory(element))
    }

    fn out_of_memory(&self, requested: usize) -> Error {
        Error::OutOfMemory {
            requested,
            budget: self.reservoir.capacity_bytes(),
            used: self.reservoir.used_bytes(),
        }
    }

    fn region_size(&self, element: usize) -> usize {
        region_granule(&self.config, self.platform.as_ref(), element)
    }

    fn pool_for(&self, element: usize) -> Arc<SlabPool> {
        if let Some(pool) = self.pools.read().get(&element) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        let pool = pools.entry(element).or_insert_with(|| {
            tracing::debug!(element, "new size class");
            Arc::new(SlabPool::new(
                element,
                self.region_size(element),
                Arc::clone(&self.slab_ids),
            ))
        });
        Arc::clone(pool)
    }

    fn pool_list(&self) -> Vec<Arc<SlabPool>> {
        self.pools.read().values().cloned().collect()
    }

    /// Evict the superblock currently holding `chunk`. Returns `false` if it
    /// was already inactive.
    pub fn evict(&self, chunk: &Chunk) -> Result<bool> {
        let handle = chunk.handle();
        let superblock = Arc::clone(handle.owner());
        let evicted = superblock.evict(self.platform.as_ref(), self.swap.counters())?;
        self.pool_for(chunk.element_size()).remove(&superblock);
        Ok(evicted.is_some())
    }

    /// Run a swap round now, regardless of pressure.
    pub fn swap(&self) -> SwapOutcome {
        let pools = self.pool_list();
        self.swap
            .run(&pools, &self.reservoir, self.platform.as_ref(), 0)
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut pools: Vec<PoolStats> = self.pool_list().iter().map(|p| p.stats()).collect();
        pools.sort_by_key(|p| p.element_size);
        AllocatorStats {
            budget_bytes: self.reservoir.capacity_bytes(),
            reserved_bytes: self.reservoir.used_bytes(),
            peak_bytes: self.reservoir.peak_bytes(),
            occupancy: self.reservoir.occupancy(),
            superblocks: pools.iter().map(|p| p.superblocks).sum(),
            live_chunks: self.live_chunks.load(Ordering::Relaxed),
            swap: self.swap.snapshot(),
            pools,
        }
    }
}

impl std::fmt::Debug for OffHeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffHeapAllocator")
            .field("reservoir", &self.reservoir)
            .field("swap", &self.swap)
            .field("live_chunks", &self.live_chunks.load(Ordering::Relaxed))
            .finish()
    }
}

/// Region size for elements of `element` bytes: at least one superblock,
/// rounded up to whole pages, or whole huge pages when those are requested.
fn region_granule(config: &AllocatorConfig, platform: &dyn Platform, element: usize) -> usize {
    let granule = if config.huge_pages {
        platform.huge_page_size()
    } else {
        platform.page_size()
    };
    config.superblock_bytes.max(element).div_ceil(granule) * granule
}

/// Fit the budget under the address-space limit, raising the soft limit
/// when the hard limit allows it.
fn clamp_budget(platform: &dyn Platform, budget: usize) -> Result<usize> {
    let limit = platform.resource_limit(ResourceKind::AddressSpace)?;
    let wanted = budget as u64;
    if limit.allows(wanted) {
        return Ok(budget);
    }
    if limit.could_allow(wanted) {
        let raised = ResourceLimit {
            soft: limit.hard,
            hard: limit.hard,
        };
        match platform.set_resource_limit(ResourceKind::AddressSpace, raised) {
            Ok(()) => {
                tracing::info!(budget, "raised address-space soft limit");
                return Ok(budget);
            }
            Err(e) => tracing::warn!(error = %e, "could not raise address-space limit"),
        }
    }
    let clamped = limit.soft.map_or(budget, |soft| budget.min(soft as usize));
    tracing::warn!(requested = budget, clamped, "budget clamped to address-space limit");
    Ok(clamped)
}

/// Best effort: lift the memlock soft limit toward the budget.
fn raise_memlock(platform: &dyn Platform, budget: usize) {
    let wanted = budget as u64;
    let limit = match platform.resource_limit(ResourceKind::MemLock) {
        Ok(limit) => limit,
        Err(e) => {
            tracing::warn!(error = %e, "cannot read memlock limit");
            return;
        }
    };
    if limit.allows(wanted) {
        return;
    }
    let raised = ResourceLimit {
        soft: Some(limit.hard.map_or(wanted, |hard| hard.min(wanted))),
        hard: limit.hard,
    };
    if let Err(e) = platform.set_resource_limit(ResourceKind::MemLock, raised) {
        tracing::warn!(error = %e, "cannot raise memlock limit");
    } else if !raised.allows(wanted) {
        tracing::warn!(budget, limit = ?raised.soft, "memlock limit below budget; mlock may fail");
    }
}
