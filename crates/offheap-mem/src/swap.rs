//! Cold-superblock eviction.
//!
//! One thread at a time runs a swap round (CAS-elected). A round ranks every
//! active superblock by its usage counter, evicts the coldest until the
//! reservoir is under its target occupancy with room for the caller's
//! region, and then ages the survivors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use offheap_core::Platform;

use crate::pool::SlabPool;
use crate::reservoir::Reservoir;
use crate::superblock::Superblock;
use crate::tracking::{SwapCounters, SwapSnapshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SwapReport {
    pub candidates: usize,
    pub evicted: usize,
    pub flushed_slots: usize,
    pub failures: usize,
    pub released_bytes: usize,
    pub occupancy_before: f64,
    pub occupancy_after: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SwapOutcome {
    /// Another thread is already swapping; retry the allocation.
    Busy,
    Completed(SwapReport),
}

struct OngoingGuard<'a>(&'a AtomicBool);

impl Drop for OngoingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SwapController {
    ongoing: AtomicBool,
    cold_threshold: u64,
    target_ratio: f64,
    counters: SwapCounters,
}

impl SwapController {
    pub fn new(cold_threshold: u64, target_ratio: f64) -> Self {
        Self {
            ongoing: AtomicBool::new(false),
            cold_threshold,
            target_ratio,
            counters: SwapCounters::default(),
        }
    }

    pub fn counters(&self) -> &SwapCounters {
        &self.counters
    }

    pub fn snapshot(&self) -> SwapSnapshot {
        self.counters.snapshot()
    }

    pub fn is_swapping(&self) -> bool {
        self.ongoing.load(Ordering::Acquire)
    }

    /// Block until no round is in progress. Spins briefly, then yields,
    /// then sleeps.
    pub fn wait_idle(&self) {
        let mut spins = 0u32;
        while self.is_swapping() {
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 128 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            spins = spins.saturating_add(1);
        }
    }

    fn is_cold(&self, superblock: &Superblock) -> bool {
        superblock.usage() < self.cold_threshold
    }

    /// Run one swap round, making room for a region of `needed` bytes.
    ///
    /// Cold superblocks go first. A warm one is only evicted when the round
    /// would otherwise free nothing, so a hot working set degrades to
    /// thrashing instead of failing outright.
    pub fn run(
        &self,
        pools: &[Arc<SlabPool>],
        reservoir: &Reservoir,
        platform: &dyn Platform,
        needed: usize,
    ) -> SwapOutcome {
        if self
            .ongoing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SwapOutcome::Busy;
        }
        let _guard = OngoingGuard(&self.ongoing);
        self.counters.rounds.fetch_add(1, Ordering::Relaxed);

        let satisfied = || {
            reservoir.occupancy() < self.target_ratio && reservoir.available_bytes() >= needed
        };

        let mut candidates: Vec<(&Arc<SlabPool>, Arc<Superblock>)> = pools
            .iter()
            .flat_map(|pool| {
                pool.superblocks()
                    .iter()
                    .filter(|sb| sb.is_active())
                    .map(|sb| (pool, Arc::clone(sb)))
                    .collect::<Vec<_>>()
            })
            .collect();
        candidates.sort_by_key(|(_, sb)| sb.usage());

        let mut report = SwapReport {
            candidates: candidates.len(),
            occupancy_before: reservoir.occupancy(),
            ..SwapReport::default()
        };

        for (pool, superblock) in &candidates {
            if satisfied() {
                break;
            }
            if !self.is_cold(superblock) && report.evicted > 0 {
                // Sorted ascending: everything left is warm too.
                break;
            }
            match superblock.evict(platform, &self.counters) {
                Ok(Some(eviction)) => {
                    pool.remove(superblock);
                    report.evicted += 1;
                    report.flushed_slots += eviction.flushed;
                    report.released_bytes += eviction.region_bytes;
                }
                Ok(None) => {
                    // Released or evicted behind our back.
                    pool.remove(superblock);
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(slab = %superblock.id(), error = %e, "eviction skipped");
                }
            }
        }

        for pool in pools {
            for superblock in pool.superblocks().iter() {
                superblock.decay_usage();
            }
        }

        report.occupancy_after = reservoir.occupancy();
        tracing::info!(
            candidates = report.candidates,
            evicted = report.evicted,
            flushed = report.flushed_slots,
            failures = report.failures,
            before = report.occupancy_before,
            after = report.occupancy_after,
            "swap round"
        );
        SwapOutcome::Completed(report)
    }
}

impl std::fmt::Debug for SwapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapController")
            .field("swapping", &self.is_swapping())
            .field("cold_threshold", &self.cold_threshold)
            .field("target_ratio", &self.target_ratio)
            .finish()
    }
}
