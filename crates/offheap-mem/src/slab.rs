//! Bump + reuse allocator over one fixed-capacity region.
//!
//! A `Slab` only does bookkeeping: it hands out addresses inside
//! `[base, base + region_size)` but never touches the memory behind them.
//! The owning [`Superblock`](crate::superblock::Superblock) holds the region.
//!
//! Fresh slots come from a CAS-guarded bump cursor; freed slots go through a
//! [`SlotStack`] and are reused first. `live` counts outstanding slots and is
//! flipped to `-1` exactly once (`0 -> -1`) to retire the slab.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use offheap_core::id::SlabId;

use crate::error::{Error, Result};
use crate::slot_stack::{SlotStack, MAX_SLOTS};

const RETIRED: isize = -1;

/// What happened to a slot passed to [`Slab::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Slot returned to the free stack; `live` decremented.
    Freed,
    /// Slot was already on the free stack. Nothing changed.
    AlreadyFree,
}

pub struct Slab {
    id: SlabId,
    element_size: usize,
    region_size: usize,
    capacity: usize,
    base: usize,
    /// Next never-used slot index.
    bump: AtomicUsize,
    free_slots: SlotStack,
    live: AtomicIsize,
}

impl Slab {
    /// Lay out a slab over `[base, base + region_size)`.
    ///
    /// `base` must be non-zero and `element_size` a non-zero multiple of 4.
    pub fn new(id: SlabId, base: usize, region_size: usize, element_size: usize) -> Result<Self> {
        if element_size == 0 || element_size % 4 != 0 || element_size > region_size {
            return Err(Error::InvalidSize(element_size));
        }
        if base == 0 || base % 4 != 0 {
            return Err(Error::InvalidAddress { addr: base });
        }
        let capacity = (region_size / element_size).min(MAX_SLOTS);
        Ok(Self {
            id,
            element_size,
            region_size,
            capacity,
            base,
            bump: AtomicUsize::new(0),
            free_slots: SlotStack::new(capacity),
            live: AtomicIsize::new(0),
        })
    }

    pub fn id(&self) -> SlabId {
        self.id
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Outstanding slots, or `-1` once retired.
    pub fn live(&self) -> isize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_retired(&self) -> bool {
        self.live() < 0
    }

    /// Whether `addr` falls inside this slab's region.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.capacity * self.element_size
    }

    /// Slot index for an address returned by `allocate`.
    pub fn slot_of(&self, addr: usize) -> Result<usize> {
        if !self.contains(addr) || (addr - self.base) % self.element_size != 0 {
            return Err(Error::InvalidAddress { addr });
        }
        Ok((addr - self.base) / self.element_size)
    }

    pub fn address_of(&self, slot: usize) -> usize {
        self.base + slot * self.element_size
    }

    /// Allocate one element. `None` if the region is exhausted or the slab
    /// has been retired.
    pub fn allocate(&self) -> Option<usize> {
        if self.is_retired() {
            return None;
        }
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => self.bump_slot()?,
        };

        // A slot reserved while retirement raced us is dropped on the floor:
        // the slab can never hand it out again, which only costs capacity.
        let mut cur = self.live.load(Ordering::Acquire);
        loop {
            if cur < 0 {
                return None;
            }
            match self.live.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.address_of(slot)),
                Err(observed) => cur = observed,
            }
        }
    }

    fn bump_slot(&self) -> Option<usize> {
        let mut cur = self.bump.load(Ordering::Relaxed);
        loop {
            if cur >= self.capacity {
                return None;
            }
            match self.bump.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Return `addr` to the free stack.
    ///
    /// Page decommit is the owner's job; this only updates bookkeeping. A
    /// second free of the same address is detected by the stack and reported
    /// as [`FreeOutcome::AlreadyFree`] without touching `live`.
    pub fn free(&self, addr: usize) -> Result<FreeOutcome> {
        let slot = self.slot_of(addr)?;
        if slot >= self.bump.load(Ordering::Acquire) {
            // Never handed out.
            return Err(Error::InvalidAddress { addr });
        }
        if !self.free_slots.push(slot) {
            tracing::warn!(slab = %self.id, addr, slot, "double free ignored");
            return Ok(FreeOutcome::AlreadyFree);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(FreeOutcome::Freed)
    }

    /// Whether `addr` currently sits on the free stack.
    pub fn is_free(&self, addr: usize) -> bool {
        self.slot_of(addr)
            .map(|slot| self.free_slots.contains(slot))
            .unwrap_or(false)
    }

    /// Retire the slab if it has no live slots (`0 -> -1`, one-shot).
    pub fn try_release(&self) -> bool {
        self.live
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Retire unconditionally, returning the live count that was dropped.
    /// Used by eviction, which has already drained every slot to disk.
    pub(crate) fn retire(&self) -> isize {
        self.live.swap(RETIRED, Ordering::AcqRel).max(0)
    }

    /// Slots handed out at least once.
    pub fn high_water(&self) -> usize {
        self.bump.load(Ordering::Relaxed).min(self.capacity)
    }

    /// Whether every slot is in use.
    pub fn is_full(&self) -> bool {
        self.high_water() == self.capacity && self.free_slots.is_empty()
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("element_size", &self.element_size)
            .field("capacity", &self.capacity)
            .field("live", &self.live())
            .finish()
    }
}
