#![deny(unsafe_code)]
//! offheap-mem: lock-free slab allocation over a bounded virtual-memory
//! reservoir, with cold-superblock eviction to per-chunk backing files.
//!
//! Layering, bottom up: [`SlotStack`] (free list) → [`Slab`] (bump + reuse)
//! → [`Superblock`] (slab + evictable region) → [`SlabPool`] (one size
//! class) → [`OffHeapAllocator`] (size classes, swap, relocation).
//!
//! All syscalls go through the injected `offheap_core::Platform`; raw memory
//! is only touched inside `region`.

pub mod allocator;
pub mod error;
pub mod guard;
pub mod handle;
pub mod pool;
#[allow(unsafe_code)]
pub mod region;
pub mod reservoir;
pub mod slab;
pub mod slot_stack;
pub mod superblock;
pub mod swap;
pub mod tracking;

pub use allocator::{size_class, AllocatorStats, OffHeapAllocator};
pub use error::{Error, Result};
pub use guard::{BudgetLease, VirtualBudget};
pub use handle::{BackingFile, Chunk, ChunkHeader, ConsumerHandle, HandleState};
pub use pool::{Allocation, PoolStats, SlabPool};
pub use region::Region;
pub use reservoir::Reservoir;
pub use slab::{FreeOutcome, Slab};
pub use slot_stack::SlotStack;
pub use superblock::{Eviction, Superblock};
pub use swap::{SwapController, SwapOutcome, SwapReport};
pub use tracking::{PeakTracker, SwapSnapshot};
