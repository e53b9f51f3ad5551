#![forbid(unsafe_code)]
//! offheap-core: shared types for the off-heap slab allocator.
//!
//! Holds configuration, ids, error types and the capability traits
//! (`Platform`, `MemoryBudget`) that the other crates implement or consume.
//! No syscalls and no allocator logic live here.

pub mod budget;
pub mod config;
pub mod error;
pub mod id;
pub mod platform;
pub mod prelude;

pub use config::{AllocatorConfig, PlatformKind};
pub use error::{Error, Result};
pub use platform::{Platform, ResourceKind, ResourceLimit};
