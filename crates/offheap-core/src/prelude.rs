//! Convenient re-exports for downstream crates.

pub use crate::budget::{BudgetGuard, MemoryBudget};
pub use crate::config::{AllocatorConfig, PlatformKind};
pub use crate::error::{Error, Result};
pub use crate::id::{ChunkId, FileId, SlabId};
pub use crate::platform::{Platform, ResourceKind, ResourceLimit};
