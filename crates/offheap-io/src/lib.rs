//! offheap-io: concrete `Platform` implementations.
//!
//! - [`OsPlatform`]: real syscalls through `libc` (Unix only).
//! - [`MemoryPlatform`]: heap-backed double with in-memory files and fault
//!   injection, used by tests and `--platform memory` dry runs.

use std::sync::Arc;

use offheap_core::{AllocatorConfig, Platform, PlatformKind, Result};

pub mod memory;
#[cfg(unix)]
pub mod os;

pub use memory::MemoryPlatform;
#[cfg(unix)]
pub use os::OsPlatform;

/// Build the platform selected by `config.platform`.
pub fn build_platform(config: &AllocatorConfig) -> Result<Arc<dyn Platform>> {
    match config.platform {
        PlatformKind::Memory => Ok(Arc::new(MemoryPlatform::new())),
        #[cfg(unix)]
        PlatformKind::Os => Ok(Arc::new(OsPlatform::new())),
        #[cfg(not(unix))]
        PlatformKind::Os => Err(offheap_core::Error::Unsupported(
            "the OS platform requires a Unix target",
        )),
    }
}
