//! The platform capability consumed by the allocator.
//!
//! Everything that would otherwise be a syscall (virtual memory, backing
//! files, resource limits) goes through this trait so it can be injected at
//! construction time. `offheap-io` provides the OS implementation and an
//! in-memory test double.
//!
//! Addresses are passed as `NonNull<u8>` and are only ever ones previously
//! returned by [`Platform::reserve`] on the same platform instance.

use std::fmt;
use std::path::Path;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::id::FileId;

/// Process resource limits the allocator cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Data segment size (`RLIMIT_DATA`).
    Data,
    /// Total address space (`RLIMIT_AS`); bounds the reservoir budget.
    AddressSpace,
    /// Bytes that may be locked into RAM (`RLIMIT_MEMLOCK`).
    MemLock,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Data => "data",
            ResourceKind::AddressSpace => "address_space",
            ResourceKind::MemLock => "memlock",
        };
        f.write_str(s)
    }
}

/// Soft/hard limit pair. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

impl ResourceLimit {
    pub const UNLIMITED: ResourceLimit = ResourceLimit {
        soft: None,
        hard: None,
    };

    /// Whether `bytes` fits under the soft limit.
    pub fn allows(&self, bytes: u64) -> bool {
        self.soft.map_or(true, |soft| bytes <= soft)
    }

    /// Whether `bytes` fits under the hard limit (i.e. the soft limit could
    /// be raised to accommodate it).
    pub fn could_allow(&self, bytes: u64) -> bool {
        self.hard.map_or(true, |hard| bytes <= hard)
    }
}

/// Syscall capability.
///
/// Implementations must be thread-safe; the allocator calls into them from
/// every thread that allocates, frees, evicts, or relocates.
pub trait Platform: Send + Sync + 'static {
    /// Granularity of `commit`/`decommit`.
    fn page_size(&self) -> usize;

    /// Size of one huge page. Regions requested with `huge_pages` are
    /// rounded up to a multiple of this.
    fn huge_page_size(&self) -> usize {
        self.page_size()
    }

    /// Reserve `size` bytes of address space. The range is not usable until
    /// committed. `huge_pages` is a hint; implementations may fall back.
    fn reserve(&self, size: usize, huge_pages: bool) -> Result<NonNull<u8>>;

    /// Make a reserved range readable and writable.
    fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<()>;

    /// Return the physical pages behind a committed range to the OS. The
    /// range stays mapped and reads back as zeroes.
    fn decommit(&self, addr: NonNull<u8>, size: usize) -> Result<()>;

    /// Release a whole reservation. `addr`/`size` must match a `reserve`.
    fn release(&self, addr: NonNull<u8>, size: usize) -> Result<()>;

    /// Pin a committed range in RAM.
    fn lock(&self, addr: NonNull<u8>, size: usize) -> Result<()>;

    fn open_backing_file(&self, path: &Path) -> Result<FileId>;

    fn close_file(&self, fd: FileId) -> Result<()>;

    /// Delete a backing file. Idempotent.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Ensure `[offset, offset + len)` is allocated on disk.
    fn preallocate(&self, fd: FileId, offset: u64, len: u64) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_to_file(&self, fd: FileId, offset: u64, buf: &[u8]) -> Result<()>;

    /// Fill `buf` from `offset`. Returns the number of bytes read, which is
    /// short only at end of file.
    fn read_from_file(&self, fd: FileId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn resource_limit(&self, kind: ResourceKind) -> Result<ResourceLimit>;

    fn set_resource_limit(&self, kind: ResourceKind, limit: ResourceLimit) -> Result<()>;
}
