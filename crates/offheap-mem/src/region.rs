//! Owned virtual-memory region.
//!
//! This is the only module that dereferences raw addresses. Everything else
//! goes through the bounds-checked accessors below. A `Region` owns its
//! reservation and the budget lease that paid for it: dropping it releases
//! the mapping through the platform and then returns the bytes.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use offheap_core::budget::BudgetGuard;
use offheap_core::Platform;

use crate::error::{Error, Result};
use crate::guard::BudgetLease;

pub struct Region {
    base: NonNull<u8>,
    len: usize,
    platform: Arc<dyn Platform>,
    // Dropped after the mapping is released (field order).
    _lease: BudgetLease,
}

// SAFETY: the region exclusively owns its mapping; concurrent access to the
// bytes goes through `read`/`write`, whose callers synchronize per slot.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve and commit `lease.bytes()` bytes.
    pub(crate) fn map(
        platform: Arc<dyn Platform>,
        lease: BudgetLease,
        huge_pages: bool,
        lock_memory: bool,
    ) -> Result<Self> {
        let len = lease.bytes();
        let base = platform.reserve(len, huge_pages)?;
        // From here on Drop releases the reservation if commit/lock fails.
        let region = Self {
            base,
            len,
            platform,
            _lease: lease,
        };
        region.platform.commit(region.base, len)?;
        if lock_memory {
            region.platform.lock(region.base, len)?;
        }
        Ok(region)
    }

    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: bounds checked above; the mapping is committed for the
        // region's lifetime and `buf` cannot overlap it.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: as in `read`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        // SAFETY: as in `read`.
        unsafe {
            ptr::write_bytes(self.base.as_ptr().add(offset), 0, len);
        }
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// The caller must hold whatever lock excludes writers to that range for
    /// the lifetime of the borrow (eviction holds the superblock write lock).
    pub(crate) fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: bounds checked; exclusion of writers is the caller's contract.
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }

    /// Give back the physical pages that lie entirely inside
    /// `[offset, offset + len)`. Partial pages are left alone because they
    /// may be shared with neighbouring slots.
    pub fn decommit(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        let page = self.platform.page_size();
        let start = offset.div_ceil(page) * page;
        let end = (offset + len) / page * page;
        if end <= start {
            return Ok(());
        }
        // SAFETY: `start < end <= self.len`, so the pointer stays in bounds.
        let addr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) };
        self.platform.decommit(addr, end - start)?;
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(e) = self.platform.release(self.base, self.len) {
            tracing::error!(addr = self.addr(), len = self.len, error = %e, "failed to release region");
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}
