//! In-memory platform for testing.
//!
//! Regions are zeroed heap allocations and backing files are byte vectors
//! keyed by path, so tests never touch the filesystem or the process limits.
//! Reservation, decommit and file I/O failures can be injected, and file
//! I/O can be slowed down.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use offheap_core::id::FileId;
use offheap_core::{Error, Platform, ResourceKind, ResourceLimit, Result};

const PAGE_SIZE: usize = 4096;
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

pub struct MemoryPlatform {
    regions: Mutex<HashMap<usize, Layout>>,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    open: Mutex<HashMap<FileId, PathBuf>>,
    limits: Mutex<HashMap<ResourceKind, ResourceLimit>>,
    next_fd: AtomicU64,
    fail_reserve: AtomicBool,
    fail_io: AtomicBool,
    fail_decommit: AtomicBool,
    io_delay_us: AtomicU64,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(3),
            fail_reserve: AtomicBool::new(false),
            fail_io: AtomicBool::new(false),
            fail_decommit: AtomicBool::new(false),
            io_delay_us: AtomicU64::new(0),
        }
    }

    /// Make every following `reserve` fail.
    pub fn fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    /// Make every following file operation fail.
    pub fn fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::SeqCst);
    }

    /// Make every following `decommit` fail.
    pub fn fail_decommit(&self, fail: bool) {
        self.fail_decommit.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long in every file write and read.
    pub fn set_io_delay(&self, delay: Duration) {
        self.io_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn mapped_regions(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn mapped_bytes(&self) -> usize {
        self.regions.lock().values().map(Layout::size).sum()
    }

    /// Backing files that currently exist.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    pub fn file_contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Replace a file's bytes behind the allocator's back.
    pub fn overwrite_file(&self, path: &Path, bytes: &[u8]) {
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
    }

    /// Seed a resource limit (defaults to unlimited).
    pub fn set_limit(&self, kind: ResourceKind, limit: ResourceLimit) {
        self.limits.lock().insert(kind, limit);
    }

    fn check_io(&self, op: &str) -> Result<()> {
        let delay = self.io_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        if self.fail_io.load(Ordering::SeqCst) {
            return Err(Error::Platform(format!("{op}: injected I/O failure")));
        }
        Ok(())
    }

    fn path_of(&self, fd: FileId) -> Result<PathBuf> {
        self.open
            .lock()
            .get(&fd)
            .cloned()
            .ok_or_else(|| Error::Platform(format!("bad file descriptor {fd}")))
    }

    fn check_region(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        let start = addr.as_ptr() as usize;
        let known = self.regions.lock().iter().any(|(&base, layout)| {
            start >= base && start.checked_add(size).map_or(false, |end| end <= base + layout.size())
        });
        if known {
            Ok(())
        } else {
            Err(Error::Platform(format!("unknown range {start:#x}+{size}")))
        }
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryPlatform {
    fn drop(&mut self) {
        for (base, layout) in self.regions.get_mut().drain() {
            // SAFETY: every entry came from `alloc_zeroed` with this layout.
            unsafe { alloc::dealloc(base as *mut u8, layout) };
        }
    }
}

impl Platform for MemoryPlatform {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn huge_page_size(&self) -> usize {
        HUGE_PAGE_SIZE
    }

    fn reserve(&self, size: usize, _huge_pages: bool) -> Result<NonNull<u8>> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(Error::Platform("reserve: injected failure".into()));
        }
        if size == 0 {
            return Err(Error::Platform("reserve: zero size".into()));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| Error::Platform(format!("reserve: {e}")))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| Error::Platform("reserve: out of memory".into()))?;
        self.regions.lock().insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        self.check_region(addr, size)
    }

    fn decommit(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        self.check_region(addr, size)?;
        if self.fail_decommit.load(Ordering::SeqCst) {
            return Err(Error::Platform("madvise: injected failure".into()));
        }
        // SAFETY: the range lies inside a live allocation (checked above).
        unsafe { std::ptr::write_bytes(addr.as_ptr(), 0, size) };
        Ok(())
    }

    fn release(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        let base = addr.as_ptr() as usize;
        let layout = {
            let mut regions = self.regions.lock();
            match regions.get(&base) {
                Some(layout) if layout.size() == size => regions.remove(&base),
                Some(layout) => {
                    return Err(Error::Platform(format!(
                        "release: size {size} does not match reservation {}",
                        layout.size()
                    )))
                }
                None => None,
            }
        };
        let Some(layout) = layout else {
            return Err(Error::Platform(format!("release: unknown region {base:#x}")));
        };
        // SAFETY: allocated in `reserve` with exactly this layout.
        unsafe { alloc::dealloc(addr.as_ptr(), layout) };
        Ok(())
    }

    fn lock(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        self.check_region(addr, size)
    }

    fn open_backing_file(&self, path: &Path) -> Result<FileId> {
        self.check_io("open")?;
        self.files.lock().entry(path.to_path_buf()).or_default();
        let fd = FileId::new(self.next_fd.fetch_add(1, Ordering::Relaxed));
        self.open.lock().insert(fd, path.to_path_buf());
        Ok(fd)
    }

    fn close_file(&self, fd: FileId) -> Result<()> {
        self.open
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| Error::Platform(format!("close: bad file descriptor {fd}")))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn preallocate(&self, fd: FileId, offset: u64, len: u64) -> Result<()> {
        self.check_io("preallocate")?;
        let path = self.path_of(fd)?;
        let end = (offset + len) as usize;
        let mut files = self.files.lock();
        let bytes = files.entry(path).or_default();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        Ok(())
    }

    fn write_to_file(&self, fd: FileId, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_io("write")?;
        let path = self.path_of(fd)?;
        let start = offset as usize;
        let end = start + buf.len();
        let mut files = self.files.lock();
        let bytes = files.entry(path).or_default();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_from_file(&self, fd: FileId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_io("read")?;
        let path = self.path_of(fd)?;
        let files = self.files.lock();
        let bytes = files
            .get(&path)
            .ok_or_else(|| Error::Platform(format!("read: {} not found", path.display())))?;
        let start = (offset as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn resource_limit(&self, kind: ResourceKind) -> Result<ResourceLimit> {
        Ok(self
            .limits
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or(ResourceLimit::UNLIMITED))
    }

    fn set_resource_limit(&self, kind: ResourceKind, limit: ResourceLimit) -> Result<()> {
        let current = self.resource_limit(kind)?;
        let raises_hard = match (current.hard, limit.hard) {
            (Some(_), None) => true,
            (Some(old), Some(new)) => new > old,
            _ => false,
        };
        if raises_hard {
            return Err(Error::Platform(format!("setrlimit {kind}: permission denied")));
        }
        self.limits.lock().insert(kind, limit);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPlatform")
            .field("regions", &self.mapped_regions())
            .field("files", &self.file_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_decommit_release() {
        let platform = MemoryPlatform::new();
        let ptr = platform.reserve(2 * PAGE_SIZE, false).unwrap();
        platform.commit(ptr, 2 * PAGE_SIZE).unwrap();
        assert_eq!(platform.mapped_regions(), 1);
        assert_eq!(platform.mapped_bytes(), 2 * PAGE_SIZE);

        // SAFETY: the range was just reserved.
        unsafe { ptr.as_ptr().write(7) };
        platform.decommit(ptr, PAGE_SIZE).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0);

        assert!(platform.release(ptr, PAGE_SIZE).is_err());
        platform.release(ptr, 2 * PAGE_SIZE).unwrap();
        assert_eq!(platform.mapped_regions(), 0);
    }

    #[test]
    fn test_files_write_read_remove() {
        let platform = MemoryPlatform::new();
        let path = Path::new("/swap/chunk-1.bin");
        let fd = platform.open_backing_file(path).unwrap();
        platform.preallocate(fd, 0, 8).unwrap();
        platform.write_to_file(fd, 2, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(platform.read_from_file(fd, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"\0\0abc\0\0\0");
        assert_eq!(platform.read_from_file(fd, 6, &mut buf).unwrap(), 2);

        platform.close_file(fd).unwrap();
        assert!(platform.close_file(fd).is_err());
        platform.remove_file(path).unwrap();
        assert_eq!(platform.file_count(), 0);
    }

    #[test]
    fn test_injected_failures() {
        let platform = MemoryPlatform::new();
        platform.fail_reserve(true);
        assert!(platform.reserve(PAGE_SIZE, false).is_err());
        platform.fail_reserve(false);
        let ptr = platform.reserve(PAGE_SIZE, false).unwrap();
        platform.fail_decommit(true);
        assert!(platform.decommit(ptr, PAGE_SIZE).is_err());
        platform.release(ptr, PAGE_SIZE).unwrap();
        platform.fail_io(true);
        assert!(platform.open_backing_file(Path::new("/x")).is_err());
    }

    #[test]
    fn test_limits_cannot_raise_hard() {
        let platform = MemoryPlatform::new();
        let capped = ResourceLimit {
            soft: Some(10),
            hard: Some(20),
        };
        platform.set_limit(ResourceKind::MemLock, capped);
        let raised_soft = ResourceLimit {
            soft: Some(20),
            hard: Some(20),
        };
        platform
            .set_resource_limit(ResourceKind::MemLock, raised_soft)
            .unwrap();
        assert_eq!(
            platform.resource_limit(ResourceKind::MemLock).unwrap(),
            raised_soft
        );
        assert!(platform
            .set_resource_limit(ResourceKind::MemLock, ResourceLimit::UNLIMITED)
            .is_err());
    }
}
