//! Unix platform: virtual memory via `mmap` and friends, backing files via
//! positioned reads and writes, resource limits via `getrlimit`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use offheap_core::id::FileId;
use offheap_core::{Error, Platform, ResourceKind, ResourceLimit, Result};

fn os_err(op: &str) -> Error {
    Error::Platform(format!("{op}: {}", io::Error::last_os_error()))
}

fn io_err(op: &str, e: io::Error) -> Error {
    Error::Platform(format!("{op}: {e}"))
}

const DEFAULT_HUGE_PAGE: usize = 2 * 1024 * 1024;

pub struct OsPlatform {
    page_size: usize,
    huge_page_size: usize,
    files: Mutex<HashMap<FileId, File>>,
    next_fd: AtomicU64,
}

impl OsPlatform {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page > 0 { page as usize } else { 4096 };
        Self {
            page_size,
            huge_page_size: huge_page_size().unwrap_or(DEFAULT_HUGE_PAGE).max(page_size),
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
        }
    }

    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }

    fn with_file<R>(&self, fd: FileId, op: &str, f: impl FnOnce(&File) -> io::Result<R>) -> Result<R> {
        let files = self.files.lock();
        let file = files
            .get(&fd)
            .ok_or_else(|| Error::Platform(format!("{op}: unknown {fd}")))?;
        f(file).map_err(|e| io_err(op, e))
    }

    fn mmap(size: usize, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping with a null hint; no existing
        // memory is affected.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | extra_flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast())
    }
}

/// `Hugepagesize` from `/proc/meminfo`.
#[cfg(target_os = "linux")]
fn huge_page_size() -> Option<usize> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("Hugepagesize:"))?;
    let kb: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn huge_page_size() -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn fallocate(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and open.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), offset as libc::off_t, len as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn fallocate(file: &File, offset: u64, len: u64) -> io::Result<()> {
    let end = offset + len;
    if file.metadata()?.len() < end {
        file.set_len(end)?;
    }
    Ok(())
}

impl Default for OsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for OsPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn huge_page_size(&self) -> usize {
        self.huge_page_size
    }

    fn reserve(&self, size: usize, huge_pages: bool) -> Result<NonNull<u8>> {
        #[cfg(target_os = "linux")]
        if huge_pages {
            // hugetlb mappings are unmapped in whole huge pages; any other
            // length would outlive `release`.
            if size % self.huge_page_size == 0 {
                if let Some(ptr) = Self::mmap(size, libc::MAP_HUGETLB) {
                    return Ok(ptr);
                }
            }
            tracing::debug!(size, "MAP_HUGETLB unavailable, falling back to THP");
            let ptr = Self::mmap(size, 0).ok_or_else(|| os_err("mmap"))?;
            // SAFETY: `ptr` is a fresh mapping of `size` bytes.
            if unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_HUGEPAGE) } != 0 {
                tracing::debug!(error = %io::Error::last_os_error(), "MADV_HUGEPAGE refused");
            }
            return Ok(ptr);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = huge_pages;
        Self::mmap(size, 0).ok_or_else(|| os_err("mmap"))
    }

    fn commit(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: the range was returned by `reserve`.
        let rc = unsafe {
            libc::mprotect(addr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE)
        };
        if rc != 0 {
            return Err(os_err("mprotect"));
        }
        Ok(())
    }

    fn decommit(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: the range lies inside a committed mapping.
        let rc = unsafe { libc::madvise(addr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(os_err("madvise"));
        }
        Ok(())
    }

    fn release(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: `addr`/`size` describe a whole reservation.
        let rc = unsafe { libc::munmap(addr.as_ptr().cast(), size) };
        if rc != 0 {
            return Err(os_err("munmap"));
        }
        Ok(())
    }

    fn lock(&self, addr: NonNull<u8>, size: usize) -> Result<()> {
        // SAFETY: the range lies inside a committed mapping.
        let rc = unsafe { libc::mlock(addr.as_ptr().cast(), size) };
        if rc != 0 {
            return Err(os_err("mlock"));
        }
        Ok(())
    }

    fn open_backing_file(&self, path: &Path) -> Result<FileId> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("mkparent", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err("open", e))?;
        let fd = FileId::new(self.next_fd.fetch_add(1, Ordering::Relaxed));
        self.files.lock().insert(fd, file);
        Ok(fd)
    }

    fn close_file(&self, fd: FileId) -> Result<()> {
        // Dropping the `File` closes it.
        self.files
            .lock()
            .remove(&fd)
            .map(drop)
            .ok_or_else(|| Error::Platform(format!("close: unknown {fd}")))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", e)),
        }
    }

    fn preallocate(&self, fd: FileId, offset: u64, len: u64) -> Result<()> {
        self.with_file(fd, "preallocate", |file| fallocate(file, offset, len))
    }

    fn write_to_file(&self, fd: FileId, offset: u64, buf: &[u8]) -> Result<()> {
        self.with_file(fd, "pwrite", |file| file.write_all_at(buf, offset))
    }

    fn read_from_file(&self, fd: FileId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.with_file(fd, "pread", |file| {
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(filled)
        })
    }

    fn resource_limit(&self, kind: ResourceKind) -> Result<ResourceLimit> {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `rl` is a valid out-pointer.
        let rc = unsafe {
            match kind {
                ResourceKind::Data => libc::getrlimit(libc::RLIMIT_DATA, &mut rl),
                ResourceKind::AddressSpace => libc::getrlimit(libc::RLIMIT_AS, &mut rl),
                ResourceKind::MemLock => libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rl),
            }
        };
        if rc != 0 {
            return Err(os_err("getrlimit"));
        }
        let to_limit = |v: libc::rlim_t| (v != libc::RLIM_INFINITY).then_some(v as u64);
        Ok(ResourceLimit {
            soft: to_limit(rl.rlim_cur),
            hard: to_limit(rl.rlim_max),
        })
    }

    fn set_resource_limit(&self, kind: ResourceKind, limit: ResourceLimit) -> Result<()> {
        let from_limit = |v: Option<u64>| v.map_or(libc::RLIM_INFINITY, |v| v as libc::rlim_t);
        let rl = libc::rlimit {
            rlim_cur: from_limit(limit.soft),
            rlim_max: from_limit(limit.hard),
        };
        // SAFETY: `rl` is a valid in-pointer.
        let rc = unsafe {
            match kind {
                ResourceKind::Data => libc::setrlimit(libc::RLIMIT_DATA, &rl),
                ResourceKind::AddressSpace => libc::setrlimit(libc::RLIMIT_AS, &rl),
                ResourceKind::MemLock => libc::setrlimit(libc::RLIMIT_MEMLOCK, &rl),
            }
        };
        if rc != 0 {
            return Err(os_err("setrlimit"));
        }
        tracing::debug!(%kind, soft = ?limit.soft, hard = ?limit.hard, "resource limit set");
        Ok(())
    }
}

impl std::fmt::Debug for OsPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsPlatform")
            .field("page_size", &self.page_size)
            .field("huge_page_size", &self.huge_page_size)
            .field("open_files", &self.open_files())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("offheap-io-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_reserve_commit_decommit_release() {
        let platform = OsPlatform::new();
        let page = platform.page_size();
        let size = 4 * page;
        let ptr = platform.reserve(size, false).unwrap();
        platform.commit(ptr, size).unwrap();
        // SAFETY: the range is committed read/write.
        unsafe { ptr.as_ptr().add(page).write(42) };
        platform.decommit(NonNull::new(unsafe { ptr.as_ptr().add(page) }).unwrap(), page).unwrap();
        // Private anonymous pages read back as zero after MADV_DONTNEED.
        #[cfg(target_os = "linux")]
        assert_eq!(unsafe { ptr.as_ptr().add(page).read() }, 0);
        platform.release(ptr, size).unwrap();
    }

    #[test]
    fn test_huge_page_request_of_odd_size_releases_cleanly() {
        let platform = OsPlatform::new();
        let page = platform.page_size();
        assert!(platform.huge_page_size() >= page);
        assert_eq!(platform.huge_page_size() % page, 0);
        // Not a huge-page multiple: must come back as a plain mapping that
        // `release` with the same length fully unmaps.
        let ptr = platform.reserve(page, true).unwrap();
        platform.commit(ptr, page).unwrap();
        platform.release(ptr, page).unwrap();
    }

    #[test]
    fn test_backing_file_roundtrip() {
        let platform = OsPlatform::new();
        let dir = temp_dir("file");
        let path = dir.join("nested").join("chunk-1.bin");
        let fd = platform.open_backing_file(&path).unwrap();
        platform.preallocate(fd, 0, 16).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 16);

        platform.write_to_file(fd, 4, b"data").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(platform.read_from_file(fd, 0, &mut buf).unwrap(), 16);
        assert_eq!(&buf[4..8], b"data");

        platform.close_file(fd).unwrap();
        platform.remove_file(&path).unwrap();
        platform.remove_file(&path).unwrap();
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resource_limits_readable() {
        let platform = OsPlatform::new();
        for kind in [ResourceKind::Data, ResourceKind::AddressSpace, ResourceKind::MemLock] {
            let limit = platform.resource_limit(kind).unwrap();
            if let (Some(soft), Some(hard)) = (limit.soft, limit.hard) {
                assert!(soft <= hard);
            }
            // Re-applying the current limit is always permitted.
            platform.set_resource_limit(kind, limit).unwrap();
        }
    }
}
