//! Consumer-side references: handles, backing files, and chunk headers.
//!
//! ```text
//! Chunk (Arc<ChunkHeader>)            stable for the chunk's lifetime
//!   ├─→ BackingFile                   stable: path + lazily opened fd
//!   └─→ RwLock<Arc<ConsumerHandle>>   replaced on every relocation
//!          ├─→ address, slot
//!          ├─→ owner: Arc<Superblock>
//!          └─→ active / dirty flags
//! ```
//!
//! A handle is never repointed. Relocation installs a fresh handle and the old
//! one stays inactive forever, so anything still holding it will fail its
//! next validity check and re-read the header.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use offheap_core::id::{ChunkId, FileId, SlabId};
use offheap_core::Platform;

use crate::error::{Error, Result};
use crate::superblock::Superblock;

/// Plain-data view of a handle at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleState {
    pub address: usize,
    pub active: bool,
    pub dirty: bool,
}

pub struct ConsumerHandle {
    address: usize,
    slot: usize,
    owner: Arc<Superblock>,
    backing: Arc<BackingFile>,
    active: AtomicBool,
    dirty: AtomicBool,
}

impl ConsumerHandle {
    pub(crate) fn new(
        address: usize,
        slot: usize,
        owner: Arc<Superblock>,
        backing: Arc<BackingFile>,
    ) -> Self {
        Self {
            address,
            slot,
            owner,
            backing,
            active: AtomicBool::new(true),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn owner(&self) -> &Arc<Superblock> {
        &self.owner
    }

    pub fn owner_id(&self) -> SlabId {
        self.owner.id()
    }

    pub(crate) fn backing(&self) -> &Arc<BackingFile> {
        &self.backing
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HandleState {
        HandleState {
            address: self.address,
            active: self.is_active(),
            dirty: self.is_dirty(),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("address", &format_args!("{:#x}", self.address))
            .field("owner", &self.owner.id())
            .field("active", &self.is_active())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Per-chunk backing file.
///
/// Layout: a byte-for-byte image of the chunk's slot at offset 0, no header.
/// The file is opened (and preallocated) on first flush. The digest of the
/// last flushed image stays in memory and is checked on reload.
pub struct BackingFile {
    path: PathBuf,
    len: usize,
    fd: OnceCell<FileId>,
    digest: Mutex<Option<blake3::Hash>>,
}

impl BackingFile {
    pub(crate) fn new(path: PathBuf, len: usize) -> Self {
        Self {
            path,
            len,
            fd: OnceCell::new(),
            digest: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a flushed image exists to reload from.
    pub fn has_image(&self) -> bool {
        self.digest.lock().is_some()
    }

    fn fd(&self, platform: &dyn Platform) -> Result<FileId> {
        self.fd
            .get_or_try_init(|| {
                let fd = platform.open_backing_file(&self.path)?;
                if let Err(e) = platform.preallocate(fd, 0, self.len as u64) {
                    let _ = platform.close_file(fd);
                    return Err(e);
                }
                Ok(fd)
            })
            .copied()
            .map_err(|e| Error::Backing(format!("open {}: {e}", self.path.display())))
    }

    /// Write `bytes` as the new image.
    pub(crate) fn flush(&self, platform: &dyn Platform, bytes: &[u8]) -> Result<()> {
        let fd = self.fd(platform)?;
        platform
            .write_to_file(fd, 0, bytes)
            .map_err(|e| Error::Backing(format!("flush {}: {e}", self.path.display())))?;
        *self.digest.lock() = Some(blake3::hash(bytes));
        Ok(())
    }

    /// Read the last image into `buf`. `Ok(false)` if nothing was ever flushed.
    pub(crate) fn load(&self, platform: &dyn Platform, buf: &mut [u8]) -> Result<bool> {
        let Some(expected) = *self.digest.lock() else {
            return Ok(false);
        };
        let fd = self.fd(platform)?;
        let n = platform
            .read_from_file(fd, 0, buf)
            .map_err(|e| Error::Backing(format!("reload {}: {e}", self.path.display())))?;
        if n != buf.len() {
            return Err(Error::Backing(format!(
                "reload {}: short read {n} of {}",
                self.path.display(),
                buf.len()
            )));
        }
        if blake3::hash(buf) != expected {
            return Err(Error::ChecksumMismatch(self.path.display().to_string()));
        }
        Ok(true)
    }

    /// Close and delete the file, if it was ever opened.
    pub(crate) fn discard(&self, platform: &dyn Platform) -> Result<()> {
        if let Some(fd) = self.fd.get() {
            platform.close_file(*fd)?;
            platform.remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("open", &self.fd.get().is_some())
            .finish()
    }
}

/// One logical column chunk.
pub struct ChunkHeader {
    id: ChunkId,
    size: usize,
    element_size: usize,
    backing: Arc<BackingFile>,
    handle: RwLock<Arc<ConsumerHandle>>,
    freed: AtomicBool,
}

/// What consumers hold.
pub type Chunk = Arc<ChunkHeader>;

impl ChunkHeader {
    pub(crate) fn new(
        id: ChunkId,
        size: usize,
        element_size: usize,
        backing: Arc<BackingFile>,
        handle: Arc<ConsumerHandle>,
    ) -> Self {
        Self {
            id,
            size,
            element_size,
            backing,
            handle: RwLock::new(handle),
            freed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size-class element size (the requested size rounded up).
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The current handle. It may already be stale by the time it is used.
    pub fn handle(&self) -> Arc<ConsumerHandle> {
        Arc::clone(&self.handle.read())
    }

    pub fn backing(&self) -> &Arc<BackingFile> {
        &self.backing
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Set once the slot has gone back to its pool. Callers hold the
    /// handle lock.
    pub(crate) fn mark_freed(&self) {
        self.freed.store(true, Ordering::Release);
    }

    /// Exclusive access to the handle slot, serializing relocation and free.
    pub(crate) fn lock_handle(&self) -> RwLockWriteGuard<'_, Arc<ConsumerHandle>> {
        self.handle.write()
    }
}

impl std::fmt::Debug for ChunkHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHeader")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("handle", &*self.handle.read())
            .field("freed", &self.is_freed())
            .finish()
    }
}
