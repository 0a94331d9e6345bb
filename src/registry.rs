//! # Handle Table
//!
//! Process-wide table mapping OS file descriptors to managed [`File`]s,
//! consumed by the interposition layer. The kernel recycles descriptor
//! numbers, so each slot carries a generation counter: a [`Handle`] taken
//! before a close does not resolve against a slot reopened under the same
//! fd, which closes the use-after-close hazard of a bare fd key.
//!
//! Lookups that miss are not errors: they are the dispatch signal telling
//! the caller the fd is not ours and the kernel implementation should run.

use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{Context, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::OpResult;
use crate::file::{File, OpenOutcome};
use crate::shm::ShmMgr;

/// A managed-file handle: the fd plus the generation that guards reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub fd: RawFd,
    gen: u64,
}

struct Slot {
    file: Arc<File>,
    gen: u64,
}

/// Result of routing an `open` through the library.
pub enum Opened {
    /// The file is managed; operations on the fd go through the engine.
    Managed(Handle),
    /// Not our file; the caller should use the kernel's fd as-is.
    Passthrough(RawFd),
}

pub struct Registry {
    files: RwLock<HashMap<RawFd, Slot>>,
    next_gen: AtomicU64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            files: RwLock::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
        }
    }

    /// Opens `path` and attempts to manage it. The returned fd is a real
    /// OS descriptor in both outcomes.
    pub fn open(&self, path: &Path, flags: i32, mode: u32) -> Result<Opened> {
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .wrap_err("path contains an interior nul")?;
        // SAFETY: cpath is a valid nul-terminated string.
        let fd = unsafe { libc::open(cpath.as_ptr(), flags, mode as libc::mode_t) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error())
                .wrap_err_with(|| format!("open('{}') failed", path.display()));
        }

        // the engine needs its own read-write descriptor for the mapping
        // SAFETY: cpath is a valid nul-terminated string.
        let rw = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if rw < 0 {
            log::debug!("cannot reopen '{}' read-write; passthrough", path.display());
            return Ok(Opened::Passthrough(fd));
        }
        // SAFETY: rw is a freshly opened descriptor we own.
        let backing = unsafe { std::fs::File::from_raw_fd(rw) };

        match File::open(backing, flags)? {
            OpenOutcome::Managed(file) => {
                let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
                self.files.write().insert(
                    fd,
                    Slot {
                        file: Arc::new(file),
                        gen,
                    },
                );
                log::info!("managed open('{}') = {}", path.display(), fd);
                Ok(Opened::Managed(Handle { fd, gen }))
            }
            OpenOutcome::NotManaged => {
                log::debug!("passthrough open('{}') = {}", path.display(), fd);
                Ok(Opened::Passthrough(fd))
            }
        }
    }

    /// Closes a descriptor. Returns whether it was managed. The engine
    /// state is torn down (allocator lists returned, liveness slots
    /// released); the shared segment stays for other users.
    pub fn close(&self, fd: RawFd) -> bool {
        let slot = self.files.write().remove(&fd);
        // SAFETY: fd came from open and is closed exactly once here.
        unsafe { libc::close(fd) };
        slot.is_some()
    }

    /// The managed file behind an fd, or `None` as the passthrough signal.
    pub fn get(&self, fd: RawFd) -> Option<Arc<File>> {
        self.files.read().get(&fd).map(|s| Arc::clone(&s.file))
    }

    /// Like [`get`](Registry::get) but refuses a recycled descriptor.
    pub fn get_by_handle(&self, handle: Handle) -> Option<Arc<File>> {
        let files = self.files.read();
        let slot = files.get(&handle.fd)?;
        (slot.gen == handle.gen).then(|| Arc::clone(&slot.file))
    }

    // ------------------------------------------------------------------
    // fd-keyed POSIX surface; None = not managed, fall through
    // ------------------------------------------------------------------

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Option<OpResult<usize>> {
        self.get(fd).map(|f| f.read(buf))
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> Option<OpResult<usize>> {
        self.get(fd).map(|f| f.write(buf))
    }

    pub fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Option<OpResult<usize>> {
        self.get(fd).map(|f| f.pread(buf, offset))
    }

    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> Option<OpResult<usize>> {
        self.get(fd).map(|f| f.pwrite(buf, offset))
    }

    pub fn lseek(&self, fd: RawFd, offset: i64, whence: i32) -> Option<OpResult<u64>> {
        self.get(fd).map(|f| f.lseek(offset, whence))
    }

    pub fn fstat(&self, fd: RawFd, st: &mut libc::stat) -> Option<()> {
        self.get(fd).map(|f| f.fstat(st))
    }

    /// Tears down every managed file. Shutdown API for the hosting shim.
    pub fn shutdown(&self) {
        let drained: Vec<Slot> = self.files.write().drain().map(|(_, s)| s).collect();
        log::debug!("shutdown: releasing {} managed files", drained.len());
        drop(drained);
    }

    /// Destroys the shared segment recorded on a backing file. Explicit
    /// API: close never unlinks because other processes may still map it.
    pub fn destroy(path: &Path) -> Result<()> {
        ShmMgr::unlink_by_file_path(path)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
