//! # Per-File Shared Segment
//!
//! Every backing file gets one segment under `/dev/shm`, shared by all
//! processes that open the file. It carries two things the PMEM image
//! cannot: a DRAM mirror of the allocation bitmap and a fixed table of
//! per-thread liveness slots that garbage collection reads to find pinned
//! tx-log blocks.
//!
//! ```text
//! +----------------------+---------------------------------------+
//! | bitmap mirror        | PerThreadData x MAX_NUM_THREADS       |
//! | TOTAL_NUM_BITMAP_B   | 128 B each, cache-line isolated       |
//! +----------------------+---------------------------------------+
//! ```
//!
//! ## Liveness
//!
//! A slot records the owning pid next to its claim word. Another process
//! decides whether the owner is alive with `kill(pid, 0)`; a dead owner's
//! slot (and the tx-block pin inside) is reclaimable. This replaces robust
//! mutexes with a portable owner-death observation.
//!
//! ## Creation
//!
//! The segment is created as an anonymous tmpfile, fully initialized
//! (chmod/chown/fallocate), then `linkat`ed into `/dev/shm`, so a
//! half-initialized segment is never visible under its public name. Losing
//! the link race just means opening the winner's file. The path is recorded
//! in an xattr on the backing file and survives until the explicit destroy
//! API; close never unlinks because other processes may still map it.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{bail, ensure, Context, Result};
use memmap2::MmapMut;

use crate::config::{
    MAX_NUM_THREADS, SHM_PATH_LEN, SHM_PER_THREAD_SIZE, SHM_SIZE, TOTAL_NUM_BITMAP_BYTES,
};
use crate::idx::LogicalBlockIdx;

const XATTR_NAME: &CStr = c"user.ulayfs.shm_path";

/// One thread's liveness slot. `claimed` is the CAS claim word, `owner_pid`
/// makes owner death observable, `tx_block_idx` pins a tx-log block against
/// reclamation while the thread works.
#[repr(C, align(128))]
pub struct PerThreadData {
    claimed: AtomicU32,
    owner_pid: AtomicU32,
    tx_block_idx: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<PerThreadData>() == SHM_PER_THREAD_SIZE);

impl PerThreadData {
    pub fn is_initialized(&self) -> bool {
        self.claimed.load(Ordering::Acquire) != 0
    }

    /// Whether the recorded owner process still exists.
    pub fn owner_alive(&self) -> bool {
        let pid = self.owner_pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        // SAFETY: kill with signal 0 only checks for existence.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// Claims the slot for the calling process. Succeeds on a free slot or
    /// by taking over a dead owner's slot.
    pub fn try_claim(&self) -> bool {
        // SAFETY: getpid never fails.
        let me = unsafe { libc::getpid() } as u32;

        if self
            .claimed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tx_block_idx.store(0, Ordering::Relaxed);
            self.owner_pid.store(me, Ordering::Release);
            return true;
        }

        // claimed slot whose owner died: steal by swinging the pid
        let pid = self.owner_pid.load(Ordering::Acquire);
        if pid != 0 && !self.owner_alive() {
            if self
                .owner_pid
                .compare_exchange(pid, me, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::debug!("reclaimed shm slot from dead pid {}", pid);
                self.tx_block_idx.store(0, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    pub fn release(&self) {
        self.tx_block_idx.store(0, Ordering::Relaxed);
        self.owner_pid.store(0, Ordering::Relaxed);
        self.claimed.store(0, Ordering::Release);
    }

    pub fn tx_block_idx(&self) -> LogicalBlockIdx {
        LogicalBlockIdx(self.tx_block_idx.load(Ordering::Acquire))
    }

    /// Pins a tx-log block: the garbage collector will not reclaim it or
    /// anything after it while this thread is alive.
    pub fn set_tx_block_idx(&self, idx: LogicalBlockIdx) {
        self.tx_block_idx.store(idx.0, Ordering::Release);
    }
}

pub struct ShmMgr {
    map: MmapMut,
    _file: File,
    path: CString,
    created: bool,
}

// SAFETY: the mapping lives as long as the manager and all slot access goes
// through atomics.
unsafe impl Send for ShmMgr {}
unsafe impl Sync for ShmMgr {}

impl ShmMgr {
    /// Opens (or creates) the segment for the file behind `file_fd`,
    /// resolving the path through the xattr or minting it from the inode
    /// and ctime. `created()` reports whether this call created the
    /// segment, in which case the caller must rebuild the bitmap.
    pub fn open(file_fd: RawFd, stat: &libc::stat) -> Result<ShmMgr> {
        let path = Self::resolve_path(file_fd, stat)?;

        let mut created = false;
        // SAFETY: path is a valid nul-terminated string.
        let mut fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            fd = Self::create(&path, stat, &mut created)?;
        }
        // SAFETY: fd is a freshly opened descriptor we own.
        let file = unsafe { File::from_raw_fd(fd) };

        // SAFETY: the segment was fallocated to SHM_SIZE at creation; other
        // mappers only touch it through atomics.
        let map = unsafe {
            memmap2::MmapOptions::new()
                .len(SHM_SIZE)
                .map_mut(&file)
                .wrap_err("failed to map shared segment")?
        };

        log::debug!(
            "shm segment {} ({})",
            path.to_string_lossy(),
            if created { "created" } else { "attached" }
        );
        Ok(ShmMgr {
            map,
            _file: file,
            path,
            created,
        })
    }

    /// Whether this process created the segment (first mount).
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &CStr {
        &self.path
    }

    /// The bitmap mirror words at the head of the segment.
    pub fn bitmap_mirror(&self) -> &[AtomicU64] {
        // SAFETY: the mirror area is within the mapping, atomics are valid
        // for any bit pattern, and the base is page aligned.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().cast::<AtomicU64>(),
                TOTAL_NUM_BITMAP_BYTES / 8,
            )
        }
    }

    /// The per-thread slot table following the mirror.
    pub fn per_thread(&self, idx: usize) -> &PerThreadData {
        assert!(idx < MAX_NUM_THREADS);
        // SAFETY: the slot area is within the mapping and PerThreadData is
        // valid for any bit pattern.
        unsafe {
            &*self
                .map
                .as_ptr()
                .add(TOTAL_NUM_BITMAP_BYTES + idx * SHM_PER_THREAD_SIZE)
                .cast::<PerThreadData>()
        }
    }

    /// Claims a free (or dead-owner) slot for the calling thread.
    /// Panics if all slots are taken by live owners; the table is a fixed
    /// resource and running out is unrecoverable.
    pub fn alloc_per_thread_data(&self) -> usize {
        for idx in 0..MAX_NUM_THREADS {
            if self.per_thread(idx).try_claim() {
                return idx;
            }
        }
        panic!("no free per-thread slot in shared segment");
    }

    /// Unlinks this segment's public name. Destroy API only; attached
    /// mappings stay valid.
    pub fn unlink(&self) {
        Self::unlink_by_shm_path(&self.path);
    }

    pub fn unlink_by_shm_path(path: &CStr) {
        // SAFETY: path is a valid nul-terminated string.
        let rc = unsafe { libc::unlink(path.as_ptr()) };
        if rc < 0 {
            log::warn!(
                "could not unlink shm file {}: {}",
                path.to_string_lossy(),
                std::io::Error::last_os_error()
            );
        }
    }

    /// Resolves the segment of a backing file by path and unlinks it.
    pub fn unlink_by_file_path(filepath: &Path) -> Result<()> {
        let file = File::open(filepath)
            .wrap_err_with(|| format!("failed to open '{}'", filepath.display()))?;
        let mut buf = [0u8; SHM_PATH_LEN];
        // SAFETY: buf outlives the call and its length is passed.
        let rc = unsafe {
            libc::fgetxattr(
                file.as_raw_fd(),
                XATTR_NAME.as_ptr(),
                buf.as_mut_ptr().cast(),
                SHM_PATH_LEN,
            )
        };
        if rc <= 0 {
            return Ok(());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let path = CString::new(&buf[..end]).expect("no interior nul");
        Self::unlink_by_shm_path(&path);
        Ok(())
    }

    fn resolve_path(file_fd: RawFd, stat: &libc::stat) -> Result<CString> {
        let mut buf = [0u8; SHM_PATH_LEN];
        // SAFETY: buf outlives the call and its length is passed.
        let rc = unsafe {
            libc::fgetxattr(
                file_fd,
                XATTR_NAME.as_ptr(),
                buf.as_mut_ptr().cast(),
                SHM_PATH_LEN,
            )
        };
        if rc > 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            return CString::new(&buf[..end]).wrap_err("corrupt shm path xattr");
        }

        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            ensure!(
                errno == libc::ENODATA || errno == libc::EOPNOTSUPP,
                "failed to read shm path attribute: errno {}",
                errno
            );
        }

        let ctime = (stat.st_ctime as u64)
            .wrapping_mul(1_000_000_000)
            .wrapping_add(stat.st_ctime_nsec as u64)
            >> 3;
        let path = format!("/dev/shm/ulayfs_{:016x}_{:013x}", stat.st_ino, ctime);
        let path = CString::new(path).expect("no interior nul");

        // best effort: without xattr support the path is still derivable
        // from inode and ctime by every process
        // SAFETY: path and value are valid for the given lengths.
        let rc = unsafe {
            libc::fsetxattr(
                file_fd,
                XATTR_NAME.as_ptr(),
                path.as_ptr().cast(),
                path.as_bytes_with_nul().len(),
                0,
            )
        };
        if rc < 0 {
            log::warn!(
                "cannot record shm path on backing file: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(path)
    }

    /// Creates the segment without ever exposing a half-initialized file:
    /// anonymous tmpfile, permissions, size, then linkat into /dev/shm.
    fn create(path: &CStr, stat: &libc::stat, created: &mut bool) -> Result<RawFd> {
        // SAFETY: string literal is nul-terminated.
        let fd = unsafe {
            libc::open(
                c"/dev/shm".as_ptr(),
                libc::O_TMPFILE | libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
                libc::S_IRUSR | libc::S_IWUSR,
            )
        };
        if fd < 0 {
            bail!(
                "failed to create shm tmpfile: {}",
                std::io::Error::last_os_error()
            );
        }

        // SAFETY: fd is a valid open descriptor.
        unsafe {
            if libc::fchmod(fd, stat.st_mode & 0o666) < 0 {
                let e = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("fchmod on shared segment failed: {}", e);
            }
            if libc::fchown(fd, stat.st_uid, stat.st_gid) < 0 {
                log::warn!(
                    "fchown on shared segment failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            if libc::fallocate(fd, 0, 0, SHM_SIZE as libc::off_t) < 0 {
                let e = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("fallocate on shared segment failed: {}", e);
            }
        }

        let proc_path = CString::new(format!("/proc/self/fd/{}", fd)).expect("no interior nul");
        // SAFETY: both paths are valid nul-terminated strings.
        let rc = unsafe {
            libc::linkat(
                libc::AT_FDCWD,
                proc_path.as_ptr(),
                libc::AT_FDCWD,
                path.as_ptr(),
                libc::AT_SYMLINK_FOLLOW,
            )
        };
        if rc == 0 {
            *created = true;
            return Ok(fd);
        }

        // another process linked its segment first; use the winner's
        // SAFETY: fd is ours to close; path is valid.
        let reopened = unsafe {
            libc::close(fd);
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        ensure!(
            reopened >= 0,
            "cannot open or create shared segment {}: {}",
            path.to_string_lossy(),
            std::io::Error::last_os_error()
        );
        Ok(reopened)
    }
}
