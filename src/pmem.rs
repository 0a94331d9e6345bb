//! Persistence primitives for byte-addressable memory.
//!
//! The crash-consistency contract of the commit path is: data bytes are
//! flushed to the persistence domain, a store fence orders them before the
//! 8-byte commit store, and the commit store itself is a release store that
//! the hardware persists atomically. These helpers provide the flush and
//! fence halves.
//!
//! On x86_64 the flush is `clflush` per touched cache line followed by
//! `sfence`. On other targets (and under Miri) the image lives behind a
//! shared mapping whose durability is handled by msync at a coarser grain,
//! so the helpers degrade to compiler/CPU fences.

use crate::config::CACHELINE_SIZE;

/// Flushes every cache line spanning `[ptr, ptr + len)`.
///
/// # Safety
///
/// `ptr..ptr + len` must be a mapped readable range.
#[inline]
pub unsafe fn persist(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = ptr as usize & !(CACHELINE_SIZE - 1);
        let end = ptr as usize + len;
        let mut line = start;
        while line < end {
            core::arch::x86_64::_mm_clflush(line as *const u8);
            line += CACHELINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, len);
    }
}

/// Orders all prior stores before any subsequent store reaches persistence.
#[inline]
pub fn fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence has no memory-safety preconditions.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flushes `[ptr, ptr + len)` and fences. This is the barrier every commit
/// takes between writing payload bytes and publishing the tx entry.
///
/// # Safety
///
/// Same as [`persist`].
#[inline]
pub unsafe fn persist_fenced(ptr: *const u8, len: usize) {
    persist(ptr, len);
    fence();
}

/// Flushes the cache lines backing a sized value.
///
/// # Safety
///
/// `val` must point into the mapped image.
#[inline]
pub unsafe fn persist_obj<T>(val: &T) {
    persist(val as *const T as *const u8, std::mem::size_of::<T>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_covers_unaligned_ranges() {
        // only checks that the line walk touches valid memory
        let buf = vec![0u8; 4096];
        // SAFETY: buf is live for the duration of the call.
        unsafe {
            persist(buf.as_ptr().add(1), 130);
            persist_fenced(buf.as_ptr(), buf.len());
            persist_obj(&buf[17]);
        }
        fence();
    }
}
