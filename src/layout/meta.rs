//! Meta block: logical block 0 of every image.
//!
//! The first cache line holds identification and the mutable anchors; the
//! next three cache lines are the inline bitmap (1536 blocks); the remaining
//! sixty are the inline tx-entry region that seeds the tx-log ring.
//!
//! `file_size` here is only a lower-bound hint; the authoritative size comes
//! from replaying the tx log. `log_head` is published once, by the first
//! thread that overflows the inline tx region.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result};

use crate::config::{
    BLOCK_SIZE, FILE_MAGIC, FORMAT_VERSION, NUM_INLINE_BITMAP_WORDS, NUM_INLINE_TX_ENTRIES,
};
use crate::idx::LogicalBlockIdx;
use crate::pmem;

#[repr(C, align(4096))]
pub struct MetaBlock {
    magic: [u8; 4],
    version: u32,

    // lower-bound hint; authoritative size comes from tx replay
    file_size: AtomicU64,

    // per-file spinlock word, shared across processes via the mapping
    lock: AtomicU32,

    num_bitmap_blocks: u32,

    // first tx-log block once the inline region overflows; 0 = not yet
    log_head: AtomicU32,

    // hint to find the log tail; not necessarily up to date
    log_tail_hint: AtomicU32,

    _pad: [u8; 32],

    inline_bitmap: [AtomicU64; NUM_INLINE_BITMAP_WORDS],

    inline_tx_entries: [AtomicU64; NUM_INLINE_TX_ENTRIES],
}

const _: () = assert!(std::mem::size_of::<MetaBlock>() == BLOCK_SIZE);

impl MetaBlock {
    /// Initializes a fresh meta block in place and persists it.
    ///
    /// # Safety
    ///
    /// `this` must point to a zeroed, writable, block-aligned 4 KiB region
    /// that no other thread accesses during the call.
    pub unsafe fn format(this: *mut MetaBlock, num_bitmap_blocks: u32) {
        std::ptr::write_bytes(this.cast::<u8>(), 0, BLOCK_SIZE);
        (*this).magic = FILE_MAGIC;
        (*this).version = FORMAT_VERSION;
        (*this).num_bitmap_blocks = num_bitmap_blocks;
        pmem::persist_fenced(this.cast::<u8>(), BLOCK_SIZE);
    }

    /// Validates magic and version of an existing image.
    pub fn verify(&self) -> Result<()> {
        ensure!(self.magic == FILE_MAGIC, "not a ulayfs image (bad magic)");
        ensure!(
            self.version == FORMAT_VERSION,
            "unsupported image version: {} (expected {})",
            self.version,
            FORMAT_VERSION
        );
        Ok(())
    }

    pub fn num_bitmap_blocks(&self) -> u32 {
        self.num_bitmap_blocks
    }

    pub fn file_size_hint(&self) -> u64 {
        self.file_size.load(Ordering::Relaxed)
    }

    /// Advances the persisted size hint; never moves it backwards.
    pub fn update_file_size_hint(&self, size: u64) {
        let mut cur = self.file_size.load(Ordering::Relaxed);
        while cur < size {
            match self.file_size.compare_exchange_weak(
                cur,
                size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: the hint lives inside the mapped meta block.
                    unsafe { pmem::persist_obj(&self.file_size) };
                    return;
                }
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn log_head(&self) -> LogicalBlockIdx {
        LogicalBlockIdx(self.log_head.load(Ordering::Acquire))
    }

    /// Publishes the first tx-log block. Returns the winner, which is `idx`
    /// on success or the previously published head if another thread won.
    pub fn publish_log_head(&self, idx: LogicalBlockIdx) -> LogicalBlockIdx {
        match self
            .log_head
            .compare_exchange(0, idx.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: the link lives inside the mapped meta block.
                unsafe { pmem::persist_obj(&self.log_head) };
                idx
            }
            Err(winner) => LogicalBlockIdx(winner),
        }
    }

    pub fn log_tail_hint(&self) -> LogicalBlockIdx {
        LogicalBlockIdx(self.log_tail_hint.load(Ordering::Relaxed))
    }

    pub fn update_log_tail_hint(&self, idx: LogicalBlockIdx) {
        self.log_tail_hint.store(idx.0, Ordering::Relaxed);
    }

    pub fn inline_bitmap_words(&self) -> &[AtomicU64] {
        &self.inline_bitmap
    }

    pub fn inline_tx_slots(&self) -> &[AtomicU64] {
        &self.inline_tx_entries
    }

    /// Acquires the per-file spinlock. The guard releases on drop.
    pub fn lock(&self) -> MetaLockGuard<'_> {
        let mut spins = 0u32;
        loop {
            if self
                .lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return MetaLockGuard { meta: self };
            }
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// RAII guard for the per-file spinlock in the meta block.
pub struct MetaLockGuard<'a> {
    meta: &'a MetaBlock,
}

impl Drop for MetaLockGuard<'_> {
    fn drop(&mut self) {
        self.meta.lock.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_meta() -> Box<MetaBlock> {
        // SAFETY: MetaBlock is valid in the all-zero state.
        let mut b: Box<MetaBlock> = unsafe { Box::new_zeroed().assume_init() };
        // SAFETY: exclusive access to a zeroed block-sized region.
        unsafe { MetaBlock::format(&mut *b, 8) };
        b
    }

    #[test]
    fn format_writes_identification() {
        let meta = fresh_meta();
        meta.verify().unwrap();
        assert_eq!(meta.num_bitmap_blocks(), 8);
        assert_eq!(meta.file_size_hint(), 0);
        assert!(meta.log_head().is_none());
    }

    #[test]
    fn verify_rejects_garbage() {
        // SAFETY: MetaBlock is valid in the all-zero state.
        let meta: Box<MetaBlock> = unsafe { Box::new_zeroed().assume_init() };
        assert!(meta.verify().is_err());
    }

    #[test]
    fn size_hint_is_monotonic() {
        let meta = fresh_meta();
        meta.update_file_size_hint(100);
        meta.update_file_size_hint(50);
        assert_eq!(meta.file_size_hint(), 100);
        meta.update_file_size_hint(200);
        assert_eq!(meta.file_size_hint(), 200);
    }

    #[test]
    fn log_head_publication_is_once() {
        let meta = fresh_meta();
        assert_eq!(meta.publish_log_head(LogicalBlockIdx(42)), LogicalBlockIdx(42));
        assert_eq!(meta.publish_log_head(LogicalBlockIdx(99)), LogicalBlockIdx(42));
        assert_eq!(meta.log_head(), LogicalBlockIdx(42));
    }

    #[test]
    fn spinlock_excludes() {
        let meta = fresh_meta();
        let g = meta.lock();
        drop(g);
        let _g2 = meta.lock();
    }

    #[test]
    fn tail_hint_is_best_effort() {
        let meta = fresh_meta();
        assert!(meta.log_tail_hint().is_none());
        meta.update_log_tail_hint(LogicalBlockIdx(33));
        assert_eq!(meta.log_tail_hint(), LogicalBlockIdx(33));
    }
}
