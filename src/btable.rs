//! # Block Table
//!
//! Per-file DRAM shadow of the virtual→logical mapping, built by replaying
//! the tx log. `get` is lock-free; `update` must run under the file's meta
//! lock and consumes committed entries from the published tail forward.
//! Replay is idempotent (applying the same entry twice writes the same
//! values), which is what makes remount, crash-prefix recovery and the
//! duplicate commits of strict offset ordering all safe.
//!
//! ## Storage
//!
//! A segmented vector: fixed array of segment pointers, segments allocated
//! on demand and CAS-published, entries atomic u32s. Growth never moves an
//! existing entry, so concurrent `get`s stay valid while `update` extends
//! the table: the concurrent-vector contract.
//!
//! ## Published Tail
//!
//! Three atomics (packed tail entry index, tail block pointer, file size)
//! are read with the double-read/fence protocol in [`BlkTable::need_update`]
//! so readers can use a consistent (possibly stale) snapshot without taking
//! the lock.

use std::sync::atomic::{fence, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::alloc::BitmapView;
use crate::config::{
    BLK_TABLE_NUM_SEGMENTS, BLK_TABLE_SEGMENT_SHIFT, BLK_TABLE_SEGMENT_SIZE, BLOCK_SHIFT,
};
use crate::idx::{LogicalBlockIdx, TxEntryIdx, VirtualBlockIdx};
use crate::layout::{RedoLogBlock, TxLogBlock};
use crate::mtable::MemTable;
use crate::tx::{TxCursor, TxEntry, TxMgr};

struct Segment([AtomicU32; BLK_TABLE_SEGMENT_SIZE]);

pub struct BlkTable {
    segments: [AtomicPtr<Segment>; BLK_TABLE_NUM_SEGMENTS],

    // published replay frontier; see need_update for the read protocol
    tail_tx_idx: AtomicU64,
    tail_tx_block: AtomicPtr<TxLogBlock>,
    file_size: AtomicU64,
}

// SAFETY: segment pointers are only published once and freed in drop; the
// tail block pointer references the live mapping owned by the same file.
unsafe impl Send for BlkTable {}
unsafe impl Sync for BlkTable {}

impl BlkTable {
    pub fn new() -> BlkTable {
        BlkTable {
            segments: [const { AtomicPtr::new(std::ptr::null_mut()) }; BLK_TABLE_NUM_SEGMENTS],
            tail_tx_idx: AtomicU64::new(TxEntryIdx::default().pack()),
            tail_tx_block: AtomicPtr::new(std::ptr::null_mut()),
            file_size: AtomicU64::new(0),
        }
    }

    /// Logical block backing a virtual block; `NONE` (0) if unallocated.
    pub fn get(&self, vblk: VirtualBlockIdx) -> LogicalBlockIdx {
        let seg_idx = (vblk.0 as usize) >> BLK_TABLE_SEGMENT_SHIFT;
        if seg_idx >= BLK_TABLE_NUM_SEGMENTS {
            return LogicalBlockIdx::NONE;
        }
        let seg = self.segments[seg_idx].load(Ordering::Acquire);
        if seg.is_null() {
            return LogicalBlockIdx::NONE;
        }
        // SAFETY: published segments are live until drop.
        let slot = unsafe { &(*seg).0[(vblk.0 as usize) & (BLK_TABLE_SEGMENT_SIZE - 1)] };
        LogicalBlockIdx(slot.load(Ordering::Relaxed))
    }

    /// Replayed file size as of the published tail.
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// The published replay frontier.
    pub fn tail_idx(&self) -> TxEntryIdx {
        TxEntryIdx::unpack(self.tail_tx_idx.load(Ordering::Acquire))
    }

    /// Lock-free check whether the table already reflects the log tail.
    /// Returns the consistent `(cursor, file_size)` snapshot if no update
    /// is needed, `None` if the caller should take the lock and `update`.
    pub fn need_update(&self, tx_mgr: &TxMgr<'_>, do_alloc: bool) -> Option<(TxCursor, u64)> {
        let idx = self.tail_tx_idx.load(Ordering::Relaxed);
        let block = self.tail_tx_block.load(Ordering::Relaxed);
        let size = self.file_size.load(Ordering::Relaxed);

        fence(Ordering::SeqCst);

        if idx != self.tail_tx_idx.load(Ordering::Relaxed)
            || block != self.tail_tx_block.load(Ordering::Relaxed)
            || size != self.file_size.load(Ordering::Relaxed)
        {
            return None;
        }

        let mut cursor = tx_mgr.cursor_at(TxEntryIdx::unpack(idx));
        if tx_mgr.handle_idx_overflow(&mut cursor, do_alloc).is_err() {
            // the ring cannot advance, so there is nothing new to apply
            return Some((cursor, size));
        }
        if tx_mgr.get_entry(&cursor) != 0 {
            return None;
        }
        Some((cursor, size))
    }

    /// Replays committed entries from the published tail and republishes
    /// the frontier. Must be called holding the file's meta lock. Returns
    /// the new file size.
    ///
    /// With `init_bitmap` the global bitmap is rebuilt from scratch while
    /// replaying: static blocks, tx-chain blocks, redo blocks and every
    /// referenced data block get their bits set. Used at first mount.
    pub fn update(&self, tx_mgr: &TxMgr<'_>, mtable: &MemTable, do_alloc: bool, init_bitmap: bool) -> u64 {
        let bitmap = BitmapView::new(mtable);
        if init_bitmap {
            bitmap.reset();
        }

        let mut cursor = tx_mgr.cursor_at(TxEntryIdx::unpack(self.tail_tx_idx.load(Ordering::Relaxed)));
        let mut size = self.file_size.load(Ordering::Relaxed);

        loop {
            if tx_mgr.handle_idx_overflow(&mut cursor, do_alloc).is_err() {
                break;
            }
            if init_bitmap && !cursor.idx.block.is_none() && cursor.idx.local == 0 {
                bitmap.mark_used(cursor.idx.block, 1);
            }
            let raw = tx_mgr.get_entry(&cursor);
            if raw == 0 {
                break;
            }
            size = self.apply(TxEntry::decode(raw), mtable, &bitmap, init_bitmap, size);
            cursor.idx.local += 1;
        }

        self.file_size.store(size, Ordering::Relaxed);
        self.tail_tx_block.store(cursor.block_ptr().cast_mut(), Ordering::Relaxed);
        self.tail_tx_idx.store(cursor.idx.pack(), Ordering::Release);
        fence(Ordering::SeqCst);

        let meta = mtable.meta();
        meta.update_file_size_hint(size);
        size
    }

    fn apply(
        &self,
        entry: TxEntry,
        mtable: &MemTable,
        bitmap: &BitmapView<'_>,
        init_bitmap: bool,
        mut size: u64,
    ) -> u64 {
        match entry {
            TxEntry::Inline {
                virtual_idx,
                logical_idx,
                num_blocks,
                last_remaining,
            } => {
                self.map_range(virtual_idx, logical_idx, num_blocks);
                if init_bitmap {
                    bitmap.mark_used(logical_idx, num_blocks);
                }
                let end = ((virtual_idx.0 + num_blocks) as u64) << BLOCK_SHIFT;
                size = size.max(end - last_remaining as u64);
            }
            TxEntry::Indirect(log_idx) => {
                if init_bitmap {
                    bitmap.mark_used(log_idx.block, 1);
                }
                // SAFETY: redo blocks referenced by committed entries are
                // immutable and inside the mapping.
                let block = unsafe { &*mtable.block(log_idx.block).cast_const().cast::<RedoLogBlock>() };
                let mut local = log_idx.local as usize;
                loop {
                    let e = block.entry(local);
                    assert!(e.is_overwrite(), "corrupt image: unknown redo-log op");
                    self.map_range(e.virtual_idx(), e.logical_idx(), e.num_blocks());
                    if init_bitmap {
                        bitmap.mark_used(e.logical_idx(), e.num_blocks());
                    }
                    size = size.max(e.virtual_idx().byte_offset() + e.size() as u64);
                    if !e.has_next() {
                        break;
                    }
                    local += 1;
                }
            }
        }
        size
    }

    fn map_range(&self, vbase: VirtualBlockIdx, lbase: LogicalBlockIdx, n: u32) {
        for i in 0..n {
            self.set(vbase.offset(i), lbase.offset(i));
        }
    }

    fn set(&self, vblk: VirtualBlockIdx, lblk: LogicalBlockIdx) {
        let seg_idx = (vblk.0 as usize) >> BLK_TABLE_SEGMENT_SHIFT;
        assert!(
            seg_idx < BLK_TABLE_NUM_SEGMENTS,
            "corrupt image: virtual block {} beyond capacity",
            vblk
        );
        let seg = self.ensure_segment(seg_idx);
        // SAFETY: published segments are live until drop.
        unsafe {
            (*seg).0[(vblk.0 as usize) & (BLK_TABLE_SEGMENT_SIZE - 1)]
                .store(lblk.0, Ordering::Relaxed)
        };
    }

    fn ensure_segment(&self, seg_idx: usize) -> *mut Segment {
        let cur = self.segments[seg_idx].load(Ordering::Acquire);
        if !cur.is_null() {
            return cur;
        }
        // SAFETY: Segment is valid in the all-zero state.
        let fresh: Box<Segment> = unsafe { Box::new_zeroed().assume_init() };
        let raw = Box::into_raw(fresh);
        match self.segments[seg_idx].compare_exchange(
            std::ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => raw,
            Err(winner) => {
                // SAFETY: raw was never published.
                drop(unsafe { Box::from_raw(raw) });
                winner
            }
        }
    }
}

impl Drop for BlkTable {
    fn drop(&mut self) {
        for seg in &self.segments {
            let p = seg.load(Ordering::Relaxed);
            if !p.is_null() {
                // SAFETY: segments are exclusively owned at drop time.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

impl Default for BlkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorShards;
    use crate::config::DEFAULT_NUM_BITMAP_BLOCKS;
    use crate::layout::MetaBlock;

    struct Ctx {
        mtable: MemTable,
        shards: AllocatorShards,
    }

    fn scratch() -> Ctx {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("image");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let mtable = MemTable::open(file).unwrap();
        // SAFETY: freshly created image, no concurrent access.
        unsafe {
            MetaBlock::format(
                mtable.block(LogicalBlockIdx(0)).cast(),
                DEFAULT_NUM_BITMAP_BLOCKS as u32,
            )
        };
        BitmapView::new(&mtable).reset();
        Ctx {
            mtable,
            shards: AllocatorShards::new(),
        }
    }

    fn commit_inline(ctx: &Ctx, v: u32, l: u32, n: u32, rem: u32) {
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        let e = TxEntry::Inline {
            virtual_idx: VirtualBlockIdx(v),
            logical_idx: LogicalBlockIdx(l),
            num_blocks: n,
            last_remaining: rem,
        };
        let mut cursor = TxCursor::start();
        mgr.try_commit(e.encode(), &mut cursor, true).unwrap();
    }

    #[test]
    fn empty_table_reads_none() {
        let table = BlkTable::new();
        assert_eq!(table.get(VirtualBlockIdx(0)), LogicalBlockIdx::NONE);
        assert_eq!(table.get(VirtualBlockIdx(1_000_000)), LogicalBlockIdx::NONE);
        assert_eq!(table.file_size(), 0);
    }

    #[test]
    fn update_applies_inline_commits() {
        let ctx = scratch();
        commit_inline(&ctx, 0, 20, 3, 2048);
        let table = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        let size = table.update(&mgr, &ctx.mtable, false, false);
        assert_eq!(size, 3 * 4096 - 2048);
        assert_eq!(table.get(VirtualBlockIdx(0)), LogicalBlockIdx(20));
        assert_eq!(table.get(VirtualBlockIdx(2)), LogicalBlockIdx(22));
        assert_eq!(table.get(VirtualBlockIdx(3)), LogicalBlockIdx::NONE);
    }

    #[test]
    fn later_commit_wins_overwrite() {
        let ctx = scratch();
        commit_inline(&ctx, 1, 30, 1, 0);
        commit_inline(&ctx, 1, 40, 1, 0);
        let table = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        table.update(&mgr, &ctx.mtable, false, false);
        assert_eq!(table.get(VirtualBlockIdx(1)), LogicalBlockIdx(40));
    }

    #[test]
    fn update_is_idempotent() {
        let ctx = scratch();
        commit_inline(&ctx, 0, 25, 2, 100);
        let table = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        let first = table.update(&mgr, &ctx.mtable, false, false);
        let second = table.update(&mgr, &ctx.mtable, false, false);
        assert_eq!(first, second);
        assert_eq!(table.get(VirtualBlockIdx(1)), LogicalBlockIdx(26));
    }

    #[test]
    fn prefix_then_suffix_replay_matches_full_replay() {
        let ctx = scratch();
        commit_inline(&ctx, 0, 20, 2, 0);

        let split = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        split.update(&mgr, &ctx.mtable, false, false);

        commit_inline(&ctx, 1, 50, 1, 512);
        commit_inline(&ctx, 4, 60, 1, 0);
        split.update(&mgr, &ctx.mtable, false, false);

        let full = BlkTable::new();
        full.update(&mgr, &ctx.mtable, false, false);

        for v in 0..6 {
            assert_eq!(split.get(VirtualBlockIdx(v)), full.get(VirtualBlockIdx(v)));
        }
        assert_eq!(split.file_size(), full.file_size());
        assert_eq!(split.file_size(), 5 * 4096);
    }

    #[test]
    fn need_update_sees_fresh_commits() {
        let ctx = scratch();
        let table = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        assert!(table.need_update(&mgr, false).is_some());

        commit_inline(&ctx, 0, 33, 1, 0);
        assert!(table.need_update(&mgr, false).is_none());

        table.update(&mgr, &ctx.mtable, false, false);
        let (cursor, size) = table.need_update(&mgr, false).unwrap();
        assert_eq!(size, 4096);
        assert_eq!(cursor.idx.local, 1);
    }

    #[test]
    fn init_bitmap_marks_referenced_blocks() {
        let ctx = scratch();
        commit_inline(&ctx, 0, 100, 4, 0);
        let table = BlkTable::new();
        let mgr = TxMgr::new(&ctx.mtable, &ctx.shards);
        table.update(&mgr, &ctx.mtable, false, true);

        let bm = BitmapView::new(&ctx.mtable);
        assert!(bm.is_used(LogicalBlockIdx(0)));
        for i in 0..4 {
            assert!(bm.is_used(LogicalBlockIdx(100 + i)));
        }
        // a block nothing references was dropped by the rebuild
        assert!(!bm.is_used(LogicalBlockIdx(99)));
    }
}
