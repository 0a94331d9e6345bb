//! # Transaction Manager
//!
//! A transaction is one 8-byte entry appended to the tx-log ring: the inline
//! region in the meta block followed by chained [`TxLogBlock`]s. The entry
//! is the linearization point, an 8-byte release store that the hardware
//! persists atomically, so a commit is visible and durable in one step.
//!
//! ## Entry Encoding
//!
//! ```text
//! bit 63: tag (0 = inline commit, 1 = indirect commit)
//!
//! inline:   [62..41] virtual_idx   (22 bits)
//!           [40..19] logical_idx   (22 bits)
//!           [18..13] num_blocks    (6 bits, 1..=63)
//!           [12..1]  last_remaining (12 bits)
//!           [0]      reserved
//!
//! indirect: [39..0]  packed LogEntryIdx (redo-log block + local)
//! ```
//!
//! Zero is the empty-slot sentinel; an inline entry is never zero because
//! `num_blocks >= 1`. The split is part of the persistent format.
//!
//! ## Commit Walk
//!
//! `try_commit` scans from the caller's tail hint, claiming the first zero
//! slot with a release CAS. When a region is exhausted the walk follows the
//! `next` link, or allocates and link-publishes a new block if permitted;
//! losers of the link race free their block and follow the winner.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::{AllocatorShards, BitmapView};
use crate::config::{TX_INLINE_IDX_BITS, TX_INLINE_NUM_BLOCKS_BITS, TX_INLINE_REMAINING_BITS};
use crate::error::{FsError, OpResult};
use crate::idx::{LogEntryIdx, LogicalBlockIdx, TxEntryIdx, VirtualBlockIdx};
use crate::layout::{try_commit_in, TxLogBlock};
use crate::mtable::MemTable;

const TAG_INDIRECT: u64 = 1 << 63;
const IDX_MASK: u64 = (1 << TX_INLINE_IDX_BITS) - 1;
const NUM_BLOCKS_MASK: u64 = (1 << TX_INLINE_NUM_BLOCKS_BITS) - 1;
const REMAINING_MASK: u64 = (1 << TX_INLINE_REMAINING_BITS) - 1;

const VIRT_SHIFT: u32 = 41;
const LOGI_SHIFT: u32 = 19;
const NUM_BLOCKS_SHIFT: u32 = 13;
const REMAINING_SHIFT: u32 = 1;

/// A decoded committed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEntry {
    Inline {
        virtual_idx: VirtualBlockIdx,
        logical_idx: LogicalBlockIdx,
        num_blocks: u32,
        last_remaining: u32,
    },
    Indirect(LogEntryIdx),
}

impl TxEntry {
    /// Whether an inline encoding can represent this commit.
    pub fn fits_inline(
        virtual_idx: VirtualBlockIdx,
        logical_idx: LogicalBlockIdx,
        num_blocks: u32,
        last_remaining: u32,
    ) -> bool {
        (virtual_idx.0 as u64) <= IDX_MASK
            && (logical_idx.0 as u64) <= IDX_MASK
            && num_blocks >= 1
            && (num_blocks as u64) <= NUM_BLOCKS_MASK
            && (last_remaining as u64) <= REMAINING_MASK
    }

    pub fn encode(&self) -> u64 {
        match *self {
            TxEntry::Inline {
                virtual_idx,
                logical_idx,
                num_blocks,
                last_remaining,
            } => {
                debug_assert!(TxEntry::fits_inline(
                    virtual_idx,
                    logical_idx,
                    num_blocks,
                    last_remaining
                ));
                ((virtual_idx.0 as u64) << VIRT_SHIFT)
                    | ((logical_idx.0 as u64) << LOGI_SHIFT)
                    | ((num_blocks as u64) << NUM_BLOCKS_SHIFT)
                    | ((last_remaining as u64) << REMAINING_SHIFT)
            }
            TxEntry::Indirect(idx) => TAG_INDIRECT | idx.pack(),
        }
    }

    /// Decodes a non-zero slot value.
    pub fn decode(raw: u64) -> TxEntry {
        debug_assert!(raw != 0);
        if raw & TAG_INDIRECT != 0 {
            TxEntry::Indirect(LogEntryIdx::unpack(raw & !TAG_INDIRECT))
        } else {
            TxEntry::Inline {
                virtual_idx: VirtualBlockIdx(((raw >> VIRT_SHIFT) & IDX_MASK) as u32),
                logical_idx: LogicalBlockIdx(((raw >> LOGI_SHIFT) & IDX_MASK) as u32),
                num_blocks: ((raw >> NUM_BLOCKS_SHIFT) & NUM_BLOCKS_MASK) as u32,
                last_remaining: ((raw >> REMAINING_SHIFT) & REMAINING_MASK) as u32,
            }
        }
    }
}

/// A position in the tx-log ring: the entry index plus the resolved block
/// (null while still in the meta inline region). The order key makes any
/// two committed positions comparable: the block sequence number is the
/// major key and the slot index the minor key.
#[derive(Debug, Clone, Copy)]
pub struct TxCursor {
    pub idx: TxEntryIdx,
    block: *const TxLogBlock,
}

impl TxCursor {
    pub fn start() -> TxCursor {
        TxCursor {
            idx: TxEntryIdx::default(),
            block: std::ptr::null(),
        }
    }

    pub fn block_ptr(&self) -> *const TxLogBlock {
        self.block
    }

    fn seq(&self) -> u32 {
        if self.block.is_null() {
            0
        } else {
            // SAFETY: a non-null cursor block points into the live mapping.
            unsafe { (*self.block).tx_seq() }
        }
    }

    /// Total-order key across the whole ring.
    pub fn order_key(&self) -> u64 {
        ((self.seq() as u64) << 16) | (self.idx.local as u16 as u64)
    }
}

/// Stateless view binding the tx-log operations to one image.
pub struct TxMgr<'a> {
    mtable: &'a MemTable,
    shards: &'a AllocatorShards,
}

impl<'a> TxMgr<'a> {
    pub fn new(mtable: &'a MemTable, shards: &'a AllocatorShards) -> TxMgr<'a> {
        TxMgr { mtable, shards }
    }

    /// Rebuilds a cursor from a persisted/published entry index.
    pub fn cursor_at(&self, idx: TxEntryIdx) -> TxCursor {
        let block = if idx.block.is_none() {
            std::ptr::null()
        } else {
            self.mtable.block(idx.block).cast_const().cast()
        };
        TxCursor { idx, block }
    }

    fn slots_at(&self, cursor: &TxCursor) -> &[AtomicU64] {
        if cursor.block.is_null() {
            self.mtable.meta().inline_tx_slots()
        } else {
            // SAFETY: cursor blocks point into the live mapping.
            unsafe { (*cursor.block).slots() }
        }
    }

    /// Acquire-loads the raw slot under the cursor. Zero means "no entry
    /// committed here yet", i.e. the cursor is the current tail.
    pub fn get_entry(&self, cursor: &TxCursor) -> u64 {
        self.slots_at(cursor)[cursor.idx.local as usize].load(Ordering::Acquire)
    }

    /// Advances a cursor that sits at or past the end of its region onto
    /// the next region, following links and allocating if allowed.
    /// `Err(TxFull)` means the ring cannot grow under `do_alloc = false`.
    pub fn handle_idx_overflow(&self, cursor: &mut TxCursor, do_alloc: bool) -> OpResult<()> {
        while cursor.idx.local as usize >= cursor.idx.capacity() {
            let next = if cursor.block.is_null() {
                self.mtable.meta().log_head()
            } else {
                // SAFETY: cursor blocks point into the live mapping.
                unsafe { (*cursor.block).next() }
            };

            let next = if next.is_none() {
                if !do_alloc {
                    return Err(FsError::TxFull);
                }
                self.extend_ring(cursor)?
            } else {
                next
            };

            *cursor = TxCursor {
                idx: TxEntryIdx { block: next, local: 0 },
                block: self.mtable.block(next).cast_const().cast(),
            };
        }
        Ok(())
    }

    /// Appends `entry` at the first free slot at or after the cursor and
    /// returns its index. The cursor is left on the claimed slot. The CAS
    /// inside is the linearization and persistence point of the commit.
    pub fn try_commit(&self, entry: u64, cursor: &mut TxCursor, do_alloc: bool) -> OpResult<TxEntryIdx> {
        loop {
            self.handle_idx_overflow(cursor, do_alloc)?;
            match try_commit_in(self.slots_at(cursor), entry, cursor.idx.local as usize) {
                Some(slot) => {
                    cursor.idx.local = slot as i16;
                    self.mtable.meta().update_log_tail_hint(cursor.idx.block);
                    return Ok(cursor.idx);
                }
                None => {
                    // region filled up under us; force the overflow path
                    cursor.idx.local = cursor.idx.capacity() as i16;
                }
            }
        }
    }

    /// Allocates, initializes and link-publishes a new tx-log block after
    /// the cursor's region. Returns the established successor, which may be
    /// a concurrent winner's block.
    fn extend_ring(&self, cursor: &TxCursor) -> OpResult<LogicalBlockIdx> {
        let bitmap = BitmapView::new(self.mtable);
        let ours = self.shards.mine().lock().alloc(1, &bitmap)?;

        // SAFETY: `ours` was just allocated and is unpublished, so we have
        // exclusive access.
        unsafe {
            TxLogBlock::init(
                self.mtable.block(ours).cast(),
                cursor.idx.block,
                cursor.seq() + 1,
            )
        };

        let winner = if cursor.block.is_null() {
            self.mtable.meta().publish_log_head(ours)
        } else {
            // SAFETY: cursor blocks point into the live mapping.
            unsafe { (*cursor.block).publish_next(ours) }
        };

        if winner != ours {
            self.shards.mine().lock().free(ours, 1);
        }
        Ok(winner)
    }
}
