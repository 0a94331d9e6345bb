//! Redo-log blocks: immutable mapping deltas referenced by indirect commits.
//!
//! A [`LogEntry`] describes one virtual→logical range in 16 bytes. Entries
//! are written before the referencing tx entry is persisted and are never
//! mutated afterwards, so they need no per-entry atomicity. A commit that
//! covers several allocator runs writes its entries contiguously within a
//! single block; all but the last carry [`LOG_OP_HAS_NEXT`] so the replayer
//! knows where the group ends.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{BLOCK_SIZE, BLOCK_SHIFT, NUM_LOG_ENTRIES};
use crate::idx::{LogicalBlockIdx, VirtualBlockIdx};

/// Copy-on-write overwrite of a block range.
pub const LOG_OP_OVERWRITE: u32 = 1;

/// Flag bit: the next entry in this block belongs to the same commit.
pub const LOG_OP_HAS_NEXT: u32 = 1 << 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LogEntry {
    op: U32,
    virtual_idx: U32,
    logical_idx: U32,
    size: U32,
}

const _: () = assert!(std::mem::size_of::<LogEntry>() == 16);

impl LogEntry {
    /// A delta mapping `num_blocks` blocks starting at `virtual_idx` to the
    /// run at `logical_idx`, with `size` payload bytes measured from the
    /// start of the first block.
    pub fn overwrite(
        virtual_idx: VirtualBlockIdx,
        logical_idx: LogicalBlockIdx,
        size: u32,
    ) -> LogEntry {
        debug_assert!(size > 0);
        LogEntry {
            op: U32::new(LOG_OP_OVERWRITE),
            virtual_idx: U32::new(virtual_idx.0),
            logical_idx: U32::new(logical_idx.0),
            size: U32::new(size),
        }
    }

    pub fn with_has_next(mut self) -> LogEntry {
        self.op = U32::new(self.op.get() | LOG_OP_HAS_NEXT);
        self
    }

    pub fn has_next(&self) -> bool {
        self.op.get() & LOG_OP_HAS_NEXT != 0
    }

    pub fn is_overwrite(&self) -> bool {
        self.op.get() & 0xff == LOG_OP_OVERWRITE
    }

    pub fn virtual_idx(&self) -> VirtualBlockIdx {
        VirtualBlockIdx(self.virtual_idx.get())
    }

    pub fn logical_idx(&self) -> LogicalBlockIdx {
        LogicalBlockIdx(self.logical_idx.get())
    }

    /// Payload bytes covered, from the start of the first block.
    pub fn size(&self) -> u32 {
        self.size.get()
    }

    /// Blocks covered by this delta.
    pub fn num_blocks(&self) -> u32 {
        self.size.get().div_ceil(1 << BLOCK_SHIFT)
    }

    /// Unwritten bytes at the tail of the last covered block.
    pub fn last_remaining(&self) -> u32 {
        (self.num_blocks() << BLOCK_SHIFT) - self.size.get()
    }
}

#[repr(C, align(4096))]
pub struct RedoLogBlock {
    entries: [LogEntry; NUM_LOG_ENTRIES],
}

const _: () = assert!(std::mem::size_of::<RedoLogBlock>() == BLOCK_SIZE);

impl RedoLogBlock {
    pub fn entry(&self, local: usize) -> &LogEntry {
        &self.entries[local]
    }

    /// Writes a group of entries starting at `local`.
    ///
    /// # Safety
    ///
    /// The caller must hold the redo-log tail, i.e. no other thread may be
    /// writing the same slots, and the slots must not yet be referenced by
    /// any committed tx entry.
    pub unsafe fn write_entries(this: *mut RedoLogBlock, local: usize, entries: &[LogEntry]) {
        debug_assert!(local + entries.len() <= NUM_LOG_ENTRIES);
        let dst = (*this).entries.as_mut_ptr().add(local);
        std::ptr::copy_nonoverlapping(entries.as_ptr(), dst, entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_derives_block_geometry() {
        let e = LogEntry::overwrite(VirtualBlockIdx(0), LogicalBlockIdx(9), 10240);
        assert_eq!(e.num_blocks(), 3);
        assert_eq!(e.last_remaining(), 2048);
        assert!(e.is_overwrite());
        assert!(!e.has_next());
    }

    #[test]
    fn entry_full_blocks_have_no_remaining() {
        let e = LogEntry::overwrite(VirtualBlockIdx(4), LogicalBlockIdx(2), 8192);
        assert_eq!(e.num_blocks(), 2);
        assert_eq!(e.last_remaining(), 0);
    }

    #[test]
    fn has_next_flag_preserves_op() {
        let e = LogEntry::overwrite(VirtualBlockIdx(1), LogicalBlockIdx(1), 1).with_has_next();
        assert!(e.has_next());
        assert!(e.is_overwrite());
    }

    #[test]
    fn entry_bytes_are_little_endian() {
        let e = LogEntry::overwrite(VirtualBlockIdx(0x0102), LogicalBlockIdx(0x0304), 0x0506);
        let bytes = e.as_bytes();
        assert_eq!(&bytes[4..8], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(&bytes[8..12], &[0x04, 0x03, 0x00, 0x00]);
        assert_eq!(&bytes[12..16], &[0x06, 0x05, 0x00, 0x00]);
    }
}
