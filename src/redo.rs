//! # Redo-Log Manager
//!
//! Appends groups of immutable [`LogEntry`] deltas for commits too large to
//! fit an inline tx entry. A group is written contiguously within one
//! redo-log block; when the tail block cannot hold the group a fresh block
//! is allocated and becomes the new tail, and the short remainder of the
//! old block is simply never referenced.
//!
//! Entries are persisted with a fence before the caller publishes the
//! referencing tx entry, so a crash between the two leaves only unreachable
//! bytes. Nothing in a redo block is reachable except through committed tx
//! entries, which is also why the manager can start with a fresh tail on
//! every mount.

use parking_lot::Mutex;

use crate::alloc::{AllocatorShards, BitmapView};
use crate::config::NUM_LOG_ENTRIES;
use crate::error::{FsError, OpResult};
use crate::idx::{LogEntryIdx, LogicalBlockIdx};
use crate::layout::{LogEntry, RedoLogBlock};
use crate::mtable::MemTable;
use crate::pmem;

struct Tail {
    // NONE until the first append of a mount
    block: LogicalBlockIdx,
    used: usize,
}

pub struct RedoLogMgr {
    tail: Mutex<Tail>,
}

impl RedoLogMgr {
    pub fn new() -> RedoLogMgr {
        RedoLogMgr {
            tail: Mutex::new(Tail {
                block: LogicalBlockIdx::NONE,
                used: 0,
            }),
        }
    }

    /// Appends one commit's entry group and returns the index of its first
    /// entry. The group is persisted and fenced before returning, so the
    /// caller may immediately publish a tx entry referencing it.
    pub fn append(
        &self,
        entries: &[LogEntry],
        mtable: &MemTable,
        shards: &AllocatorShards,
    ) -> OpResult<LogEntryIdx> {
        debug_assert!(!entries.is_empty());
        if entries.len() > NUM_LOG_ENTRIES {
            return Err(FsError::BadArgument("redo group exceeds one block"));
        }

        let mut t = self.tail.lock();
        if t.block.is_none() || t.used + entries.len() > NUM_LOG_ENTRIES {
            t.block = shards.mine().lock().alloc(1, &BitmapView::new(mtable))?;
            t.used = 0;
        }
        let ptr = mtable.block(t.block).cast::<RedoLogBlock>();
        // SAFETY: the tail lock gives exclusive write access to the slot
        // range, and nothing references these slots yet.
        unsafe {
            RedoLogBlock::write_entries(ptr, t.used, entries);
            pmem::persist_fenced(
                ptr.cast::<u8>().add(t.used * std::mem::size_of::<LogEntry>()),
                entries.len() * std::mem::size_of::<LogEntry>(),
            );
        }

        let idx = LogEntryIdx {
            block: t.block,
            local: t.used as u8,
        };
        t.used += entries.len();
        Ok(idx)
    }
}

impl Default for RedoLogMgr {
    fn default() -> Self {
        Self::new()
    }
}
