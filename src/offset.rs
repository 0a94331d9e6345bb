//! # Shared-Offset Manager
//!
//! POSIX `read`/`write` on a shared file description move one offset, and
//! concurrent movers must observe a single serial order. Offsets are handed
//! out under the file's meta lock; the interesting part is what happens
//! after, when each holder commits its transaction lock-free and the commit
//! order may disagree with the hand-out order.
//!
//! Every acquire takes a monotonically increasing ticket. Each ticket owns
//! a cache-line-isolated slot in a fixed ring; an operation publishes its
//! commit position (as a tx-log order key) into its slot when done, and the
//! successor spin-waits on the predecessor's slot. With strict serialization
//! on, a writer whose commit landed *before* its predecessor's in tx order
//! re-commits until the orders agree, so a crash prefix of the tx log is
//! always a prefix of the offset order. With it off, both hooks are no-ops
//! and only tx-log order is guaranteed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, NUM_OFFSET_QUEUE_SLOT};
use crate::error::{FsError, OpResult};

#[repr(align(64))]
struct TicketSlot {
    ticket: AtomicU64,
    // commit order key of the holder; valid once `ticket` is published
    cursor_key: AtomicU64,
}

pub struct OffsetMgr {
    // both fields are only mutated under the file's meta lock
    offset: AtomicU64,
    next_ticket: AtomicU64,
    queues: Box<[TicketSlot; NUM_OFFSET_QUEUE_SLOT]>,
}

impl OffsetMgr {
    /// Key published by a ticket holder that failed before committing.
    /// Real order keys are `(tx_seq << 16) | local` and can never reach
    /// this value; successors treat it as "no predecessor to order
    /// against", so a failed operation never forces a redo. The genuine
    /// first commit of a file has order key 0, which is why 0 cannot be
    /// the sentinel.
    pub const NO_COMMIT_KEY: u64 = u64::MAX;

    pub fn new() -> OffsetMgr {
        OffsetMgr {
            offset: AtomicU64::new(0),
            // ticket 0 is the no-predecessor sentinel
            next_ticket: AtomicU64::new(1),
            queues: Box::new(
                [const {
                    TicketSlot {
                        ticket: AtomicU64::new(0),
                        cursor_key: AtomicU64::new(0),
                    }
                }; NUM_OFFSET_QUEUE_SLOT],
            ),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Sets the offset. Caller must hold the meta lock.
    pub fn seek_absolute(&self, abs: u64) -> u64 {
        self.offset.store(abs, Ordering::Relaxed);
        abs
    }

    /// Moves the offset by `rel`; fails below zero. Caller must hold the
    /// meta lock.
    pub fn seek_relative(&self, rel: i64) -> OpResult<u64> {
        let cur = self.offset.load(Ordering::Relaxed) as i64;
        let new = cur
            .checked_add(rel)
            .ok_or(FsError::BadArgument("offset overflow"))?;
        if new < 0 {
            return Err(FsError::BadArgument("negative resulting offset"));
        }
        Ok(self.seek_absolute(new as u64))
    }

    /// Advances the offset by `*count` and takes a ticket. With
    /// `stop_at_boundary` the movement is clamped at `file_size` and
    /// `*count` shrinks accordingly. Caller must hold the meta lock and
    /// must pair with [`release_offset`].
    pub fn acquire_offset(&self, count: &mut u64, file_size: u64, stop_at_boundary: bool) -> (u64, u64) {
        let old = self.offset.load(Ordering::Relaxed);
        let mut new = old + *count;
        if stop_at_boundary && new > file_size {
            new = file_size.max(old);
            *count = new - old;
        }
        self.offset.store(new, Ordering::Relaxed);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        (old, ticket)
    }

    /// Spin-waits until the predecessor published its commit position.
    /// Returns the predecessor's order key, or `None` when there is no
    /// predecessor or strict serialization is off.
    pub fn wait_offset(&self, ticket: u64) -> Option<u64> {
        if !config::options().strict_offset_serial {
            return None;
        }
        let prev = ticket - 1;
        if prev == 0 {
            return None;
        }
        let slot = &self.queues[(prev as usize) % NUM_OFFSET_QUEUE_SLOT];
        while slot.ticket.load(Ordering::Acquire) != prev {
            std::hint::spin_loop();
        }
        Some(slot.cursor_key.load(Ordering::Relaxed))
    }

    /// True iff the predecessor's commit position precedes `cursor_key`.
    /// False tells the caller its commit landed before the predecessor's in
    /// tx order and the operation must redo with updated state. A
    /// predecessor that failed before committing published
    /// [`NO_COMMIT_KEY`](Self::NO_COMMIT_KEY) and imposes no ordering.
    pub fn validate_offset(&self, ticket: u64, cursor_key: u64) -> bool {
        match self.wait_offset(ticket) {
            None => true,
            Some(prev_key) => prev_key == Self::NO_COMMIT_KEY || prev_key < cursor_key,
        }
    }

    /// Publishes this ticket's commit position so the successor can advance.
    pub fn release_offset(&self, ticket: u64, cursor_key: u64) {
        if !config::options().strict_offset_serial {
            return;
        }
        let slot = &self.queues[(ticket as usize) % NUM_OFFSET_QUEUE_SLOT];
        slot.cursor_key.store(cursor_key, Ordering::Relaxed);
        slot.ticket.store(ticket, Ordering::Release);
    }
}

impl Default for OffsetMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeks_move_the_offset() {
        let mgr = OffsetMgr::new();
        assert_eq!(mgr.seek_absolute(100), 100);
        assert_eq!(mgr.seek_relative(-40).unwrap(), 60);
        assert_eq!(mgr.offset(), 60);
        assert!(mgr.seek_relative(-61).is_err());
        assert_eq!(mgr.offset(), 60);
    }

    #[test]
    fn acquire_advances_and_tickets_increase() {
        let mgr = OffsetMgr::new();
        let mut count = 1000;
        let (old, t1) = mgr.acquire_offset(&mut count, u64::MAX, false);
        assert_eq!((old, count), (0, 1000));
        let mut count = 500;
        let (old, t2) = mgr.acquire_offset(&mut count, u64::MAX, false);
        assert_eq!(old, 1000);
        assert!(t2 > t1);
    }

    #[test]
    fn boundary_clamps_count() {
        let mgr = OffsetMgr::new();
        mgr.seek_absolute(900);
        let mut count = 500;
        let (old, _) = mgr.acquire_offset(&mut count, 1000, true);
        assert_eq!(old, 900);
        assert_eq!(count, 100);
        assert_eq!(mgr.offset(), 1000);

        // at EOF, reads shrink to zero
        let mut count = 10;
        let (old, _) = mgr.acquire_offset(&mut count, 1000, true);
        assert_eq!(old, 1000);
        assert_eq!(count, 0);
    }

    #[test]
    fn ticket_one_has_no_predecessor() {
        let mgr = OffsetMgr::new();
        assert_eq!(mgr.wait_offset(1), None);
        assert!(mgr.validate_offset(1, 0));
    }

    #[test]
    fn failed_predecessor_imposes_no_ordering() {
        let mgr = OffsetMgr::new();
        let mut c = 10;
        let (_, t1) = mgr.acquire_offset(&mut c, u64::MAX, false);
        let mut c = 10;
        let (_, t2) = mgr.acquire_offset(&mut c, u64::MAX, false);

        mgr.release_offset(t1, OffsetMgr::NO_COMMIT_KEY);
        // even the order key of a file's very first commit (0) validates
        assert!(mgr.validate_offset(t2, 0));
        mgr.release_offset(t2, 0);
    }

    #[test]
    fn successor_sees_predecessor_key() {
        let mgr = OffsetMgr::new();
        let mut c = 10;
        let (_, t1) = mgr.acquire_offset(&mut c, u64::MAX, false);
        let mut c = 10;
        let (_, t2) = mgr.acquire_offset(&mut c, u64::MAX, false);

        mgr.release_offset(t1, 7);
        if config::options().strict_offset_serial {
            assert_eq!(mgr.wait_offset(t2), Some(7));
            assert!(mgr.validate_offset(t2, 8));
            assert!(!mgr.validate_offset(t2, 7));
            assert!(!mgr.validate_offset(t2, 3));
        }
        mgr.release_offset(t2, 9);
    }
}
