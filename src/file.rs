//! # File Façade
//!
//! Binds one backing file to the engine: mapping, allocator shards, tx
//! manager, block table, offset manager and shared segment, and routes the
//! POSIX-shaped operations across them.
//!
//! ## Write Path
//!
//! A write is strict copy-on-write: allocate fresh blocks, copy the
//! untouched head/tail bytes of the boundary blocks from their committed
//! versions (or zero-fill holes), lay in the user bytes, persist, then
//! publish a single 8-byte tx entry (inline for one-block writes, through
//! the redo log otherwise). The committed blocks are never mutated again,
//! which is what keeps reads lock-free and replay idempotent.
//!
//! ## Shared-Offset Path
//!
//! `read`/`write` go through the [`OffsetMgr`] ticket queue; `pread`/
//! `pwrite` never touch the shared offset. With strict serialization a
//! writer whose commit landed out of ticket order re-runs its whole
//! copy-on-write transaction against the updated mapping until tx order
//! agrees with ticket order, so a crash prefix of the log is always a
//! prefix of the offset order.

use std::fs;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use eyre::{Context, Result};
use smallvec::SmallVec;

use crate::alloc::{thread_ordinal, AllocatorShards, BitmapView};
use crate::btable::BlkTable;
use crate::config::{
    BLK_TABLE_NUM_SEGMENTS, BLK_TABLE_SEGMENT_SIZE, BLOCK_SHIFT, BLOCK_SIZE,
    DEFAULT_NUM_BITMAP_BLOCKS, GROW_UNIT_BYTES, MAX_BLOCKS_PER_ALLOC, NUM_ALLOCATOR_SHARDS,
    NUM_LOG_ENTRIES,
};
use crate::error::{FsError, OpResult};
use crate::idx::{LogicalBlockIdx, VirtualBlockIdx};
use crate::layout::{LogEntry, MetaBlock};
use crate::mtable::MemTable;
use crate::offset::OffsetMgr;
use crate::pmem;
use crate::redo::RedoLogMgr;
use crate::shm::ShmMgr;
use crate::tx::{TxCursor, TxEntry, TxMgr};

/// Largest byte count one tx can cover. The redo-log run budget is one
/// full block of entries (`NUM_LOG_ENTRIES` runs of `MAX_BLOCKS_PER_ALLOC`
/// blocks); one block is held back so a write starting mid-block, which
/// covers one extra block for the same byte count, still fits. Larger
/// writes split into multiple transactions.
pub const MAX_TX_BYTES: u64 =
    ((NUM_LOG_ENTRIES as u64) * (MAX_BLOCKS_PER_ALLOC as u64) - 1) * (BLOCK_SIZE as u64);

const NO_SLOT: usize = usize::MAX;

/// Outcome of an open attempt: either the file is ours, or the caller
/// should fall through to the kernel.
pub enum OpenOutcome {
    Managed(File),
    NotManaged,
}

pub struct File {
    flags: i32,
    base_stat: libc::stat,
    mtable: MemTable,
    shards: AllocatorShards,
    redo: RedoLogMgr,
    btable: BlkTable,
    offset_mgr: OffsetMgr,
    shm: ShmMgr,
    // shm liveness slot claimed by each allocator shard, NO_SLOT until used
    shard_slots: [AtomicUsize; NUM_ALLOCATOR_SHARDS],
}

impl File {
    /// Attempts to manage a pre-opened backing file. Returns `NotManaged`
    /// when the file cannot be an image (wrong shape, foreign content,
    /// read-only empty file, O_TRUNC on existing data) so the caller can
    /// fall through to the kernel.
    pub fn open(backing: fs::File, flags: i32) -> Result<OpenOutcome> {
        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        // SAFETY: st is a valid out-parameter for fstat.
        let rc = unsafe { libc::fstat(backing.as_raw_fd(), &mut st) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).wrap_err("fstat on backing file failed");
        }

        if st.st_mode & libc::S_IFMT != libc::S_IFREG {
            return Ok(OpenOutcome::NotManaged);
        }

        let size = st.st_size as u64;
        let fresh = size == 0;
        if fresh && flags & libc::O_ACCMODE == libc::O_RDONLY {
            return Ok(OpenOutcome::NotManaged);
        }
        if !fresh && size % GROW_UNIT_BYTES as u64 != 0 {
            return Ok(OpenOutcome::NotManaged);
        }
        if !fresh && flags & libc::O_TRUNC != 0 {
            log::warn!("O_TRUNC on a managed file is unsupported; falling through");
            return Ok(OpenOutcome::NotManaged);
        }

        let mtable = MemTable::open(backing)?;
        if fresh {
            // SAFETY: a fresh image is not shared with anyone yet.
            unsafe {
                MetaBlock::format(
                    mtable.block(LogicalBlockIdx(0)).cast(),
                    DEFAULT_NUM_BITMAP_BLOCKS as u32,
                )
            };
            BitmapView::new(&mtable).reset();
        } else if mtable.meta().verify().is_err() {
            return Ok(OpenOutcome::NotManaged);
        }

        let shm = ShmMgr::open(mtable.file().as_raw_fd(), &st)?;

        let file = File {
            flags,
            base_stat: st,
            mtable,
            shards: AllocatorShards::new(),
            redo: RedoLogMgr::new(),
            btable: BlkTable::new(),
            offset_mgr: OffsetMgr::new(),
            shm,
            shard_slots: [const { AtomicUsize::new(NO_SLOT) }; NUM_ALLOCATOR_SHARDS],
        };

        // first mount rebuilds the bitmap from the log; later mounts only
        // fold in commits made since the hint
        let rebuild = file.shm.created() && !fresh;
        {
            let _guard = file.meta().lock();
            let tx = TxMgr::new(&file.mtable, &file.shards);
            file.btable.update(&tx, &file.mtable, false, rebuild);
        }
        BitmapView::new(&file.mtable).copy_to(file.shm.bitmap_mirror());

        log::debug!(
            "opened image: size={} fresh={} rebuild={}",
            file.btable.file_size(),
            fresh,
            rebuild
        );
        Ok(OpenOutcome::Managed(file))
    }

    fn meta(&self) -> &MetaBlock {
        self.mtable.meta()
    }

    /// The shared segment path, for the destroy API and diagnostics.
    pub fn shm_path(&self) -> &std::ffi::CStr {
        self.shm.path()
    }

    /// Unlinks this file's shared segment. Explicit destroy API.
    pub fn destroy_shm(&self) {
        self.shm.unlink();
    }

    /// Replayed file size as of the latest sync.
    pub fn size(&self) -> u64 {
        self.btable.file_size()
    }

    /// Brings the block table up to the log tail, avoiding the meta lock
    /// when the lock-free probe shows nothing new. Returns the tail cursor
    /// and the current size.
    fn sync_btable(&self, do_alloc: bool) -> (TxCursor, u64) {
        let tx = TxMgr::new(&self.mtable, &self.shards);
        if let Some(snap) = self.btable.need_update(&tx, do_alloc) {
            return snap;
        }
        let _guard = self.meta().lock();
        let size = self.btable.update(&tx, &self.mtable, do_alloc, false);
        (tx.cursor_at(self.btable.tail_idx()), size)
    }

    /// Claims (once per shard) a liveness slot and pins the tx block the
    /// calling thread is about to work behind.
    fn pin_tx_block(&self, cursor: &TxCursor) {
        let shard = thread_ordinal() % NUM_ALLOCATOR_SHARDS;
        let mut slot = self.shard_slots[shard].load(Ordering::Acquire);
        if slot == NO_SLOT {
            let claimed = self.shm.alloc_per_thread_data();
            match self.shard_slots[shard].compare_exchange(
                NO_SLOT,
                claimed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => slot = claimed,
                Err(existing) => {
                    self.shm.per_thread(claimed).release();
                    slot = existing;
                }
            }
        }
        self.shm.per_thread(slot).set_tx_block_idx(cursor.idx.block);
    }

    // ------------------------------------------------------------------
    // positional reads and writes
    // ------------------------------------------------------------------

    /// POSIX `pread`: never moves the shared offset.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> OpResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_readable()?;
        self.sync_btable(false);
        let fsize = self.btable.file_size();
        if offset >= fsize {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(fsize - offset) as usize;
        self.read_range(&mut buf[..count], offset);
        Ok(count)
    }

    /// POSIX `pwrite`: never moves the shared offset.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> OpResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_writable()?;
        offset
            .checked_add(buf.len() as u64)
            .ok_or(FsError::BadArgument("offset + count overflows"))?;

        let mut done = 0usize;
        while done < buf.len() {
            let chunk = (buf.len() - done).min(MAX_TX_BYTES as usize);
            self.write_tx(&buf[done..done + chunk], offset + done as u64)?;
            done += chunk;
        }
        self.sync_btable(false);
        Ok(buf.len())
    }

    // ------------------------------------------------------------------
    // shared-offset reads and writes
    // ------------------------------------------------------------------

    /// POSIX `read`: consumes the shared offset in ticket order.
    pub fn read(&self, buf: &mut [u8]) -> OpResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_readable()?;

        let (old, ticket, count, key) = {
            let guard = self.meta().lock();
            let tx = TxMgr::new(&self.mtable, &self.shards);
            let fsize = self.btable.update(&tx, &self.mtable, false, false);
            let mut count = buf.len() as u64;
            let (old, ticket) = self.offset_mgr.acquire_offset(&mut count, fsize, true);
            let key = tx.cursor_at(self.btable.tail_idx()).order_key();
            drop(guard);
            (old, ticket, count as usize, key)
        };

        if count > 0 {
            self.read_range(&mut buf[..count], old);
        }
        // keep the handoff chain moving even for reads
        self.offset_mgr.wait_offset(ticket);
        self.offset_mgr.release_offset(ticket, key);
        Ok(count)
    }

    /// POSIX `write`: moves the shared offset; with O_APPEND every write
    /// lands at the current end of file.
    pub fn write(&self, buf: &[u8]) -> OpResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.check_writable()?;
        if buf.len() as u64 > MAX_TX_BYTES {
            return Err(FsError::BadArgument("shared-offset write too large for one tx"));
        }

        let (old, ticket) = {
            let guard = self.meta().lock();
            let tx = TxMgr::new(&self.mtable, &self.shards);
            let fsize = self.btable.update(&tx, &self.mtable, true, false);
            if self.flags & libc::O_APPEND != 0 {
                self.offset_mgr.seek_absolute(fsize);
            }
            let mut count = buf.len() as u64;
            let (old, ticket) = self.offset_mgr.acquire_offset(&mut count, fsize, false);
            drop(guard);
            (old, ticket)
        };

        // a commit that lands before the predecessor's in tx order would let
        // a crash prefix drop the predecessor's bytes from a co-written
        // block, so the whole copy-on-write runs again with updated state
        // until the orders agree
        let cursor = loop {
            let cursor = match self.write_tx(buf, old) {
                Ok(c) => c,
                Err(e) => {
                    // unblock successors; the no-commit key imposes no
                    // ordering, so the failed ticket never forces a redo
                    self.offset_mgr.release_offset(ticket, OffsetMgr::NO_COMMIT_KEY);
                    return Err(e);
                }
            };
            if self.offset_mgr.validate_offset(ticket, cursor.order_key()) {
                break cursor;
            }
        };
        self.offset_mgr.release_offset(ticket, cursor.order_key());

        self.sync_btable(false);
        Ok(buf.len())
    }

    /// POSIX `lseek` on the shared offset.
    pub fn lseek(&self, offset: i64, whence: i32) -> OpResult<u64> {
        let _guard = self.meta().lock();
        match whence {
            libc::SEEK_SET => {
                if offset < 0 {
                    return Err(FsError::BadArgument("negative absolute offset"));
                }
                Ok(self.offset_mgr.seek_absolute(offset as u64))
            }
            libc::SEEK_CUR => self.offset_mgr.seek_relative(offset),
            libc::SEEK_END => {
                let tx = TxMgr::new(&self.mtable, &self.shards);
                let fsize = self.btable.update(&tx, &self.mtable, false, false) as i64;
                let target = fsize
                    .checked_add(offset)
                    .ok_or(FsError::BadArgument("offset overflow"))?;
                if target < 0 {
                    return Err(FsError::BadArgument("negative resulting offset"));
                }
                Ok(self.offset_mgr.seek_absolute(target as u64))
            }
            _ => Err(FsError::BadArgument("unsupported whence")),
        }
    }

    /// POSIX `fstat`: the base stat with size and block counts replayed
    /// from the log.
    pub fn fstat(&self, st: &mut libc::stat) {
        self.sync_btable(false);
        let fsize = self.btable.file_size();
        *st = self.base_stat;
        st.st_size = fsize as libc::off_t;
        st.st_blksize = BLOCK_SIZE as libc::blksize_t;
        // 512-byte units, one image block per touched virtual block
        st.st_blocks = (fsize.div_ceil(BLOCK_SIZE as u64) * (BLOCK_SIZE as u64 / 512))
            as libc::blkcnt_t;
    }

    // ------------------------------------------------------------------
    // core copy-on-write machinery
    // ------------------------------------------------------------------

    fn check_writable(&self) -> OpResult<()> {
        if self.flags & libc::O_ACCMODE == libc::O_RDONLY {
            return Err(FsError::BadArgument("file not open for writing"));
        }
        Ok(())
    }

    fn check_readable(&self) -> OpResult<()> {
        if self.flags & libc::O_ACCMODE == libc::O_WRONLY {
            return Err(FsError::BadArgument("file not open for reading"));
        }
        Ok(())
    }

    /// Copies `[offset, offset + buf.len())` out of the committed image.
    /// Unmapped blocks read as zeros.
    fn read_range(&self, buf: &mut [u8], offset: u64) {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let vblk = VirtualBlockIdx::from_offset(pos);
            let in_block = (pos - vblk.byte_offset()) as usize;
            let n = (BLOCK_SIZE - in_block).min(buf.len() - done);

            let lblk = self.btable.get(vblk);
            if lblk.is_none() {
                buf[done..done + n].fill(0);
            } else {
                // SAFETY: committed data blocks are immutable and mapped.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.mtable.block(lblk).add(in_block).cast_const(),
                        buf[done..].as_mut_ptr(),
                        n,
                    );
                }
            }
            done += n;
        }
    }

    /// One atomic copy-on-write transaction over `[offset, offset+len)`.
    /// Returns the cursor of the landed commit.
    ///
    /// Concurrent commits may land on a co-written boundary block between
    /// the mapping snapshot and our own commit; their bytes would be
    /// missing from our shadow copy and lost when replay prefers the later
    /// entry. After committing we scan that window, and if any entry
    /// touched our block range the whole copy runs again from the updated
    /// mapping. The superseded entry stays in the log and is harmless:
    /// replay overwrites it with the redone one.
    fn write_tx(&self, buf: &[u8], offset: u64) -> OpResult<TxCursor> {
        let begin_v = VirtualBlockIdx::from_offset(offset);
        let end = offset + buf.len() as u64;
        let end_v_excl = end.div_ceil(BLOCK_SIZE as u64);
        if end_v_excl > (BLK_TABLE_NUM_SEGMENTS * BLK_TABLE_SEGMENT_SIZE) as u64 {
            return Err(FsError::BadArgument("offset beyond supported file size"));
        }
        let total_blocks = (end_v_excl - begin_v.0 as u64) as u32;

        loop {
            // keep the mapping fresh so boundary copies see committed
            // content, and pin our position for the garbage collector
            let (snapshot, _) = self.sync_btable(true);
            self.pin_tx_block(&snapshot);

            // reserve contiguous runs of at most 64 blocks
            let mut runs: SmallVec<[(LogicalBlockIdx, u32); 4]> = SmallVec::new();
            let mut left = total_blocks;
            while left > 0 {
                let want = left.min(MAX_BLOCKS_PER_ALLOC);
                let run =
                    match self.shards.mine().lock().alloc(want, &BitmapView::new(&self.mtable)) {
                        Ok(run) => run,
                        Err(e) => {
                            self.give_back(&runs);
                            return Err(e);
                        }
                    };
                runs.push((run, want));
                left -= want;
            }

            self.fill_shadow(buf, offset, begin_v, total_blocks, &runs);
            let raw_entry = match self.build_entry(begin_v, end, total_blocks, &runs) {
                Ok(raw) => raw,
                Err(e) => {
                    self.give_back(&runs);
                    return Err(e);
                }
            };

            let mut cursor = snapshot;
            let tx = TxMgr::new(&self.mtable, &self.shards);
            if let Err(e) = tx.try_commit(raw_entry, &mut cursor, true) {
                self.give_back(&runs);
                return Err(e);
            }

            // fold our own commit in before anything else
            {
                let _guard = self.meta().lock();
                self.btable.update(&tx, &self.mtable, false, false);
            }

            if !self.range_dirtied(&tx, snapshot, &cursor, begin_v, total_blocks) {
                return Ok(cursor);
            }
            log::trace!("concurrent commit overlapped {}..+{}; redoing", begin_v, total_blocks);
        }
    }

    /// Whether any entry committed in `(from, to)` maps a block in
    /// `[begin_v, begin_v + n)`.
    fn range_dirtied(
        &self,
        tx: &TxMgr<'_>,
        from: TxCursor,
        to: &TxCursor,
        begin_v: VirtualBlockIdx,
        n: u32,
    ) -> bool {
        let mut c = from;
        loop {
            if tx.handle_idx_overflow(&mut c, false).is_err() {
                return false;
            }
            if c.order_key() >= to.order_key() {
                return false;
            }
            let raw = tx.get_entry(&c);
            if raw == 0 {
                return false;
            }
            if self.entry_overlaps(TxEntry::decode(raw), begin_v, n) {
                return true;
            }
            c.idx.local += 1;
        }
    }

    fn entry_overlaps(&self, entry: TxEntry, begin_v: VirtualBlockIdx, n: u32) -> bool {
        let intersects = |v: VirtualBlockIdx, len: u32| {
            v.0 < begin_v.0 + n && begin_v.0 < v.0 + len
        };
        match entry {
            TxEntry::Inline {
                virtual_idx,
                num_blocks,
                ..
            } => intersects(virtual_idx, num_blocks),
            TxEntry::Indirect(log_idx) => {
                // SAFETY: redo blocks referenced by committed entries are
                // immutable and inside the mapping.
                let block = unsafe {
                    &*self
                        .mtable
                        .block(log_idx.block)
                        .cast_const()
                        .cast::<crate::layout::RedoLogBlock>()
                };
                let mut local = log_idx.local as usize;
                loop {
                    let e = block.entry(local);
                    if intersects(e.virtual_idx(), e.num_blocks()) {
                        return true;
                    }
                    if !e.has_next() {
                        return false;
                    }
                    local += 1;
                }
            }
        }
    }

    /// Lays the user bytes plus copied boundary bytes into the freshly
    /// allocated runs and persists them.
    fn fill_shadow(
        &self,
        buf: &[u8],
        offset: u64,
        begin_v: VirtualBlockIdx,
        total_blocks: u32,
        runs: &[(LogicalBlockIdx, u32)],
    ) {
        let head = (offset - begin_v.byte_offset()) as usize;
        let end_in_last = ((offset + buf.len() as u64 - 1) % BLOCK_SIZE as u64) as usize + 1;

        let mut block_no = 0u32;
        for &(run_base, run_len) in runs {
            let run_bytes = (run_len as usize) << BLOCK_SHIFT;
            let dst = self.mtable.block(run_base);

            for j in 0..run_len {
                let i = block_no + j;
                let vblk = begin_v.offset(i);
                // SAFETY: the run is freshly allocated and unpublished; we
                // have exclusive access to its blocks.
                let block = unsafe {
                    std::slice::from_raw_parts_mut(dst.add((j as usize) << BLOCK_SHIFT), BLOCK_SIZE)
                };

                let from = if i == 0 { head } else { 0 };
                let to = if i == total_blocks - 1 { end_in_last } else { BLOCK_SIZE };

                if from > 0 {
                    self.copy_committed(block, vblk, 0, from);
                }
                let src_base = (vblk.byte_offset() + from as u64 - offset) as usize;
                block[from..to].copy_from_slice(&buf[src_base..src_base + (to - from)]);
                if to < BLOCK_SIZE {
                    self.copy_committed(block, vblk, to, BLOCK_SIZE);
                }
            }

            // SAFETY: dst spans run_bytes of mapped image.
            unsafe { pmem::persist(dst, run_bytes) };
            block_no += run_len;
        }
        pmem::fence();
    }

    /// Copies `[from, to)` of the committed version of `vblk` into the
    /// shadow block; holes read as zeros.
    fn copy_committed(&self, block: &mut [u8], vblk: VirtualBlockIdx, from: usize, to: usize) {
        let old = self.btable.get(vblk);
        if old.is_none() {
            block[from..to].fill(0);
        } else {
            // SAFETY: committed data blocks are immutable and mapped.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.mtable.block(old).add(from).cast_const(),
                    block[from..].as_mut_ptr(),
                    to - from,
                );
            }
        }
    }

    /// Encodes the commit: inline for a single-block write whose indices
    /// fit, indirect through the redo log otherwise.
    fn build_entry(
        &self,
        begin_v: VirtualBlockIdx,
        end: u64,
        total_blocks: u32,
        runs: &[(LogicalBlockIdx, u32)],
    ) -> OpResult<u64> {
        let size_from_begin = (end - begin_v.byte_offset()) as u32;
        let last_remaining = (total_blocks << BLOCK_SHIFT) - size_from_begin;

        if total_blocks == 1
            && TxEntry::fits_inline(begin_v, runs[0].0, total_blocks, last_remaining)
        {
            return Ok(TxEntry::Inline {
                virtual_idx: begin_v,
                logical_idx: runs[0].0,
                num_blocks: total_blocks,
                last_remaining,
            }
            .encode());
        }

        let mut entries: SmallVec<[LogEntry; 4]> = SmallVec::new();
        let mut v = begin_v;
        for (i, &(run_base, run_len)) in runs.iter().enumerate() {
            let run_end = (v.byte_offset() + ((run_len as u64) << BLOCK_SHIFT)).min(end);
            let mut e = LogEntry::overwrite(v, run_base, (run_end - v.byte_offset()) as u32);
            if i + 1 < runs.len() {
                e = e.with_has_next();
            }
            entries.push(e);
            v = v.offset(run_len);
        }

        let log_idx = self.redo.append(&entries, &self.mtable, &self.shards)?;
        Ok(TxEntry::Indirect(log_idx).encode())
    }

    fn give_back(&self, runs: &[(LogicalBlockIdx, u32)]) {
        let mut shard = self.shards.mine().lock();
        for &(base, len) in runs {
            shard.free(base, len);
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // return local free lists so bitmap bits only cover reachable blocks
        self.shards.return_all(&BitmapView::new(&self.mtable));
        for slot in &self.shard_slots {
            let idx = slot.load(Ordering::Acquire);
            if idx != NO_SLOT {
                self.shm.per_thread(idx).release();
            }
        }
    }
}
