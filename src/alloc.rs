//! # Block Allocation
//!
//! Allocation is two-level. The global level is the bitmap region (inline
//! words in the meta block plus the reserved bitmap blocks), mutated only by
//! CAS so any thread in any process can claim blocks without locking. The
//! local level is a per-shard [`Allocator`] holding a private free list and
//! a search hint; the hot path touches no shared state until the free list
//! runs dry.
//!
//! Shards stand in for per-thread ownership: each OS thread hashes to one
//! shard by a process-local ordinal, so an uncontended acquire is the common
//! case and two threads never interleave on one free list.
//!
//! Runs never cross a 64-block alignment group. This keeps every claim and
//! every return a single-word CAS and bounds free-list fragmentation: a run
//! is at most 64 blocks (256 KiB), the cap of a single allocation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::config::{
    BITS_PER_BITMAP_BLOCK, MAX_BLOCKS_PER_ALLOC, NUM_ALLOCATOR_SHARDS, NUM_BITMAP_WORDS,
    NUM_INLINE_BITMAP_BITS, NUM_INLINE_BITMAP_WORDS,
};
use crate::error::{FsError, OpResult};
use crate::idx::{BitmapBlockId, LogicalBlockIdx};
use crate::layout::{alloc_batch, alloc_run, clear_run, set_run, BitmapBlock};
use crate::mtable::MemTable;

/// Process-local dense thread ordinal, used to pick an allocator shard and
/// a shared-memory liveness slot.
pub(crate) fn thread_ordinal() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ORDINAL: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ORDINAL.with(|o| *o)
}

/// Read-side view over the bitmap region of one image.
pub struct BitmapView<'a> {
    mtable: &'a MemTable,
    num_bitmap_blocks: u32,
}

impl<'a> BitmapView<'a> {
    pub fn new(mtable: &'a MemTable) -> BitmapView<'a> {
        BitmapView {
            mtable,
            num_bitmap_blocks: mtable.meta().num_bitmap_blocks(),
        }
    }

    /// Bitmap regions: the inline words plus each reserved bitmap block.
    pub fn num_ids(&self) -> u32 {
        1 + self.num_bitmap_blocks
    }

    /// Words in the given region.
    pub fn words_in(&self, id: BitmapBlockId) -> usize {
        if id == 0 {
            NUM_INLINE_BITMAP_WORDS
        } else {
            NUM_BITMAP_WORDS
        }
    }

    /// First block index tracked by the given region.
    fn bit_base(&self, id: BitmapBlockId) -> usize {
        if id == 0 {
            0
        } else {
            NUM_INLINE_BITMAP_BITS + (id as usize - 1) * BITS_PER_BITMAP_BLOCK
        }
    }

    fn word(&self, id: BitmapBlockId, word_idx: usize) -> &AtomicU64 {
        if id == 0 {
            &self.mtable.meta().inline_bitmap_words()[word_idx]
        } else {
            // SAFETY: blocks 1..=num_bitmap_blocks are bitmap blocks by the
            // image format; the cast target is all-atomic.
            let block =
                unsafe { &*self.mtable.block(LogicalBlockIdx(id)).cast::<BitmapBlock>() };
            &block.words()[word_idx]
        }
    }

    /// (region, word, bit) coordinates of a block index.
    fn locate(&self, idx: LogicalBlockIdx) -> (BitmapBlockId, usize, u32) {
        let bit = idx.0 as usize;
        if bit < NUM_INLINE_BITMAP_BITS {
            (0, bit / 64, (bit % 64) as u32)
        } else {
            let rel = bit - NUM_INLINE_BITMAP_BITS;
            (
                1 + (rel / BITS_PER_BITMAP_BLOCK) as u32,
                (rel % BITS_PER_BITMAP_BLOCK) / 64,
                (rel % 64) as u32,
            )
        }
    }

    /// Marks `[idx, idx + n)` used; run may span words. Rebuild path.
    pub fn mark_used(&self, idx: LogicalBlockIdx, n: u32) {
        let mut start = idx;
        let mut left = n;
        while left > 0 {
            let (id, word_idx, bit) = self.locate(start);
            let in_word = (64 - bit).min(left);
            set_run(self.word(id, word_idx), bit, in_word);
            start = start.offset(in_word);
            left -= in_word;
        }
    }

    /// Clears `[idx, idx + n)`; the run must lie within one word, which
    /// holds for every run handed out by the allocator.
    pub fn release(&self, idx: LogicalBlockIdx, n: u32) {
        let (id, word_idx, bit) = self.locate(idx);
        debug_assert!(bit + n <= 64, "allocator runs never cross a word");
        clear_run(self.word(id, word_idx), bit, n);
    }

    /// Zeroes every bitmap word and re-marks the statically placed blocks
    /// (meta plus the bitmap blocks themselves). First-mount rebuild.
    pub fn reset(&self) {
        for id in 0..self.num_ids() {
            for w in 0..self.words_in(id) {
                self.word(id, w).store(0, Ordering::Relaxed);
            }
        }
        self.mark_used(LogicalBlockIdx(0), 1 + self.num_bitmap_blocks);
    }

    /// Copies the whole bitmap into `dst` (the shared-memory mirror).
    pub fn copy_to(&self, dst: &[AtomicU64]) {
        let mut out = 0;
        for id in 0..self.num_ids() {
            for w in 0..self.words_in(id) {
                dst[out].store(self.word(id, w).load(Ordering::Relaxed), Ordering::Relaxed);
                out += 1;
            }
        }
    }

    /// Whether a block is currently marked used. Test and dump aid.
    pub fn is_used(&self, idx: LogicalBlockIdx) -> bool {
        let (id, word_idx, bit) = self.locate(idx);
        self.word(id, word_idx).load(Ordering::Relaxed) & (1 << bit) != 0
    }
}

/// One shard's allocation state. The free list holds runs claimed from the
/// global bitmap and not yet handed out, sorted smallest first; with the
/// 64-block cap fragmentation stays low and a vector beats a tree.
pub struct Allocator {
    free_list: SmallVec<[(u32, LogicalBlockIdx); 16]>,
    recent_id: BitmapBlockId,
    recent_word: usize,
}

impl Allocator {
    pub fn new() -> Allocator {
        Allocator {
            free_list: SmallVec::new(),
            recent_id: 0,
            recent_word: 0,
        }
    }

    /// Allocates `n` physically contiguous blocks, 1 <= n <= 64.
    pub fn alloc(&mut self, n: u32, bitmap: &BitmapView) -> OpResult<LogicalBlockIdx> {
        debug_assert!(n >= 1 && n <= MAX_BLOCKS_PER_ALLOC);

        // smallest free-list run that fits
        if let Some(pos) = self.free_list.iter().position(|&(len, _)| len >= n) {
            let (len, idx) = self.free_list.remove(pos);
            if len > n {
                self.insert_run(len - n, idx.offset(n));
            }
            return Ok(idx);
        }

        self.claim_from_global(n, bitmap)
    }

    /// Returns `[idx, idx + n)` to the local free list, coalescing with
    /// neighbors in the same 64-block group.
    pub fn free(&mut self, idx: LogicalBlockIdx, n: u32) {
        let mut start = idx;
        let mut len = n;
        let group = idx.0 / 64;

        let mut i = 0;
        while i < self.free_list.len() {
            let (run_len, run_idx) = self.free_list[i];
            let same_group = run_idx.0 / 64 == group;
            if same_group && run_idx.0 + run_len == start.0 {
                start = run_idx;
                len += run_len;
                self.free_list.remove(i);
                continue;
            }
            if same_group && start.0 + len == run_idx.0 {
                len += run_len;
                self.free_list.remove(i);
                continue;
            }
            i += 1;
        }
        self.insert_run(len, start);
    }

    /// Flushes the local free list back to the global bitmap. Called on
    /// close and on explicit pressure.
    pub fn return_to_global(&mut self, bitmap: &BitmapView) {
        for (len, idx) in self.free_list.drain(..) {
            bitmap.release(idx, len);
        }
    }

    fn insert_run(&mut self, len: u32, idx: LogicalBlockIdx) {
        let at = self
            .free_list
            .iter()
            .position(|&(l, _)| l >= len)
            .unwrap_or(self.free_list.len());
        self.free_list.insert(at, (len, idx));
    }

    fn claim_from_global(&mut self, n: u32, bitmap: &BitmapView) -> OpResult<LogicalBlockIdx> {
        let num_ids = bitmap.num_ids();
        // one full lap over every word, starting at the hint
        let mut id = self.recent_id;
        let mut word_idx = self.recent_word;
        let mut visited = 0usize;
        let total_words: usize = (0..num_ids).map(|i| bitmap.words_in(i)).sum();

        while visited < total_words {
            if word_idx >= bitmap.words_in(id) {
                word_idx = 0;
                id = (id + 1) % num_ids;
                continue;
            }
            let word = bitmap.word(id, word_idx);
            let claimed = if n == MAX_BLOCKS_PER_ALLOC {
                alloc_batch(word).then_some(0)
            } else {
                alloc_run(word, n)
            };
            if let Some(bit) = claimed {
                let lblk = bitmap.bit_base(id) + word_idx * 64 + bit as usize;
                self.recent_id = id;
                self.recent_word = word_idx;
                return Ok(LogicalBlockIdx(lblk as u32));
            }
            word_idx += 1;
            visited += 1;
        }
        log::warn!("bitmap exhausted: no run of {} blocks", n);
        Err(FsError::NoSpace)
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-file shard set. A thread always reaches its own shard, so lock
/// acquisition is uncontended in steady state.
pub struct AllocatorShards {
    shards: Vec<CachePadded<Mutex<Allocator>>>,
}

#[repr(align(64))]
struct CachePadded<T>(T);

impl AllocatorShards {
    pub fn new() -> AllocatorShards {
        AllocatorShards {
            shards: (0..NUM_ALLOCATOR_SHARDS)
                .map(|_| CachePadded(Mutex::new(Allocator::new())))
                .collect(),
        }
    }

    /// The calling thread's shard.
    pub fn mine(&self) -> &Mutex<Allocator> {
        &self.shards[thread_ordinal() % NUM_ALLOCATOR_SHARDS].0
    }

    /// Flushes every shard's free list to the global bitmap.
    pub fn return_all(&self, bitmap: &BitmapView) {
        for shard in &self.shards {
            shard.0.lock().return_to_global(bitmap);
        }
    }
}

impl Default for AllocatorShards {
    fn default() -> Self {
        Self::new()
    }
}
