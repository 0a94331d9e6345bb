//! # Layout and Runtime Constants
//!
//! This module centralizes every constant that defines the on-PMEM image
//! layout and the sizes of the in-DRAM coordination structures. Constants
//! that depend on each other are co-located and the derivations are enforced
//! through compile-time assertions, so a change to one cannot silently
//! invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (4096 bytes)
//!       │
//!       ├─> NUM_BITMAP_WORDS (BLOCK_SIZE / 8, words per bitmap block)
//!       │     └─> BITS_PER_BITMAP_BLOCK (words * 64)
//!       │
//!       ├─> NUM_TX_ENTRIES (tx slots per log block, after 16-byte header)
//!       │
//!       ├─> NUM_LOG_ENTRIES (redo entries per block, 16 bytes each)
//!       │
//!       └─> MetaBlock interior: 1 cache line of header
//!             + NUM_INLINE_BITMAP_WORDS words
//!             + NUM_INLINE_TX_ENTRIES slots == BLOCK_SIZE
//!
//! DEFAULT_NUM_BITMAP_BLOCKS (8)
//!       │
//!       ├─> TOTAL_NUM_BITMAP_BITS (inline bits + 8 bitmap blocks)
//!       │     └─> addressable image capacity (~1 GiB)
//!       │
//!       └─> SHM_SIZE (bitmap mirror + per-thread slots, block aligned)
//!
//! GROW_UNIT_BLOCKS (2048, 8 MiB)
//!       │
//!       └─> must cover meta + bitmap blocks + headroom so the first
//!           extension already holds every statically-placed block
//! ```
//!
//! ## Critical Invariants
//!
//! 1. Every block view is exactly `BLOCK_SIZE` bytes (asserted in `layout`).
//! 2. The inline tx-entry bit split sums to 63 bits plus the tag bit.
//! 3. `SHM_SIZE` is block aligned and covers mirror + thread slots.

/// Size of each block in bytes. This is the fundamental unit of allocation,
/// copy-on-write and mapping.
pub const BLOCK_SIZE: usize = 4096;

/// log2 of [`BLOCK_SIZE`], for offset/index conversions.
pub const BLOCK_SHIFT: usize = 12;

/// Cache line size assumed for padding and persist granularity.
pub const CACHELINE_SIZE: usize = 64;

const _: () = assert!(BLOCK_SIZE == 1 << BLOCK_SHIFT, "BLOCK_SHIFT derivation mismatch");

// ============================================================================
// BLOCK INTERIOR LAYOUTS
// Slot counts for each block flavor; each must tile BLOCK_SIZE exactly
// ============================================================================

/// 64-bit bitmap words per bitmap block.
pub const NUM_BITMAP_WORDS: usize = BLOCK_SIZE / 8;

/// Blocks tracked by one full bitmap block.
pub const BITS_PER_BITMAP_BLOCK: usize = NUM_BITMAP_WORDS * 64;

/// Header bytes at the head of a tx-log block (prev, next, seq, reserved).
pub const TX_BLOCK_HEADER_SIZE: usize = 16;

/// 8-byte tx-entry slots per tx-log block.
pub const NUM_TX_ENTRIES: usize = (BLOCK_SIZE - TX_BLOCK_HEADER_SIZE) / 8;

/// 16-byte redo-log entries per redo-log block.
pub const NUM_LOG_ENTRIES: usize = BLOCK_SIZE / 16;

/// Bitmap words stored inline in the meta block (3 cache lines).
pub const NUM_INLINE_BITMAP_WORDS: usize = 24;

/// Blocks tracked by the inline bitmap words.
pub const NUM_INLINE_BITMAP_BITS: usize = NUM_INLINE_BITMAP_WORDS * 64;

/// Tx-entry slots stored inline in the meta block (60 cache lines).
pub const NUM_INLINE_TX_ENTRIES: usize = 480;

const _: () = assert!(NUM_TX_ENTRIES == 510, "tx-log block does not tile BLOCK_SIZE");
const _: () = assert!(
    CACHELINE_SIZE + NUM_INLINE_BITMAP_WORDS * 8 + NUM_INLINE_TX_ENTRIES * 8 == BLOCK_SIZE,
    "meta block interior does not tile BLOCK_SIZE"
);

// ============================================================================
// IMAGE CAPACITY
// The bitmap region is sized at format time and fixes the image capacity
// ============================================================================

/// Bitmap blocks reserved by the formatter, directly after the meta block.
pub const DEFAULT_NUM_BITMAP_BLOCKS: usize = 8;

/// Total allocatable blocks: inline bits plus the reserved bitmap blocks.
pub const TOTAL_NUM_BITMAP_BITS: usize =
    NUM_INLINE_BITMAP_BITS + DEFAULT_NUM_BITMAP_BLOCKS * BITS_PER_BITMAP_BLOCK;

/// Bytes needed to mirror the whole bitmap in the shared segment.
pub const TOTAL_NUM_BITMAP_BYTES: usize = TOTAL_NUM_BITMAP_BITS / 8;

/// Blocks added to the backing file per extension. Must cover the meta block,
/// every reserved bitmap block and leave allocation headroom, so a freshly
/// formatted file is usable after a single extension.
pub const GROW_UNIT_BLOCKS: usize = 2048;

/// Bytes per extension of the backing file.
pub const GROW_UNIT_BYTES: usize = GROW_UNIT_BLOCKS * BLOCK_SIZE;

/// Upper bound on mapped regions; enough to map the whole addressable image.
pub const MAX_NUM_REGIONS: usize = TOTAL_NUM_BITMAP_BITS.div_ceil(GROW_UNIT_BLOCKS);

const _: () = assert!(
    GROW_UNIT_BLOCKS >= 1 + DEFAULT_NUM_BITMAP_BLOCKS + 64,
    "grow unit must cover meta + bitmap blocks + allocation headroom"
);

// ============================================================================
// ALLOCATION
// ============================================================================

/// Largest contiguous run a single allocation may request. Runs never cross
/// a 64-block alignment group, which keeps every run within one bitmap word.
pub const MAX_BLOCKS_PER_ALLOC: u32 = 64;

/// Allocator shards; each shard owns a private free list and search hint so
/// the hot path never contends.
pub const NUM_ALLOCATOR_SHARDS: usize = 16;

// ============================================================================
// TX ENTRY BIT SPLIT
// An inline commit packs all its fields into one 8-byte slot. The split is
// part of the persistent format and must stay stable across versions.
// ============================================================================

/// Bits for each of virtual_idx and logical_idx in an inline commit.
pub const TX_INLINE_IDX_BITS: u32 = 22;

/// Bits for num_blocks in an inline commit.
pub const TX_INLINE_NUM_BLOCKS_BITS: u32 = 6;

/// Bits for last_remaining in an inline commit.
pub const TX_INLINE_REMAINING_BITS: u32 = 12;

const _: () = assert!(
    1 + 2 * TX_INLINE_IDX_BITS + TX_INLINE_NUM_BLOCKS_BITS + TX_INLINE_REMAINING_BITS == 63,
    "inline tx entry bit split must leave exactly one reserved bit"
);

// ============================================================================
// OFFSET QUEUE
// ============================================================================

/// Ticket slots in the shared-offset handoff ring.
pub const NUM_OFFSET_QUEUE_SLOT: usize = 64;

// ============================================================================
// SHARED MEMORY SEGMENT
// One segment per backing file: bitmap mirror followed by per-thread slots
// ============================================================================

/// Per-thread slots in the shared segment.
pub const MAX_NUM_THREADS: usize = 128;

/// Bytes per per-thread slot; cache-line isolated.
pub const SHM_PER_THREAD_SIZE: usize = 128;

/// Name of the xattr on the backing file that records the shm path.
pub const SHM_XATTR_NAME: &str = "user.ulayfs.shm_path";

/// Maximum length of the recorded shm path, including the nul terminator.
pub const SHM_PATH_LEN: usize = 64;

/// Size of the shared segment, block aligned.
pub const SHM_SIZE: usize = (TOTAL_NUM_BITMAP_BYTES + MAX_NUM_THREADS * SHM_PER_THREAD_SIZE)
    .next_multiple_of(BLOCK_SIZE);

const _: () = assert!(SHM_SIZE % BLOCK_SIZE == 0, "shm segment must be block aligned");
const _: () = assert!(
    SHM_SIZE >= TOTAL_NUM_BITMAP_BYTES + MAX_NUM_THREADS * SHM_PER_THREAD_SIZE,
    "shm segment must cover mirror + thread slots"
);

// ============================================================================
// BLOCK TABLE
// ============================================================================

/// Entries per block-table segment (u32 each, 16 KiB per segment).
pub const BLK_TABLE_SEGMENT_SIZE: usize = 4096;

/// log2 of [`BLK_TABLE_SEGMENT_SIZE`].
pub const BLK_TABLE_SEGMENT_SHIFT: usize = 12;

/// Segments needed to map every allocatable block.
pub const BLK_TABLE_NUM_SEGMENTS: usize =
    TOTAL_NUM_BITMAP_BITS.div_ceil(BLK_TABLE_SEGMENT_SIZE);

const _: () = assert!(
    BLK_TABLE_SEGMENT_SIZE == 1 << BLK_TABLE_SEGMENT_SHIFT,
    "BLK_TABLE_SEGMENT_SHIFT derivation mismatch"
);

// ============================================================================
// FORMAT IDENTIFICATION
// ============================================================================

/// Magic bytes at the head of the meta block.
pub const FILE_MAGIC: [u8; 4] = *b"ULFS";

/// Persistent format version.
pub const FORMAT_VERSION: u32 = 1;
