//! # On-PMEM Block Layout
//!
//! Every block in the image is exactly 4 KiB and is one of five flavors:
//!
//! ```text
//! Idx: 0          1..=num_bitmap_blocks              on demand
//! +----------+----------+----------+----------+----------+----------+----
//! |   Meta   | Bitmap 1 |   ...    | Bitmap N | Data/Tx/Redo blocks ...
//! +----------+----------+----------+----------+----------+----------+----
//! ```
//!
//! - [`MetaBlock`]: magic, version, size hint, lock word, inline bitmap
//!   words, inline tx slots.
//! - [`BitmapBlock`]: 512 allocation words, CAS-mutated by any thread.
//! - [`TxLogBlock`]: linked tx-log ring continuation, 510 CAS-append slots.
//! - [`RedoLogBlock`]: 256 immutable 16-byte mapping deltas.
//! - Data blocks: opaque 4 KiB payload, written once before commit.
//!
//! ## Mutability Model
//!
//! Fields that are CAS'd or store-released in place (tx slots, bitmap words,
//! the lock word, chain links) are declared as atomics and accessed through
//! shared references projected out of the mapping. Fields written exactly
//! once before a block is published (headers, redo entries, data payload)
//! are plain bytes initialized through raw pointers and persisted before the
//! publishing store. All multi-byte integers are little-endian; this crate
//! only targets little-endian hosts for direct field access.

mod bitmap;
mod meta;
mod redo_log;
mod tx_log;

pub use bitmap::{alloc_batch, alloc_run, clear_run, set_run, BitmapBlock};
pub use meta::{MetaBlock, MetaLockGuard};
pub use redo_log::{LogEntry, RedoLogBlock, LOG_OP_HAS_NEXT, LOG_OP_OVERWRITE};
pub use tx_log::{try_commit_in, TxLogBlock};

const _: () = assert!(cfg!(target_endian = "little"), "image layout is little-endian");
