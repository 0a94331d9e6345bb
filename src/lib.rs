//! # ulayfs: log-structured files on persistent memory
//!
//! A user-level file layer that serves POSIX-style file I/O from a
//! memory-mapped, byte-addressable image, bypassing the kernel on the hot
//! path while keeping conventional file semantics. The hosting shim hands
//! this crate a file descriptor; everything else (allocation, transactions,
//! recovery, cross-process coordination) happens here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Registry (fd → File, generations)      │
//! ├──────────────────────────────────────────────┤
//! │   File façade (read/write/pread/pwrite/...)   │
//! ├──────────────┬────────────────┬──────────────┤
//! │  OffsetMgr   │     TxMgr      │   BlkTable   │
//! ├──────────────┴───────┬────────┴──────────────┤
//! │  Allocator shards    │   RedoLog manager     │
//! ├──────────────────────┴───────────────────────┤
//! │   MemTable (regions)  │  ShmMgr (/dev/shm)   │
//! ├──────────────────────────────────────────────┤
//! │     4 KiB block image on PMEM (mmap)         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Commit Protocol
//!
//! Every write is copy-on-write into freshly allocated blocks. The ordering
//! contract is: payload bytes → cache-line flush + fence → (redo entries →
//! fence, if indirect) → one 8-byte release-CAS into the tx log. That final
//! store is both the linearization point and the durability point; replay
//! of the tx log reconstructs the mapping and the file size after any
//! crash prefix.
//!
//! ## Lifecycle
//!
//! The hosting process calls [`init`] once (environment options, logging),
//! routes `open` through [`Registry::open`], and calls
//! [`Registry::shutdown`] before unloading. There is deliberately no
//! implicit constructor-time global setup.

pub mod alloc;
pub mod btable;
pub mod config;
pub mod error;
pub mod file;
pub mod idx;
pub mod layout;
pub mod mtable;
pub mod offset;
pub mod pmem;
pub mod redo;
pub mod registry;
pub mod shm;
pub mod tx;

use std::sync::OnceLock;

pub use error::{FsError, OpResult};
pub use file::{File, OpenOutcome};
pub use registry::{Handle, Opened, Registry};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Explicit library initialization: reads the runtime options from the
/// environment, installs the logger and returns the process-wide registry.
/// Idempotent; replaces any reliance on loader constructor ordering.
pub fn init() -> &'static Registry {
    GLOBAL.get_or_init(|| {
        config::init_runtime();
        Registry::new()
    })
}

/// Tears down every managed file in the process-wide registry. The shim
/// calls this from its unload hook.
pub fn shutdown() {
    if let Some(reg) = GLOBAL.get() {
        reg.shutdown();
    }
}
