//! # Configuration Module
//!
//! Centralizes the layout constants and the runtime options recognized at
//! process start. Constants live in [`constants`] with their dependency
//! relationships documented and enforced; runtime options are read from the
//! environment exactly once, when [`crate::init`] is called.
//!
//! ## Runtime Options
//!
//! | Variable | Effect |
//! |---|---|
//! | `ULAYFS_SHOW_CONFIG` | dump build + runtime configuration to stderr |
//! | `ULAYFS_LOG_FILE` | redirect internal logs to the given file |
//! | `ULAYFS_STRICT_OFFSET_SERIAL` | `0` relaxes shared-offset serialization |

pub mod constants;
pub use constants::*;

use std::path::PathBuf;
use std::sync::OnceLock;

/// Options read from the environment at [`crate::init`] time.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Dump build + runtime configuration to stderr on init.
    pub show_config: bool,

    /// Redirect internal logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,

    /// When true (the default), shared-offset operations are serialized
    /// against the tx log so their queue order matches commit order.
    pub strict_offset_serial: bool,
}

impl RuntimeOptions {
    fn from_env() -> Self {
        Self {
            show_config: env_flag("ULAYFS_SHOW_CONFIG", false),
            log_file: std::env::var_os("ULAYFS_LOG_FILE").map(PathBuf::from),
            strict_offset_serial: env_flag("ULAYFS_STRICT_OFFSET_SERIAL", true),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.as_str(), "" | "0" | "false" | "no"),
        Err(_) => default,
    }
}

static OPTIONS: OnceLock<RuntimeOptions> = OnceLock::new();

/// The process-wide runtime options. Reads the environment on first use so
/// tests and embedders that never call [`crate::init`] still get defaults.
pub fn options() -> &'static RuntimeOptions {
    OPTIONS.get_or_init(RuntimeOptions::from_env)
}

/// Installs the logger and honors `show_config`. Called from [`crate::init`];
/// safe to call more than once.
pub fn init_runtime() {
    let opts = options();

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = &opts.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => {
                builder.target(env_logger::Target::Pipe(Box::new(f)));
            }
            Err(e) => eprintln!("ulayfs: cannot open log file {}: {}", path.display(), e),
        }
    }
    // a logger may already be installed by the host process
    let _ = builder.try_init();

    if opts.show_config {
        eprintln!(
            "ulayfs {}: block_size={} bitmap_blocks={} capacity_blocks={} \
             grow_unit={} shm_size={} strict_offset_serial={}",
            env!("CARGO_PKG_VERSION"),
            BLOCK_SIZE,
            DEFAULT_NUM_BITMAP_BLOCKS,
            TOTAL_NUM_BITMAP_BITS,
            GROW_UNIT_BYTES,
            SHM_SIZE,
            opts.strict_offset_serial,
        );
    }
}
