//! Operational error type for the POSIX-facing surface.
//!
//! Only errors that a caller can act on cross this boundary: allocation
//! exhaustion and argument validation. Mapping failures and replay
//! inconsistencies are fatal and panic at the point of detection, matching
//! the crash-consistency contract (a half-trusted image must never be
//! written to). A file that is not managed by this library is not an error
//! at all; lookups report it as `None` so the interposition layer can fall
//! through to the kernel.

use thiserror::Error;

/// Result alias for operations on a managed file.
pub type OpResult<T> = std::result::Result<T, FsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// The bitmap has no run large enough to service the request.
    #[error("no space left in block bitmap")]
    NoSpace,

    /// The tx log cannot accept another entry and the caller disallowed
    /// extending it. Never surfaces to the POSIX layer; commit paths retry
    /// with allocation enabled.
    #[error("transaction log is full")]
    TxFull,

    /// Invalid offset, length or whence.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
}

impl FsError {
    /// The errno a syscall-level caller should report.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NoSpace | FsError::TxFull => libc::ENOSPC,
            FsError::BadArgument(_) => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::BadArgument("x").errno(), libc::EINVAL);
        assert_eq!(FsError::TxFull.errno(), libc::ENOSPC);
    }
}
