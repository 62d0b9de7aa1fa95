#![forbid(unsafe_code)]
//! Error types for the destage cache stack.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Behavior |
//! |-------|----------|----------|
//! | Resource exhaustion | `PoolExhausted`, `CacheFull` | Returned to the caller immediately, never retried internally |
//! | Invalid argument | `InvalidArgument`, `InvalidGeometry` | Programmer/configuration errors, fail fast |
//! | Duplicate / absence | `Exists`, `NotFound` | Keep create/destroy/query idempotent-safe |
//! | Device I/O | `Io`, `Device` | Grouped transfers fall back once to per-block I/O; residual failures go to the error log |
//!
//! Crate-internal errors (`PoolError` in `destage-pool`, `ConfigError` in
//! `destage-types`) convert into `DestageError` at their crate boundaries;
//! this crate stays dependency-free toward the rest of the workspace so the
//! conversion direction can never cycle.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`DestageError::to_errno`]
//! for the volume-driver glue above the cache. The mapping is exhaustive (no
//! wildcard arms) so adding a variant is a compile error until its errno is
//! assigned.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum DestageError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The raw device reported a transfer failure at a known block.
    #[error("device error at block {block}: {detail}")]
    Device { block: u64, detail: String },

    /// A fixed slot pool has no free entries.
    ///
    /// Allocation never blocks; exhaustion is an immediate error so the hot
    /// write path keeps a bounded worst case.
    #[error("slot pool exhausted")]
    PoolExhausted,

    /// Every cache slot is occupied and none could be reclaimed.
    #[error("cache full: no slot could be freed")]
    CacheFull,

    /// One or more blocks could not be written during a synchronous flush.
    ///
    /// Per-block detail is in the error log; the failed blocks stay dirty
    /// and are retried on the next pass.
    #[error("flush incomplete: {failed} block(s) failed, see error log")]
    FlushIncomplete { failed: usize },

    /// Malformed request (zero-length transfer, misaligned buffer, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration or device geometry out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The device already has an attached cache.
    #[error("cache exists: {0}")]
    Exists(String),

    /// No cache is attached to the named device.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DestageError {
    /// Convert this error into a POSIX errno for the volume-driver glue.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `PoolExhausted` → `ENOMEM`: a bounded-resource failure, reported the
    ///   same way a heap allocation failure would be.
    /// - `CacheFull` → `EBUSY`: every slot is pinned dirty and unreclaimable;
    ///   callers fall back to direct device I/O rather than block.
    /// - `Device` → `EIO`: per-block transfer failures surface as plain I/O
    ///   errors; block detail lives in the error log.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. } | Self::FlushIncomplete { .. } => libc::EIO,
            Self::PoolExhausted => libc::ENOMEM,
            Self::CacheFull => libc::EBUSY,
            Self::InvalidArgument(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::Exists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Result alias using `DestageError`.
pub type Result<T> = std::result::Result<T, DestageError>;
