#![forbid(unsafe_code)]
//! Block-level write caching for embedded storage stacks.
//!
//! Sits between a file-system volume driver and a raw block-device
//! transport, absorbing repeated writes and grouping scattered writes into
//! contiguous multi-block transfers. Two cooperating components per device:
//!
//! - [`BlockCache`] — fixed-slot LRU cache with dirty tracking, low/high
//!   flush thresholds, and a per-device background flush worker driven by an
//!   idle timer and explicit flush signals.
//! - [`WriteCoalescer`] — block-number-sorted buffer of dirty blocks that
//!   discovers maximal runs of consecutive block numbers and issues each as
//!   one grouped transfer through a fixed staging buffer.
//!
//! [`CacheManager`] owns the per-device registry and the shared
//! [`IoErrorLog`], where flush-path device failures land (background flushes
//! have no caller to report to).
//!
//! All state is in memory; nothing here survives power loss. The cache
//! trades durability for bounded memory and device wear: data that cannot be
//! flushed after the single-block fallback pass is reported and dropped.

mod cache;
mod coalesce;
mod errlog;
mod flusher;
mod lru;
mod manager;
#[cfg(test)]
mod testutil;

pub use cache::{BlockCache, CacheMetrics};
pub use coalesce::{STAGING_RUN_BLOCKS, WriteCoalescer};
pub use errlog::{IoErrorEntry, IoErrorLog};
pub use manager::{CacheManager, DEFAULT_ERROR_LOG_CAPACITY};

pub use destage_error::{DestageError, Result};
pub use destage_types::{
    BlockNumber, BlockSize, CacheConfig, CoalesceConfig, DeviceId, IoOperation, ThresholdFlush,
};
