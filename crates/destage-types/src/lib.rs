#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Logical block address on a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Advance by `count` blocks, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Whether `other` is the block immediately following this one.
    #[must_use]
    pub fn is_successor(self, other: Self) -> bool {
        self.0.checked_add(1) == Some(other.0)
    }
}

/// Stable identifier for a mounted block device, assigned by the
/// volume-driver glue when the device is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Direction of a block transfer, as recorded in the I/O error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoOperation {
    Read,
    Write,
}

/// Validated device block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ConfigError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Byte length of `self` as a `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Convert a byte capacity to a whole number of blocks (truncating).
    #[must_use]
    pub fn bytes_to_blocks(self, bytes: u64) -> u64 {
        bytes / u64::from(self.0)
    }
}

/// When a write crosses the high dirty-block threshold, who runs the
/// threshold pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdFlush {
    /// The writing thread runs the pass before returning.
    #[default]
    Caller,
    /// The background flush worker is signalled and the write returns.
    Worker,
}

/// Settings for the multi-sector write coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalesceConfig {
    /// Number of blocks the coalescer may hold before threshold processing
    /// forces grouped writes out.
    pub capacity_blocks: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 32,
        }
    }
}

/// Configuration for a device cache, supplied by the volume-driver glue at
/// attach time.
///
/// `capacity_bytes` is fixed for the life of the cache; thresholds and the
/// idle-flush period may be changed later through the cache's own
/// reconfiguration entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total cache size in bytes; rounded down to whole blocks.
    pub capacity_bytes: u64,
    /// Dirty-block count at which a threshold pass stops draining.
    pub low_threshold: usize,
    /// Dirty-block count at which a threshold pass starts.
    pub high_threshold: usize,
    /// Idle period after which dirty blocks are flushed in the background.
    /// `None` disables the idle timer.
    pub idle_flush: Option<Duration>,
    /// Who runs the threshold pass when a write crosses `high_threshold`.
    pub threshold_flush: ThresholdFlush,
    /// Multi-sector coalescing; `None` sends flush I/O straight to the device.
    pub coalesce: Option<CoalesceConfig>,
}

impl CacheConfig {
    /// Validate against the device's block size, returning the slot count.
    pub fn validated_capacity(&self, block_size: BlockSize) -> Result<usize, ConfigError> {
        let blocks = block_size.bytes_to_blocks(self.capacity_bytes);
        if blocks == 0 {
            return Err(ConfigError::InvalidField {
                field: "capacity_bytes",
                reason: "smaller than one block",
            });
        }
        let blocks = usize::try_from(blocks).map_err(|_| ConfigError::InvalidField {
            field: "capacity_bytes",
            reason: "does not fit usize",
        })?;
        self.validate_thresholds(blocks)?;
        if let Some(coalesce) = &self.coalesce {
            if coalesce.capacity_blocks == 0 {
                return Err(ConfigError::InvalidField {
                    field: "coalesce.capacity_blocks",
                    reason: "must be at least 1",
                });
            }
        }
        Ok(blocks)
    }

    /// Validate only the threshold pair against a known slot count. Used by
    /// runtime reconfiguration, where capacity is already fixed.
    pub fn validate_thresholds(&self, capacity_blocks: usize) -> Result<(), ConfigError> {
        if self.low_threshold > self.high_threshold {
            return Err(ConfigError::InvalidField {
                field: "low_threshold",
                reason: "exceeds high_threshold",
            });
        }
        if self.high_threshold > capacity_blocks {
            return Err(ConfigError::InvalidField {
                field: "high_threshold",
                reason: "exceeds cache capacity",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity_bytes: u64, low: usize, high: usize) -> CacheConfig {
        CacheConfig {
            capacity_bytes,
            low_threshold: low,
            high_threshold: high,
            idle_flush: None,
            threshold_flush: ThresholdFlush::Caller,
            coalesce: None,
        }
    }

    #[test]
    fn block_size_accepts_powers_of_two_in_range() {
        for value in [512, 1024, 2048, 4096, 65536] {
            assert_eq!(BlockSize::new(value).unwrap().get(), value);
        }
    }

    #[test]
    fn block_size_rejects_out_of_range_and_non_power() {
        for value in [0, 1, 256, 600, 4097, 131_072] {
            assert!(BlockSize::new(value).is_err(), "{value} should be rejected");
        }
    }

    #[test]
    fn bytes_to_blocks_truncates() {
        let bs = BlockSize::new(512).unwrap();
        assert_eq!(bs.bytes_to_blocks(4096), 8);
        assert_eq!(bs.bytes_to_blocks(4097), 8);
        assert_eq!(bs.bytes_to_blocks(511), 0);
    }

    #[test]
    fn successor_detection() {
        assert!(BlockNumber(4).is_successor(BlockNumber(5)));
        assert!(!BlockNumber(4).is_successor(BlockNumber(6)));
        assert!(!BlockNumber(u64::MAX).is_successor(BlockNumber(0)));
    }

    #[test]
    fn config_computes_slot_count() {
        let bs = BlockSize::new(512).unwrap();
        let cfg = config(4096, 4, 8);
        assert_eq!(cfg.validated_capacity(bs).unwrap(), 8);
    }

    #[test]
    fn config_rejects_sub_block_capacity() {
        let bs = BlockSize::new(4096).unwrap();
        assert!(config(1024, 0, 0).validated_capacity(bs).is_err());
    }

    #[test]
    fn config_rejects_inverted_thresholds() {
        let bs = BlockSize::new(512).unwrap();
        assert!(config(4096, 6, 2).validated_capacity(bs).is_err());
    }

    #[test]
    fn config_rejects_threshold_above_capacity() {
        let bs = BlockSize::new(512).unwrap();
        assert!(config(4096, 4, 9).validated_capacity(bs).is_err());
    }

    #[test]
    fn config_rejects_zero_coalesce_capacity() {
        let bs = BlockSize::new(512).unwrap();
        let mut cfg = config(4096, 4, 8);
        cfg.coalesce = Some(CoalesceConfig { capacity_blocks: 0 });
        assert!(cfg.validated_capacity(bs).is_err());
    }
}
