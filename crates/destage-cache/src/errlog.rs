//! Fixed-size ring of asynchronous I/O failures.
//!
//! Flush-triggered device errors have no synchronous caller to report to, so
//! they are appended here for the application to inspect. The cache only
//! appends; consumers [`drain`](IoErrorLog::drain) or
//! [`snapshot`](IoErrorLog::snapshot). When the ring is full the oldest entry
//! is silently discarded.

use destage_error::DestageError;
use destage_types::{BlockNumber, IoOperation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::SystemTime;

/// One failed block transfer.
#[derive(Debug, Clone)]
pub struct IoErrorEntry {
    /// Transfer direction.
    pub operation: IoOperation,
    /// Block the failure was reported for.
    pub block: BlockNumber,
    /// When the failure was recorded.
    pub timestamp: SystemTime,
    /// Device-reported status as a POSIX errno.
    pub status: i32,
    /// Short device tag, e.g. `"3:"`.
    pub device: String,
}

/// Shared append-only error ring.
#[derive(Debug)]
pub struct IoErrorLog {
    entries: Mutex<VecDeque<IoErrorEntry>>,
    capacity: usize,
}

impl IoErrorLog {
    /// Create a ring holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a failure, discarding the oldest entry if the ring is full.
    pub fn record(
        &self,
        device: &str,
        operation: IoOperation,
        block: BlockNumber,
        error: &DestageError,
    ) {
        let status = error.to_errno();
        tracing::warn!(
            target: "destage::errlog",
            device,
            ?operation,
            block = block.0,
            status,
            error = %error,
            "io_error_recorded"
        );

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            let _ = entries.pop_front();
        }
        entries.push_back(IoErrorEntry {
            operation,
            block,
            timestamp: SystemTime::now(),
            status,
            device: device.to_owned(),
        });
    }

    /// Remove and return all recorded entries, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<IoErrorEntry> {
        self.entries.lock().drain(..).collect()
    }

    /// Copy of all recorded entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IoErrorEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error() -> DestageError {
        DestageError::Device {
            block: 0,
            detail: "test".into(),
        }
    }

    #[test]
    fn record_appends_with_errno_status() {
        let log = IoErrorLog::new(4);
        log.record("3:", IoOperation::Write, BlockNumber(9), &io_error());
        let entries = log.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].block, BlockNumber(9));
        assert_eq!(entries[0].status, libc::EIO);
        assert_eq!(entries[0].device, "3:");
    }

    #[test]
    fn full_ring_discards_oldest() {
        let log = IoErrorLog::new(3);
        for block in 0_u64..5 {
            log.record("0:", IoOperation::Write, BlockNumber(block), &io_error());
        }
        let blocks: Vec<u64> = log.snapshot().iter().map(|e| e.block.0).collect();
        assert_eq!(blocks, vec![2, 3, 4]);
    }

    #[test]
    fn drain_empties_the_ring() {
        let log = IoErrorLog::new(2);
        log.record("0:", IoOperation::Read, BlockNumber(1), &io_error());
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
        assert!(log.drain().is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let log = IoErrorLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.record("0:", IoOperation::Write, BlockNumber(1), &io_error());
        log.record("0:", IoOperation::Write, BlockNumber(2), &io_error());
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].block, BlockNumber(2));
    }
}
