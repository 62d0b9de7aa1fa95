//! Instrumented block device for unit tests: records every transfer and can
//! inject write faults.

use destage_block::{BlockDevice, MemBlockDevice};
use destage_error::{DestageError, Result};
use destage_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultMode {
    None,
    /// Every write fails.
    AllWrites,
    /// Grouped writes (count > 1) fail; single-block writes fail only for
    /// the given block.
    GroupedAndBlock(u64),
}

#[derive(Debug)]
pub(crate) struct ObservedDevice {
    inner: MemBlockDevice,
    writes: Mutex<Vec<(u64, u32)>>,
    reads: AtomicUsize,
    fault: Mutex<FaultMode>,
}

impl ObservedDevice {
    pub(crate) fn new(inner: MemBlockDevice) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            fault: Mutex::new(FaultMode::None),
        }
    }

    pub(crate) fn set_fault(&self, mode: FaultMode) {
        *self.fault.lock() = mode;
    }

    /// Every write attempt as `(start_block, count)`, in issue order.
    pub(crate) fn write_log(&self) -> Vec<(u64, u32)> {
        self.writes.lock().clone()
    }

    pub(crate) fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn inner(&self) -> &MemBlockDevice {
        &self.inner
    }

    fn should_fail(&self, start: BlockNumber, count: u32) -> bool {
        match *self.fault.lock() {
            FaultMode::None => false,
            FaultMode::AllWrites => true,
            FaultMode::GroupedAndBlock(block) => count > 1 || start.0 == block,
        }
    }
}

impl BlockDevice for ObservedDevice {
    fn read_blocks(&self, start: BlockNumber, count: u32, out: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_blocks(start, count, out)
    }

    fn write_blocks(&self, start: BlockNumber, count: u32, data: &[u8]) -> Result<()> {
        self.writes.lock().push((start.0, count));
        if self.should_fail(start, count) {
            return Err(DestageError::Device {
                block: start.0,
                detail: "injected fault".to_owned(),
            });
        }
        self.inner.write_blocks(start, count, data)
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }
}
