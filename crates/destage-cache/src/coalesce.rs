//! Multi-sector write coalescer.
//!
//! Buffers dirty blocks in a circular, doubly linked list sorted strictly
//! ascending by block number (no duplicates — rewriting a buffered block
//! updates it in place), discovers maximal runs of consecutive block numbers,
//! and issues each run as one grouped device transfer through a fixed
//! staging buffer.
//!
//! The coalescer never caches on read: it exists purely to reorder and group
//! writes. Occupancy is bounded by low/high thresholds; crossing the high
//! mark drains the longest available runs until the low mark is reached.
//!
//! All list links are indices into a [`SlotPool`]; node structures and block
//! buffers come from two separate pools so buffers are recycled wholesale
//! while nodes churn.

use crate::errlog::IoErrorLog;
use destage_block::BlockDevice;
use destage_error::{DestageError, Result};
use destage_pool::SlotPool;
use destage_types::{BlockNumber, IoOperation};
use std::sync::Arc;

use crate::lru::NIL;

/// Maximum blocks per grouped transfer; sizes the fixed staging buffer.
///
/// Independent of the coalescer capacity — runs longer than this are issued
/// as repeated grouped calls.
pub const STAGING_RUN_BLOCKS: usize = 8;

/// Node in the sorted circular list. `buf` indexes the buffer pool.
#[derive(Debug, Clone, Copy)]
struct RunNode {
    block: u64,
    buf: usize,
    prev: usize,
    next: usize,
}

/// A discovered run: starting node index and length in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    pub(crate) start: usize,
    pub(crate) len: usize,
}

pub struct WriteCoalescer {
    device: Arc<dyn BlockDevice>,
    errors: Arc<IoErrorLog>,
    tag: String,
    nodes: SlotPool<RunNode>,
    buffers: SlotPool<Box<[u8]>>,
    head: usize,
    low_threshold: usize,
    high_threshold: usize,
    staging: Box<[u8]>,
    block_size: usize,
}

impl std::fmt::Debug for WriteCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("tag", &self.tag)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("low_threshold", &self.low_threshold)
            .field("high_threshold", &self.high_threshold)
            .finish_non_exhaustive()
    }
}

impl WriteCoalescer {
    /// Build a coalescer holding up to `capacity` blocks for `device`.
    ///
    /// Both pools and the staging buffer are sized up front; nothing is
    /// allocated on the write path. The high threshold is the full capacity;
    /// the low threshold leaves one staging buffer's worth of headroom.
    pub fn new(
        device: Arc<dyn BlockDevice>,
        capacity: usize,
        errors: Arc<IoErrorLog>,
        tag: String,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(DestageError::InvalidGeometry(
                "coalescer capacity must be at least 1 block".to_owned(),
            ));
        }
        let block_size = device.block_size().as_usize();
        Ok(Self {
            device,
            errors,
            tag,
            nodes: SlotPool::new_with(capacity, |_| RunNode {
                block: 0,
                buf: NIL,
                prev: NIL,
                next: NIL,
            }),
            buffers: SlotPool::new_with(capacity, |_| {
                vec![0_u8; block_size].into_boxed_slice()
            }),
            head: NIL,
            low_threshold: capacity.saturating_sub(STAGING_RUN_BLOCKS),
            high_threshold: capacity,
            staging: vec![0_u8; STAGING_RUN_BLOCKS * block_size].into_boxed_slice(),
            block_size,
        })
    }

    /// Read one block. Buffered data is served without touching the device;
    /// misses are forwarded as a single-block device read and are NOT cached.
    pub fn read(&self, block: BlockNumber, out: &mut [u8]) -> Result<()> {
        if out.len() != self.block_size {
            return Err(DestageError::InvalidArgument(format!(
                "read buffer size mismatch: got {}, expected {}",
                out.len(),
                self.block_size
            )));
        }
        if let Some(index) = self.lookup(block.0) {
            let buf = self.nodes.get(index).buf;
            out.copy_from_slice(self.buffers.get(buf));
            tracing::trace!(
                target: "destage::coalesce",
                device = %self.tag,
                block = block.0,
                "coalesce_read_hit"
            );
            return Ok(());
        }
        self.device.read_blocks(block, 1, out)
    }

    /// Buffer one block write.
    ///
    /// A block already buffered is overwritten in place. A new block claims a
    /// node and a buffer (failing with a capacity error when the pools are
    /// empty), is linked at its sorted position, and may trigger threshold
    /// processing.
    pub fn write(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size {
            return Err(DestageError::InvalidArgument(format!(
                "write buffer size mismatch: got {}, expected {}",
                data.len(),
                self.block_size
            )));
        }

        if let Some(index) = self.lookup(block.0) {
            let buf = self.nodes.get(index).buf;
            self.buffers.get_mut(buf).copy_from_slice(data);
            tracing::trace!(
                target: "destage::coalesce",
                device = %self.tag,
                block = block.0,
                "coalesce_write_update"
            );
            return Ok(());
        }

        let node = self
            .nodes
            .allocate()
            .map_err(|_| DestageError::PoolExhausted)?;
        let buf = match self.buffers.allocate() {
            Ok(buf) => buf,
            Err(_) => {
                // Roll the node back so the pools stay in lockstep.
                let _ = self.nodes.release(node);
                return Err(DestageError::PoolExhausted);
            }
        };
        self.buffers.get_mut(buf).copy_from_slice(data);
        *self.nodes.get_mut(node) = RunNode {
            block: block.0,
            buf,
            prev: NIL,
            next: NIL,
        };
        self.link_sorted(node);

        tracing::trace!(
            target: "destage::coalesce",
            device = %self.tag,
            block = block.0,
            occupied = self.len(),
            "coalesce_write_insert"
        );

        self.process_threshold();
        Ok(())
    }

    /// Drain the whole buffer, largest run first.
    ///
    /// Flush order favors the largest contiguous group available at each
    /// step, not insertion or recency order; callers must not assume any
    /// block ordering across separate runs. Device errors are reported to
    /// the error log and the affected blocks are dropped.
    pub fn flush(&mut self) {
        while let Some(run) = self.find_longest_run() {
            self.perform_io(run);
        }
    }

    /// Number of buffered blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.occupied_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_idle()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.nodes.capacity()
    }

    /// Whether `block` is currently buffered.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.lookup(block.0).is_some()
    }

    #[must_use]
    pub fn thresholds(&self) -> (usize, usize) {
        (self.low_threshold, self.high_threshold)
    }

    /// Locate the node buffering `block`, walking the sorted list from the
    /// head and stopping early once past it.
    fn lookup(&self, block: u64) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let mut current = self.head;
        loop {
            let node = self.nodes.get(current);
            if node.block == block {
                return Some(current);
            }
            if node.block > block {
                return None;
            }
            current = node.next;
            if current == self.head {
                return None;
            }
        }
    }

    /// Link `index` into the circular list at its ascending position,
    /// scanning linearly from the head.
    fn link_sorted(&mut self, index: usize) {
        if self.head == NIL {
            self.head = index;
            let node = self.nodes.get_mut(index);
            node.prev = index;
            node.next = index;
            return;
        }

        let block = self.nodes.get(index).block;
        let head = self.head;
        let mut anchor = head;
        if self.nodes.get(head).block > block {
            // New smallest block: it becomes the head, inserted before the
            // old head.
            self.head = index;
        } else {
            anchor = self.nodes.get(head).next;
            while self.nodes.get(anchor).block <= block && anchor != head {
                anchor = self.nodes.get(anchor).next;
            }
        }

        // Insert before `anchor`.
        let prev = self.nodes.get(anchor).prev;
        self.nodes.get_mut(prev).next = index;
        {
            let node = self.nodes.get_mut(index);
            node.prev = prev;
            node.next = anchor;
        }
        self.nodes.get_mut(anchor).prev = index;
    }

    fn unlink(&mut self, index: usize) {
        let RunNode { prev, next, .. } = *self.nodes.get(index);
        if prev == index {
            // Only node in the list.
            self.head = NIL;
        } else {
            self.nodes.get_mut(prev).next = next;
            self.nodes.get_mut(next).prev = prev;
            if self.head == index {
                self.head = next;
            }
        }
    }

    /// One circular scan tracking the current run and the best run seen.
    ///
    /// The final comparison after the scan is explicit so a list that is one
    /// uninterrupted run for its entire length still reports its full
    /// length.
    pub(crate) fn find_longest_run(&self) -> Option<Run> {
        if self.head == NIL {
            return None;
        }

        let mut best = Run {
            start: self.head,
            len: 0,
        };
        let mut run_start = self.head;
        let mut run_len = 0_usize;
        let mut prev_block: Option<u64> = None;

        let mut current = self.head;
        loop {
            let node = self.nodes.get(current);
            match prev_block {
                Some(prev) if prev.checked_add(1) == Some(node.block) => run_len += 1,
                _ => {
                    if run_len > best.len {
                        best = Run {
                            start: run_start,
                            len: run_len,
                        };
                    }
                    run_start = current;
                    run_len = 1;
                }
            }
            prev_block = Some(node.block);
            current = node.next;
            if current == self.head {
                break;
            }
        }
        if run_len > best.len {
            best = Run {
                start: run_start,
                len: run_len,
            };
        }
        Some(best)
    }

    /// Issue one run, capped at the staging-buffer capacity.
    ///
    /// Node buffers are gather-copied into the staging area and written as a
    /// single grouped transfer. If the grouped write fails, exactly one
    /// fallback pass retries block by block, logging each individual failure
    /// (the grouped attempt's own failure is not logged). Every processed
    /// node is removed and its resources returned to the pools regardless of
    /// outcome — failed data is dropped after reporting, never retried on a
    /// later pass.
    pub(crate) fn perform_io(&mut self, run: Run) {
        if run.len == 0 {
            return;
        }
        let group = run.len.min(STAGING_RUN_BLOCKS);

        let mut current = run.start;
        for slot in 0..group {
            let node = *self.nodes.get(current);
            let offset = slot * self.block_size;
            self.staging[offset..offset + self.block_size]
                .copy_from_slice(self.buffers.get(node.buf));
            current = node.next;
        }

        let start_block = self.nodes.get(run.start).block;
        tracing::debug!(
            target: "destage::coalesce",
            device = %self.tag,
            start = start_block,
            blocks = group,
            "coalesce_grouped_write"
        );

        let grouped = self.device.write_blocks(
            BlockNumber(start_block),
            group as u32,
            &self.staging[..group * self.block_size],
        );
        if grouped.is_err() {
            // Grouped transfer failed: one fallback pass at single-block
            // granularity, logging each block that still fails.
            let mut current = run.start;
            for _ in 0..group {
                let node = *self.nodes.get(current);
                if let Err(error) =
                    self.device
                        .write_blocks(BlockNumber(node.block), 1, self.buffers.get(node.buf))
                {
                    self.errors.record(
                        &self.tag,
                        IoOperation::Write,
                        BlockNumber(node.block),
                        &error,
                    );
                }
                current = node.next;
            }
        }

        let mut current = run.start;
        for _ in 0..group {
            let node = *self.nodes.get(current);
            let next = node.next;
            self.unlink(current);
            let _ = self.buffers.release(node.buf);
            let _ = self.nodes.release(current);
            current = next;
        }
    }

    /// Drain the longest runs while occupancy sits at or above the high
    /// threshold, stopping once it reaches the low threshold.
    pub(crate) fn process_threshold(&mut self) {
        if self.len() < self.high_threshold {
            return;
        }
        while self.len() > self.low_threshold {
            match self.find_longest_run() {
                Some(run) if run.len > 0 => self.perform_io(run),
                // Counters and list disagree; bail out rather than spin.
                _ => break,
            }
        }
    }

    /// Blocks currently buffered, in ascending order. Test support.
    #[cfg(test)]
    fn buffered_blocks(&self) -> Vec<u64> {
        let mut out = Vec::new();
        if self.head == NIL {
            return out;
        }
        let mut current = self.head;
        loop {
            let node = self.nodes.get(current);
            out.push(node.block);
            current = node.next;
            if current == self.head {
                break;
            }
        }
        out
    }
}
