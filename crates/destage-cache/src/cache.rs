//! Per-device LRU block cache.
//!
//! A [`BlockCache`] owns a fixed slot set (one cached block per slot, metadata
//! and data in a single struct), an intrusive MRU/LRU ordering over the slots,
//! a dirty-block counter, and optionally a [`WriteCoalescer`] that flush
//! traffic is routed through. All state sits behind one per-device mutex;
//! every public operation is synchronous and may perform device I/O while
//! holding it — `write` is a potentially I/O-blocking call, not a pure memory
//! operation.
//!
//! Only writes populate slots. Reads are served from occupied slots (promoting
//! them to MRU) or forwarded to the coalescer/device without admission,
//! matching the coalescer's write-only caching policy.
//!
//! A background flush worker per cache drains dirty blocks on an idle timeout
//! or an explicit force-flush signal; see the `flusher` module.

use crate::coalesce::WriteCoalescer;
use crate::errlog::IoErrorLog;
use crate::flusher::{self, FlushEvent};
use crate::lru::OrderedList;
use destage_block::BlockDevice;
use destage_error::{DestageError, Result};
use destage_pool::SlotPool;
use destage_types::{
    BlockNumber, CacheConfig, CoalesceConfig, DeviceId, IoOperation, ThresholdFlush,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One cache slot: the block it holds plus its state.
///
/// Occupancy is pool membership — an allocated slot is occupied, a released
/// one is empty. `dirty` is meaningful only while occupied.
#[derive(Debug)]
struct Slot {
    block: u64,
    dirty: bool,
    error_pending: u32,
    data: Box<[u8]>,
}

/// Mutable cache state, guarded by the per-device mutex.
#[derive(Debug)]
struct CacheState {
    slots: SlotPool<Slot>,
    list: OrderedList,
    map: HashMap<u64, usize>,
    dirty_count: usize,
    low_threshold: usize,
    high_threshold: usize,
    idle_flush: Option<Duration>,
    threshold_flush: ThresholdFlush,
    coalescer: Option<WriteCoalescer>,
    hits: u64,
    misses: u64,
    writebacks: u64,
}

/// Occupancy and traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub capacity: usize,
    pub occupied: usize,
    pub dirty_blocks: usize,
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
}

/// State shared between the cache handle and its flush worker.
pub(crate) struct Shared {
    device_id: DeviceId,
    tag: String,
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    errors: Arc<IoErrorLog>,
    state: Mutex<CacheState>,
}

fn write_out(
    device: &Arc<dyn BlockDevice>,
    coalescer: &mut Option<WriteCoalescer>,
    block: u64,
    data: &[u8],
) -> Result<()> {
    match coalescer {
        Some(coalescer) => coalescer.write(BlockNumber(block), data),
        None => device.write_blocks(BlockNumber(block), 1, data),
    }
}

fn read_through(
    device: &Arc<dyn BlockDevice>,
    coalescer: &Option<WriteCoalescer>,
    block: u64,
    out: &mut [u8],
) -> Result<()> {
    match coalescer {
        Some(coalescer) => coalescer.read(BlockNumber(block), out),
        None => device.read_blocks(BlockNumber(block), 1, out),
    }
}

impl Shared {
    pub(crate) fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub(crate) fn idle_period(&self) -> Option<Duration> {
        self.state.lock().idle_flush
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.state.lock().dirty_count
    }

    /// Full flush pass under the device mutex.
    pub(crate) fn flush_pass(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    /// Write one dirty resident slot out through the coalescer or device.
    /// The slot stays resident; on success it becomes clean.
    fn write_slot(&self, state: &mut CacheState, index: usize) -> Result<()> {
        let result = {
            let CacheState {
                slots, coalescer, ..
            } = &mut *state;
            let slot = slots.get(index);
            write_out(&self.device, coalescer, slot.block, &slot.data)
        };
        match result {
            Ok(()) => {
                let slot = state.slots.get_mut(index);
                slot.dirty = false;
                slot.error_pending = 0;
                state.dirty_count -= 1;
                state.writebacks += 1;
                Ok(())
            }
            Err(error) => {
                let slot = state.slots.get_mut(index);
                slot.error_pending += 1;
                let block = slot.block;
                self.errors
                    .record(&self.tag, IoOperation::Write, BlockNumber(block), &error);
                Err(error)
            }
        }
    }

    /// Write out every dirty slot (LRU first), then drain the coalescer.
    ///
    /// Slots stay resident and become clean. A slot whose write fails stays
    /// dirty for a later pass; the failure is logged and surfaced to
    /// synchronous callers as a single incomplete-flush error.
    fn flush_locked(&self, state: &mut CacheState) -> Result<()> {
        let mut failed = 0_usize;
        if state.dirty_count > 0 {
            let order: Vec<usize> = state.list.iter_lru_to_mru().collect();
            for index in order {
                if !state.slots.get(index).dirty {
                    continue;
                }
                if self.write_slot(state, index).is_err() {
                    failed += 1;
                }
            }
        }
        if let Some(coalescer) = &mut state.coalescer {
            coalescer.flush();
        }
        if failed > 0 {
            tracing::warn!(
                target: "destage::cache",
                device = %self.tag,
                failed,
                "flush_incomplete"
            );
            return Err(DestageError::FlushIncomplete { failed });
        }
        Ok(())
    }

    /// Drain dirty slots (LRU first) once the high threshold is reached,
    /// stopping at the low threshold. I/O errors go to the error log.
    fn process_threshold_locked(&self, state: &mut CacheState) {
        if state.dirty_count < state.high_threshold {
            return;
        }
        tracing::debug!(
            target: "destage::cache",
            device = %self.tag,
            dirty = state.dirty_count,
            low = state.low_threshold,
            "threshold_pass"
        );
        let order: Vec<usize> = state.list.iter_lru_to_mru().collect();
        for index in order {
            if state.dirty_count <= state.low_threshold {
                break;
            }
            if !state.slots.get(index).dirty {
                continue;
            }
            let _ = self.write_slot(state, index);
        }
    }

    /// Free one slot, preferring the LRU tail.
    ///
    /// A dirty candidate is written out first; if its write fails the failure
    /// is logged and the next candidate toward MRU is tried. Fails with
    /// `CacheFull` when no slot can be reclaimed.
    fn evict_locked(&self, state: &mut CacheState) -> Result<()> {
        let order: Vec<usize> = state.list.iter_lru_to_mru().collect();
        for index in order {
            if state.slots.get(index).dirty && self.write_slot(state, index).is_err() {
                continue;
            }
            let block = state.slots.get(index).block;
            state.list.remove(index);
            state.map.remove(&block);
            let _ = state.slots.release(index);
            tracing::trace!(
                target: "destage::cache",
                device = %self.tag,
                block,
                "slot_evicted"
            );
            return Ok(());
        }
        Err(DestageError::CacheFull)
    }
}

/// Device-facing cache handle. Cheap to share via `Arc`; all methods take
/// `&self`.
pub struct BlockCache {
    shared: Arc<Shared>,
    events: mpsc::Sender<FlushEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("device_id", &self.shared.device_id)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Build a cache for `device` and start its flush worker.
    pub fn new(
        device_id: DeviceId,
        device: Arc<dyn BlockDevice>,
        config: &CacheConfig,
        errors: Arc<IoErrorLog>,
    ) -> Result<Self> {
        let block_size = device.block_size();
        let capacity = config
            .validated_capacity(block_size)
            .map_err(|error| DestageError::InvalidGeometry(error.to_string()))?;
        let tag = format!("{device_id}:");

        let coalescer = match config.coalesce {
            Some(settings) => Some(WriteCoalescer::new(
                Arc::clone(&device),
                settings.capacity_blocks,
                Arc::clone(&errors),
                tag.clone(),
            )?),
            None => None,
        };

        let block_size = block_size.as_usize();
        let state = CacheState {
            slots: SlotPool::new_with(capacity, |_| Slot {
                block: 0,
                dirty: false,
                error_pending: 0,
                data: vec![0_u8; block_size].into_boxed_slice(),
            }),
            list: OrderedList::new(capacity),
            map: HashMap::with_capacity(capacity),
            dirty_count: 0,
            low_threshold: config.low_threshold,
            high_threshold: config.high_threshold,
            idle_flush: config.idle_flush,
            threshold_flush: config.threshold_flush,
            coalescer,
            hits: 0,
            misses: 0,
            writebacks: 0,
        };

        let shared = Arc::new(Shared {
            device_id,
            tag,
            device,
            block_size,
            errors,
            state: Mutex::new(state),
        });

        let (events, receiver) = mpsc::channel();
        let worker = flusher::spawn(Arc::clone(&shared), receiver)?;

        tracing::info!(
            target: "destage::cache",
            device = %device_id,
            capacity,
            block_size,
            "cache_created"
        );

        Ok(Self {
            shared,
            events,
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.shared.device_id
    }

    /// Read `buf.len() / block_size` blocks starting at `start`.
    ///
    /// Takes the same per-device mutex as `write` and flush passes, so a read
    /// never observes a block mid-transfer and read-after-flush is
    /// linearizable. Cache hits are promoted to MRU; misses are forwarded and
    /// do not populate slots.
    pub fn read(&self, start: BlockNumber, buf: &mut [u8]) -> Result<()> {
        let count = self.span_blocks(start, buf.len())?;
        let block_size = self.shared.block_size;
        let mut state = self.shared.state.lock();
        for i in 0..count {
            let block = start.0 + i as u64;
            let out = &mut buf[i * block_size..(i + 1) * block_size];
            if let Some(&index) = state.map.get(&block) {
                state.hits += 1;
                out.copy_from_slice(&state.slots.get(index).data);
                state.list.touch(index);
            } else {
                state.misses += 1;
                read_through(&self.shared.device, &state.coalescer, block, out)?;
            }
        }
        Ok(())
    }

    /// Write `buf.len() / block_size` blocks starting at `start`.
    ///
    /// Each block lands in a slot (evicting the LRU tail when full, which may
    /// itself perform device I/O) and is marked dirty. If every slot is
    /// pinned dirty and unreclaimable, the block is written straight through
    /// to the device instead.
    pub fn write(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        let count = self.span_blocks(start, buf.len())?;
        let block_size = self.shared.block_size;
        let mut state = self.shared.state.lock();
        for i in 0..count {
            let block = start.0 + i as u64;
            let data = &buf[i * block_size..(i + 1) * block_size];
            self.write_one(&mut state, block, data)?;
        }
        Ok(())
    }

    fn write_one(&self, state: &mut CacheState, block: u64, data: &[u8]) -> Result<()> {
        let newly_dirty;
        if let Some(&index) = state.map.get(&block) {
            state.hits += 1;
            let slot = state.slots.get_mut(index);
            slot.data.copy_from_slice(data);
            newly_dirty = !slot.dirty;
            slot.dirty = true;
            slot.error_pending = 0;
            if newly_dirty {
                state.dirty_count += 1;
            }
            state.list.touch(index);
        } else {
            state.misses += 1;
            let index = match state.slots.allocate() {
                Ok(index) => index,
                Err(_) => match self.shared.evict_locked(state) {
                    Ok(()) => state
                        .slots
                        .allocate()
                        .map_err(|_| DestageError::PoolExhausted)?,
                    Err(DestageError::CacheFull) => {
                        // Nothing reclaimable: bypass the cache so the data
                        // still reaches the device.
                        tracing::debug!(
                            target: "destage::cache",
                            device = %self.shared.tag,
                            block,
                            "write_bypass_cache_full"
                        );
                        let CacheState {
                            coalescer: bypass, ..
                        } = &mut *state;
                        return write_out(&self.shared.device, bypass, block, data);
                    }
                    Err(error) => return Err(error),
                },
            };
            let slot = state.slots.get_mut(index);
            slot.block = block;
            slot.dirty = true;
            slot.error_pending = 0;
            slot.data.copy_from_slice(data);
            state.map.insert(block, index);
            state.list.push_mru(index);
            state.dirty_count += 1;
            newly_dirty = true;
        }

        // First dirty block after an all-clean period arms the idle timer.
        if newly_dirty && state.dirty_count == 1 && state.idle_flush.is_some() {
            let _ = self.events.send(FlushEvent::StartIdleTimer);
        }

        if state.dirty_count >= state.high_threshold {
            match state.threshold_flush {
                ThresholdFlush::Caller => self.shared.process_threshold_locked(state),
                ThresholdFlush::Worker => {
                    let _ = self.events.send(FlushEvent::ForceFlush);
                }
            }
        }
        Ok(())
    }

    /// Synchronously write out all dirty blocks and drain the coalescer.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush_pass()
    }

    /// Current number of dirty resident blocks.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.shared.dirty_count()
    }

    /// Whether flush traffic is routed through a write coalescer.
    #[must_use]
    pub fn has_coalescer(&self) -> bool {
        self.shared.state.lock().coalescer.is_some()
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.shared.state.lock();
        CacheMetrics {
            capacity: state.slots.capacity(),
            occupied: state.slots.occupied_count(),
            dirty_blocks: state.dirty_count,
            hits: state.hits,
            misses: state.misses,
            writebacks: state.writebacks,
        }
    }

    /// Snapshot of the active configuration.
    #[must_use]
    pub fn config(&self) -> CacheConfig {
        let state = self.shared.state.lock();
        let block_size = self.shared.block_size as u64;
        CacheConfig {
            capacity_bytes: state.slots.capacity() as u64 * block_size,
            low_threshold: state.low_threshold,
            high_threshold: state.high_threshold,
            idle_flush: state.idle_flush,
            threshold_flush: state.threshold_flush,
            coalesce: state.coalescer.as_ref().map(|coalescer| CoalesceConfig {
                capacity_blocks: coalescer.capacity(),
            }),
        }
    }

    /// Apply new thresholds, idle period, and threshold-flush mode.
    ///
    /// Capacity and coalescing are fixed for the life of the cache — destroy
    /// and recreate to change them. A threshold change triggers an immediate
    /// threshold pass; a period change re-arms the worker's idle timer.
    pub fn set_config(&self, config: &CacheConfig) -> Result<()> {
        let period_changed;
        {
            let mut state = self.shared.state.lock();
            let capacity = state.slots.capacity();
            let requested = config
                .validated_capacity(self.shared.device.block_size())
                .map_err(|error| DestageError::InvalidGeometry(error.to_string()))?;
            if requested != capacity {
                return Err(DestageError::InvalidArgument(
                    "cache capacity cannot be changed; recreate the cache".to_owned(),
                ));
            }
            if config.coalesce.is_some() != state.coalescer.is_some() {
                return Err(DestageError::InvalidArgument(
                    "coalescing cannot be toggled; recreate the cache".to_owned(),
                ));
            }
            let thresholds_changed = state.low_threshold != config.low_threshold
                || state.high_threshold != config.high_threshold;
            period_changed = state.idle_flush != config.idle_flush;
            state.low_threshold = config.low_threshold;
            state.high_threshold = config.high_threshold;
            state.idle_flush = config.idle_flush;
            state.threshold_flush = config.threshold_flush;
            if thresholds_changed {
                self.shared.process_threshold_locked(&mut state);
            }
        }
        if period_changed {
            let _ = self.events.send(FlushEvent::ConfigChanged);
        }
        Ok(())
    }

    /// Flush everything and stop the worker. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let result = self.shared.flush_pass();
        let _ = self.events.send(FlushEvent::Shutdown);
        let _ = handle.join();
        tracing::info!(
            target: "destage::cache",
            device = %self.shared.device_id,
            "cache_shutdown"
        );
        result
    }

    fn span_blocks(&self, start: BlockNumber, len: usize) -> Result<usize> {
        let block_size = self.shared.block_size;
        if len == 0 || len % block_size != 0 {
            return Err(DestageError::InvalidArgument(format!(
                "buffer length {len} is not a positive multiple of block size {block_size}"
            )));
        }
        let count = len / block_size;
        let end = start
            .checked_add(count as u64)
            .ok_or_else(|| DestageError::InvalidArgument("block range overflow".to_owned()))?;
        if end.0 > self.shared.device.block_count() {
            return Err(DestageError::InvalidArgument(format!(
                "span out of range: start={start} count={count} block_count={}",
                self.shared.device.block_count()
            )));
        }
        Ok(count)
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
