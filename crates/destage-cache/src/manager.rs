//! Process-wide cache registry.
//!
//! A [`CacheManager`] owns the map from device identifier to its
//! [`BlockCache`] and the I/O error log shared by every cache. It replaces
//! ambient global state with an object that has an explicit lifecycle:
//! create it at volume-layer init, destroy caches at unmount, drop it at
//! teardown.
//!
//! The registry lock is only ever taken for lookup, insert, and remove —
//! never while a device mutex is held — so lock order cannot invert.

use crate::cache::BlockCache;
use crate::errlog::IoErrorLog;
use destage_block::BlockDevice;
use destage_error::{DestageError, Result};
use destage_types::{CacheConfig, DeviceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Default capacity of the shared I/O error ring.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct CacheManager {
    caches: Mutex<HashMap<DeviceId, Arc<BlockCache>>>,
    errors: Arc<IoErrorLog>,
}

impl CacheManager {
    /// Create a manager whose error ring holds `error_log_capacity` entries.
    #[must_use]
    pub fn new(error_log_capacity: usize) -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
            errors: Arc::new(IoErrorLog::new(error_log_capacity)),
        }
    }

    /// Attach a cache to `device_id`. Rejects duplicate attachment.
    pub fn create(
        &self,
        device_id: DeviceId,
        device: Arc<dyn BlockDevice>,
        config: &CacheConfig,
    ) -> Result<Arc<BlockCache>> {
        let mut caches = self.caches.lock();
        if caches.contains_key(&device_id) {
            return Err(DestageError::Exists(format!("device {device_id}")));
        }
        let cache = Arc::new(BlockCache::new(
            device_id,
            device,
            config,
            Arc::clone(&self.errors),
        )?);
        caches.insert(device_id, Arc::clone(&cache));
        Ok(cache)
    }

    /// The cache attached to `device_id`, if any.
    #[must_use]
    pub fn lookup(&self, device_id: DeviceId) -> Option<Arc<BlockCache>> {
        self.caches.lock().get(&device_id).cloned()
    }

    #[must_use]
    pub fn has_cache(&self, device_id: DeviceId) -> bool {
        self.caches.lock().contains_key(&device_id)
    }

    /// Whether `device_id` has a cache with an active write coalescer.
    #[must_use]
    pub fn has_coalescer(&self, device_id: DeviceId) -> bool {
        self.lookup(device_id)
            .is_some_and(|cache| cache.has_coalescer())
    }

    /// Detach and tear down the cache for `device_id`.
    ///
    /// Pending dirty blocks are flushed before resources are released; the
    /// flush's I/O status is returned after teardown completes either way.
    pub fn destroy(&self, device_id: DeviceId) -> Result<()> {
        let cache = self
            .caches
            .lock()
            .remove(&device_id)
            .ok_or_else(|| DestageError::NotFound(format!("device {device_id}")))?;
        cache.shutdown()
    }

    /// Synchronous flush entry point for unmount/sync glue.
    pub fn flush(&self, device_id: DeviceId) -> Result<()> {
        self.lookup(device_id)
            .ok_or_else(|| DestageError::NotFound(format!("device {device_id}")))?
            .flush()
    }

    /// Devices that currently have a cache attached.
    #[must_use]
    pub fn cached_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.caches.lock().keys().copied().collect();
        devices.sort_unstable();
        devices
    }

    /// Handle for the external error-log consumer.
    #[must_use]
    pub fn errors(&self) -> &Arc<IoErrorLog> {
        &self.errors
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use destage_block::MemBlockDevice;
    use destage_types::{BlockNumber, BlockSize, CoalesceConfig, ThresholdFlush};

    const BLOCK_SIZE: u32 = 512;

    fn device() -> Arc<MemBlockDevice> {
        Arc::new(MemBlockDevice::new(
            BlockSize::new(BLOCK_SIZE).unwrap(),
            256,
        ))
    }

    fn config(coalesce: bool) -> CacheConfig {
        CacheConfig {
            capacity_bytes: 8 * u64::from(BLOCK_SIZE),
            low_threshold: 4,
            high_threshold: 8,
            idle_flush: None,
            threshold_flush: ThresholdFlush::Caller,
            coalesce: coalesce.then(CoalesceConfig::default),
        }
    }

    #[test]
    fn create_rejects_duplicate_device() {
        let manager = CacheManager::default();
        manager
            .create(DeviceId(1), device(), &config(false))
            .unwrap();
        assert!(matches!(
            manager.create(DeviceId(1), device(), &config(false)),
            Err(DestageError::Exists(_))
        ));
        // Another device is fine.
        manager
            .create(DeviceId(2), device(), &config(false))
            .unwrap();
        assert_eq!(manager.cached_devices(), vec![DeviceId(1), DeviceId(2)]);
    }

    #[test]
    fn lookup_and_has_cache_track_registration() {
        let manager = CacheManager::default();
        assert!(!manager.has_cache(DeviceId(7)));
        assert!(manager.lookup(DeviceId(7)).is_none());

        manager
            .create(DeviceId(7), device(), &config(true))
            .unwrap();
        assert!(manager.has_cache(DeviceId(7)));
        assert!(manager.has_coalescer(DeviceId(7)));
    }

    #[test]
    fn coalescer_presence_follows_config() {
        let manager = CacheManager::default();
        manager
            .create(DeviceId(3), device(), &config(false))
            .unwrap();
        assert!(manager.has_cache(DeviceId(3)));
        assert!(!manager.has_coalescer(DeviceId(3)));
    }

    #[test]
    fn destroy_flushes_pending_dirty_blocks() {
        let manager = CacheManager::default();
        let dev = device();
        let cache = manager
            .create(DeviceId(4), dev.clone(), &config(true))
            .unwrap();

        cache
            .write(BlockNumber(10), &vec![0x4D_u8; BLOCK_SIZE as usize])
            .unwrap();
        assert_eq!(cache.dirty_count(), 1);

        manager.destroy(DeviceId(4)).unwrap();
        assert!(!manager.has_cache(DeviceId(4)));
        assert!(!manager.has_coalescer(DeviceId(4)));
        assert_eq!(
            dev.block_contents(BlockNumber(10)),
            vec![0x4D_u8; BLOCK_SIZE as usize]
        );
    }

    #[test]
    fn destroy_and_flush_report_missing_device() {
        let manager = CacheManager::default();
        assert!(matches!(
            manager.destroy(DeviceId(9)),
            Err(DestageError::NotFound(_))
        ));
        assert!(matches!(
            manager.flush(DeviceId(9)),
            Err(DestageError::NotFound(_))
        ));
    }

    #[test]
    fn flush_entry_point_drains_device_cache() {
        let manager = CacheManager::default();
        let dev = device();
        let cache = manager
            .create(DeviceId(5), dev.clone(), &config(false))
            .unwrap();
        cache
            .write(BlockNumber(2), &vec![0x11_u8; BLOCK_SIZE as usize])
            .unwrap();

        manager.flush(DeviceId(5)).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(
            dev.block_contents(BlockNumber(2)),
            vec![0x11_u8; BLOCK_SIZE as usize]
        );
    }
}
