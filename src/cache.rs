//  Copyright 2025 Greenroom Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    device::{DeviceAllocator, DeviceEnumerator, DeviceId},
    error::{Error, Result},
    handle::ModelLocker,
    key::CacheKey,
    model::{ModelConfig, ModelFactory, ModelPayload, ModelSizer, Precision, Weight},
    record::CacheRecord,
    registry::{DeviceGuard, DeviceRegistry},
    residency::ResidencyEngine,
    stats::CacheStats,
    store::EntryStore,
};

const GIB: u64 = 1 << 30;

/// Default host budget, roughly enough for three half-precision diffusion
/// models.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 6 * GIB;
pub const DEFAULT_MAX_VRAM_BYTES: u64 = GIB / 4;
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ModelCacheConfig {
    /// Host-memory budget in bytes.
    pub max_cache_bytes: u64,
    /// Device-memory budget in bytes. Advisory.
    pub max_vram_bytes: u64,
    /// Identifier of the storage tier.
    pub storage_device: DeviceId,
    /// Precision for reconstructed device copies.
    pub precision: Precision,
    /// How long `reserve_device` waits for a free device. `None` waits
    /// indefinitely.
    pub reservation_timeout: Option<Duration>,
    /// Capture memory snapshots around every model move and log when the
    /// observed delta disagrees with the size estimate. Snapshots cost time;
    /// leave this off unless inspecting cache behaviour.
    pub log_memory_usage: bool,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_vram_bytes: DEFAULT_MAX_VRAM_BYTES,
            storage_device: DeviceId::from("host"),
            precision: Precision::default(),
            reservation_timeout: Some(DEFAULT_RESERVATION_TIMEOUT),
            log_memory_usage: false,
        }
    }
}

/// Two-tier residency cache for model artifacts.
///
/// Cheap to clone; clones share the same cache.
pub struct ModelCache<W: Weight, C: ModelConfig> {
    inner: Arc<CacheInner<W, C>>,
}

impl<W: Weight, C: ModelConfig> Clone for ModelCache<W, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<W: Weight, C: ModelConfig> {
    store: EntryStore<W, C>,
    registry: Arc<DeviceRegistry>,
    residency: ResidencyEngine<W, C>,
    sizer: Arc<dyn ModelSizer<W, C>>,
    allocator: Option<Arc<dyn DeviceAllocator>>,
    stats: Mutex<Option<CacheStats>>,
    storage_device: DeviceId,
    reservation_timeout: Option<Duration>,
    max_vram_bytes: AtomicU64,
}

impl<W: Weight, C: ModelConfig> ModelCache<W, C> {
    pub fn new(
        config: ModelCacheConfig,
        enumerator: &dyn DeviceEnumerator,
        factory: Arc<dyn ModelFactory<W, C>>,
        sizer: Arc<dyn ModelSizer<W, C>>,
        allocator: Option<Arc<dyn DeviceAllocator>>,
    ) -> Self {
        let registry = DeviceRegistry::new(enumerator.execution_devices(), allocator.clone());
        let residency = ResidencyEngine::new(
            factory,
            allocator.clone(),
            config.precision,
            config.log_memory_usage,
        );
        Self {
            inner: Arc::new(CacheInner {
                store: EntryStore::new(config.max_cache_bytes),
                registry,
                residency,
                sizer,
                allocator,
                stats: Mutex::new(None),
                storage_device: config.storage_device,
                reservation_timeout: config.reservation_timeout,
                max_vram_bytes: AtomicU64::new(config.max_vram_bytes),
            }),
        }
    }

    /// Store a model under `model_key` and an optional submodel tag.
    ///
    /// A key that is already present is left untouched. Reconstructable
    /// payloads are stored as configuration plus weights; everything else is
    /// kept as an opaque host object.
    #[tracing::instrument(skip(self, payload))]
    pub fn put(&self, model_key: &str, payload: ModelPayload<W, C>, submodel: Option<&str>) {
        let key = CacheKey::new(model_key, submodel);
        if self.inner.store.lookup(&key).is_some() {
            return;
        }
        let size = self.inner.sizer.size_of(&payload);
        let evicted = self
            .inner
            .store
            .insert(CacheRecord::new(key, size, payload));
        if evicted > 0 {
            if let Some(stats) = self.inner.stats.lock().as_mut() {
                stats.evictions += evicted as u64;
            }
            if let Some(allocator) = &self.inner.allocator {
                allocator.empty_device_cache();
            }
        }
    }

    /// Retrieve a lock handle over the model stored under `model_key`.
    ///
    /// Counts a hit or a miss, refreshes recency, and returns a
    /// [`ModelLocker`]. The model is not moved to any device until the
    /// handle is locked.
    #[tracing::instrument(skip(self))]
    pub fn get(
        &self,
        model_key: &str,
        submodel: Option<&str>,
        stats_name: Option<&str>,
    ) -> Result<ModelLocker<W, C>> {
        let key = CacheKey::new(model_key, submodel);
        let Some(record) = self.inner.store.lookup(&key) else {
            if let Some(stats) = self.inner.stats.lock().as_mut() {
                stats.misses += 1;
            }
            return Err(Error::NotFound(key));
        };

        if let Some(stats) = self.inner.stats.lock().as_mut() {
            stats.hits += 1;
            stats.byte_budget = self.inner.store.byte_budget();
            stats.high_watermark = stats.high_watermark.max(self.inner.store.current_bytes());
            stats.in_cache = self.inner.store.len();
            stats.record_peak(stats_name.unwrap_or(key.as_str()), record.size_bytes());
        }

        self.inner.store.touch(&key);
        Ok(ModelLocker::new(self.clone(), record))
    }

    /// Membership test; does not refresh recency.
    pub fn exists(&self, model_key: &str, submodel: Option<&str>) -> bool {
        self.inner
            .store
            .lookup(&CacheKey::new(model_key, submodel))
            .is_some()
    }

    /// Reserve an execution device for the calling task, waiting up to the
    /// configured timeout. The reservation lasts until the guard drops.
    pub async fn reserve_device(&self) -> Result<DeviceGuard> {
        self.inner
            .registry
            .reserve(self.inner.reservation_timeout)
            .await
    }

    /// Like [`reserve_device`](Self::reserve_device) with an explicit
    /// timeout; `None` waits indefinitely.
    pub async fn reserve_device_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<DeviceGuard> {
        self.inner.registry.reserve(timeout).await
    }

    /// The device reserved by the calling task.
    pub fn current_device(&self) -> Result<DeviceId> {
        self.inner.registry.current_device()
    }

    /// Drop the device residency of every record with no active locks, then
    /// hint the allocator to reclaim.
    pub fn offload_unlocked_records(&self) {
        for record in self.inner.store.records() {
            if record.active_locks() == 0 {
                if let Some(device) = record.take_resident() {
                    tracing::debug!("offloaded {} from {device}", record.key());
                }
            }
        }
        if let Some(allocator) = &self.inner.allocator {
            allocator.empty_device_cache();
        }
    }

    pub fn storage_device(&self) -> &DeviceId {
        &self.inner.storage_device
    }

    /// The execution devices, in enumeration order.
    pub fn execution_devices(&self) -> Vec<DeviceId> {
        self.inner.registry.devices()
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.inner.store.byte_budget()
    }

    pub fn set_max_cache_bytes(&self, bytes: u64) {
        self.inner.store.set_byte_budget(bytes);
    }

    pub fn max_vram_bytes(&self) -> u64 {
        self.inner.max_vram_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_vram_bytes(&self, bytes: u64) {
        self.inner.max_vram_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Total size of the currently cached records, in bytes.
    pub fn current_bytes(&self) -> u64 {
        self.inner.store.current_bytes()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.len() == 0
    }

    /// Start collecting statistics. Counters already being collected are
    /// kept.
    pub fn enable_stats(&self) {
        let mut stats = self.inner.stats.lock();
        if stats.is_none() {
            *stats = Some(CacheStats::default());
        }
    }

    /// Snapshot of the collected statistics, if enabled.
    pub fn stats(&self) -> Option<CacheStats> {
        self.inner.stats.lock().clone()
    }

    /// Stop collecting and return the statistics gathered so far.
    pub fn take_stats(&self) -> Option<CacheStats> {
        self.inner.stats.lock().take()
    }

    /// Log a debug summary of current usage.
    pub fn log_usage(&self) {
        tracing::debug!(
            "current usage for {} models: {} of {} bytes",
            self.len(),
            self.current_bytes(),
            self.max_cache_bytes()
        );
    }

    pub(crate) fn residency(&self) -> &ResidencyEngine<W, C> {
        &self.inner.residency
    }
}

impl<W: Weight, C: ModelConfig> fmt::Debug for ModelCache<W, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("records", &self.len())
            .field("current_bytes", &self.current_bytes())
            .field("max_cache_bytes", &self.max_cache_bytes())
            .field("registry", &self.inner.registry)
            .finish()
    }
}
