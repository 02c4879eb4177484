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

use std::{fmt, sync::Arc};

use crate::{
    cache::ModelCache,
    error::{Error, Result},
    key::CacheKey,
    model::{DeviceModel, ModelArtifact, ModelConfig, Weight, WeightMap},
    record::CacheRecord,
};

/// Scoped claim on a cached model.
///
/// [`lock`](Self::lock) moves a caller-private copy of the model onto the
/// device reserved by the calling task; [`unlock`](Self::unlock) gives it
/// back. Unlock is idempotent and also runs when the handle drops, so the
/// claim is released on every exit path.
pub struct ModelLocker<W: Weight, C: ModelConfig> {
    cache: ModelCache<W, C>,
    record: Arc<CacheRecord<W, C>>,
    locked: bool,
}

impl<W: Weight, C: ModelConfig> ModelLocker<W, C> {
    pub(crate) fn new(cache: ModelCache<W, C>, record: Arc<CacheRecord<W, C>>) -> Self {
        Self {
            cache,
            record,
            locked: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        self.record.key()
    }

    pub fn record(&self) -> &Arc<CacheRecord<W, C>> {
        &self.record
    }

    /// The opaque host model without moving it anywhere, if this record
    /// carries one.
    pub fn host_model(&self) -> Option<Arc<dyn ModelArtifact>> {
        self.record.host_model()
    }

    /// The weight map of a reconstructable record. Read-only.
    pub fn weights(&self) -> Option<WeightMap<W>> {
        self.record.weights()
    }

    /// Materialize the model on the caller's reserved device and pin the
    /// record against eviction.
    ///
    /// Fails with [`Error::NotReserved`] when the calling task holds no
    /// device. Any failure rolls the lock count back, leaving the record
    /// unlocked and loadable.
    pub fn lock(&mut self) -> Result<DeviceModel<W>> {
        self.record.acquire_lock();
        let model = match self.load() {
            Ok(model) => model,
            Err(err) => {
                self.record.release_lock();
                if matches!(err, Error::OutOfDeviceMemory { .. }) {
                    tracing::warn!(
                        "insufficient device memory to load {}, aborting",
                        self.record.key()
                    );
                }
                return Err(err);
            }
        };
        self.locked = true;
        Ok(model)
    }

    fn load(&self) -> Result<DeviceModel<W>> {
        let device = self.cache.current_device()?;
        let model = self.cache.residency().materialize(&self.record, &device)?;
        self.record.set_resident(device.clone());
        tracing::debug!("locked {} on {device}", self.record.key());
        Ok(model)
    }

    /// Release the claim and offload whatever records no longer have active
    /// locks. A second unlock is a no-op.
    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;
        self.record.release_lock();
        self.cache.offload_unlocked_records();
    }
}

impl<W: Weight, C: ModelConfig> Drop for ModelLocker<W, C> {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl<W: Weight, C: ModelConfig> fmt::Debug for ModelLocker<W, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLocker")
            .field("key", self.record.key())
            .field("locked", &self.locked)
            .finish()
    }
}
