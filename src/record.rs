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
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    device::DeviceId,
    key::CacheKey,
    model::{ModelArtifact, ModelConfig, ModelPayload, Weight, WeightMap},
};

/// One cached model: the shared header plus either the opaque object or its
/// reconstruction materials.
///
/// `size_bytes` is fixed at insertion. `active_locks` counts callers that
/// currently hold the model resident; a record with active locks must not be
/// evicted.
pub struct CacheRecord<W: Weight, C: ModelConfig> {
    key: CacheKey,
    size_bytes: u64,
    locks: AtomicUsize,
    resident: Mutex<Option<DeviceId>>,
    payload: ModelPayload<W, C>,
}

impl<W: Weight, C: ModelConfig> CacheRecord<W, C> {
    pub(crate) fn new(key: CacheKey, size_bytes: u64, payload: ModelPayload<W, C>) -> Self {
        Self {
            key,
            size_bytes,
            locks: AtomicUsize::new(0),
            resident: Mutex::new(None),
            payload,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn active_locks(&self) -> usize {
        self.locks.load(Ordering::Acquire)
    }

    /// Device this record is currently resident on, if any.
    pub fn resident_device(&self) -> Option<DeviceId> {
        self.resident.lock().clone()
    }

    /// The opaque host model, for records that carry one.
    pub fn host_model(&self) -> Option<Arc<dyn ModelArtifact>> {
        match &self.payload {
            ModelPayload::Opaque(model) => Some(model.clone()),
            ModelPayload::Reconstructable { .. } => None,
        }
    }

    /// The weight map, for reconstructable records. Read-only.
    pub fn weights(&self) -> Option<WeightMap<W>> {
        match &self.payload {
            ModelPayload::Reconstructable { weights, .. } => Some(weights.clone()),
            ModelPayload::Opaque(_) => None,
        }
    }

    pub(crate) fn payload(&self) -> &ModelPayload<W, C> {
        &self.payload
    }

    pub(crate) fn acquire_lock(&self) {
        self.locks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_lock(&self) {
        let res = self
            .locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if res.is_err() {
            tracing::warn!("ignoring unlock of {} with no active locks", self.key);
        }
    }

    pub(crate) fn set_resident(&self, device: DeviceId) {
        *self.resident.lock() = Some(device);
    }

    pub(crate) fn take_resident(&self) -> Option<DeviceId> {
        self.resident.lock().take()
    }
}

impl<W: Weight, C: ModelConfig> fmt::Debug for CacheRecord<W, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRecord")
            .field("key", &self.key)
            .field("size_bytes", &self.size_bytes)
            .field("active_locks", &self.active_locks())
            .field("resident", &self.resident_device())
            .field("payload", &self.payload)
            .finish()
    }
}
