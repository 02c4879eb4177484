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

use std::{sync::Arc, time::Instant};

use crate::{
    device::{DeviceAllocator, DeviceId, MemorySnapshot},
    error::Result,
    model::{DeviceModel, ModelConfig, ModelFactory, ModelPayload, Precision, Weight},
    record::CacheRecord,
};

const SIZE_TOLERANCE_BYTES: u64 = 10 * 1024 * 1024;

/// Materializes device-resident copies of cache records.
pub(crate) struct ResidencyEngine<W: Weight, C: ModelConfig> {
    factory: Arc<dyn ModelFactory<W, C>>,
    allocator: Option<Arc<dyn DeviceAllocator>>,
    precision: Precision,
    log_memory_usage: bool,
}

impl<W: Weight, C: ModelConfig> ResidencyEngine<W, C> {
    pub fn new(
        factory: Arc<dyn ModelFactory<W, C>>,
        allocator: Option<Arc<dyn DeviceAllocator>>,
        precision: Precision,
        log_memory_usage: bool,
    ) -> Self {
        Self {
            factory,
            allocator,
            precision,
            log_memory_usage,
        }
    }

    /// Produce a copy of `record` resident on `device`.
    ///
    /// Opaque records are deep-copied and moved; host-only artifacts are
    /// returned shared without moving. Reconstructable records go through
    /// the factory, are moved at the configured precision, and then receive
    /// their weights.
    ///
    /// Failure never corrupts the record: it stays host-resident and a later
    /// lock attempt may succeed.
    pub fn materialize(
        &self,
        record: &CacheRecord<W, C>,
        device: &DeviceId,
    ) -> Result<DeviceModel<W>> {
        tracing::info!("moving {} to {device}", record.key());
        let start = Instant::now();
        let before = self.snapshot(device);

        let model = match record.payload() {
            ModelPayload::Opaque(model) => {
                if model.supports_transfer() {
                    let mut copy = model.deep_clone();
                    copy.transfer_to(device)?;
                    DeviceModel::Copied(copy)
                } else {
                    DeviceModel::HostBound(model.clone())
                }
            }
            ModelPayload::Reconstructable {
                descriptor,
                config,
                weights,
            } => {
                let mut shell = if descriptor.from_config {
                    self.factory.from_config(descriptor, config)?
                } else {
                    self.factory.with_config(descriptor, config)?
                };
                shell.transfer_to(device, self.precision)?;
                shell.load_weights(weights)?;
                DeviceModel::Reconstructed(shell)
            }
        };

        tracing::info!(
            "moved {} to {device} in {:?}, estimated size {} bytes",
            record.key(),
            start.elapsed(),
            record.size_bytes()
        );

        if let (Some(before), Some(after)) = (before, self.snapshot(device)) {
            let observed = after.device_bytes.abs_diff(before.device_bytes);
            if !sizes_agree(observed, record.size_bytes()) {
                tracing::debug!(
                    "moving {} to {device} changed device memory by {observed} bytes but the \
                     record is estimated at {} bytes; the size estimate may be wrong",
                    record.key(),
                    record.size_bytes()
                );
            }
        }

        Ok(model)
    }

    fn snapshot(&self, device: &DeviceId) -> Option<MemorySnapshot> {
        if !self.log_memory_usage {
            return None;
        }
        self.allocator.as_ref().and_then(|a| a.snapshot(device))
    }
}

/// Observed and estimated sizes agree within max(10%, 10 MiB).
fn sizes_agree(observed: u64, estimated: u64) -> bool {
    let tolerance = (estimated / 10).max(SIZE_TOLERANCE_BYTES);
    observed.abs_diff(estimated) <= tolerance
}
