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

//! A two-tier residency cache for large machine-learning model artifacts.
//!
//! Idle models live in bulk host memory (the storage tier). A caller that
//! wants to run one first reserves an execution device, then locks the model,
//! which materializes a caller-private copy on the reserved device. When the
//! lock is released the device copy is dropped; when the host cache runs out
//! of budget, the least recently used unlocked model is evicted.
//!
//! The cache never constructs, loads or sizes models itself. Those concerns
//! are consumed through the narrow traits in [`model`] and [`device`].

pub mod cache;
pub mod device;
pub mod error;
pub mod handle;
pub mod key;
pub mod model;
pub mod record;
pub mod registry;
pub mod stats;

mod residency;
mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{ModelCache, ModelCacheConfig};
pub use device::{DeviceAllocator, DeviceEnumerator, DeviceId, MemorySnapshot};
pub use error::{Error, Result};
pub use handle::ModelLocker;
pub use key::CacheKey;
pub use model::{
    ClassDescriptor, DeviceModel, ModelArtifact, ModelConfig, ModelFactory, ModelPayload,
    ModelShell, ModelSizer, Precision, Weight, WeightMap,
};
pub use record::CacheRecord;
pub use registry::{CallerId, DeviceGuard, DeviceRegistry};
pub use stats::CacheStats;
