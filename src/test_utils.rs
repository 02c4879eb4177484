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

//! Shared fixtures: in-memory stand-ins for the model framework the cache
//! is integrated with in production.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    cache::{ModelCache, ModelCacheConfig},
    device::{DeviceAllocator, DeviceEnumerator, DeviceId, MemorySnapshot},
    error::{Error, Result},
    model::{
        ClassDescriptor, ModelArtifact, ModelFactory, ModelPayload, ModelShell, ModelSizer,
        Precision, WeightMap,
    },
};

/// Tensors are stood in by their size in bytes.
pub type TestWeight = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub layers: usize,
}

/// Opaque model object that records which device it was moved to.
pub struct TestArtifact {
    pub size: u64,
    pub movable: bool,
    pub device: Option<DeviceId>,
    /// When set, the next transfer fails with device OOM and resets the
    /// fuse. Shared across deep copies.
    pub oom_fuse: Option<Arc<AtomicBool>>,
}

impl TestArtifact {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            movable: true,
            device: None,
            oom_fuse: None,
        }
    }
}

impl ModelArtifact for TestArtifact {
    fn deep_clone(&self) -> Box<dyn ModelArtifact> {
        Box::new(Self {
            size: self.size,
            movable: self.movable,
            device: self.device.clone(),
            oom_fuse: self.oom_fuse.clone(),
        })
    }

    fn supports_transfer(&self) -> bool {
        self.movable
    }

    fn transfer_to(&mut self, device: &DeviceId) -> Result<()> {
        if let Some(fuse) = &self.oom_fuse {
            if fuse.swap(false, Ordering::Relaxed) {
                return Err(Error::OutOfDeviceMemory {
                    device: device.clone(),
                });
            }
        }
        self.device = Some(device.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Device the artifact was last moved to, if any.
pub fn artifact_device(artifact: &dyn ModelArtifact) -> Option<DeviceId> {
    artifact
        .as_any()
        .downcast_ref::<TestArtifact>()
        .and_then(|a| a.device.clone())
}

/// Shell produced by [`TestFactory`], recording placement and weight
/// injection.
pub struct TestShell {
    pub device: Option<DeviceId>,
    pub precision: Option<Precision>,
    pub weights_loaded: usize,
    pub allocator: Option<Arc<TestAllocator>>,
}

impl ModelShell<TestWeight> for TestShell {
    fn transfer_to(&mut self, device: &DeviceId, precision: Precision) -> Result<()> {
        self.device = Some(device.clone());
        self.precision = Some(precision);
        Ok(())
    }

    fn load_weights(&mut self, weights: &WeightMap<TestWeight>) -> Result<()> {
        self.weights_loaded = weights.len();
        if let Some(allocator) = &self.allocator {
            allocator
                .vram
                .fetch_add(weights.values().copied().sum::<u64>(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct TestFactory {
    pub allocator: Option<Arc<TestAllocator>>,
    pub from_config_calls: AtomicUsize,
    pub with_config_calls: AtomicUsize,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(allocator: Arc<TestAllocator>) -> Self {
        Self {
            allocator: Some(allocator),
            ..Self::default()
        }
    }

    fn shell(&self) -> Box<dyn ModelShell<TestWeight>> {
        Box::new(TestShell {
            device: None,
            precision: None,
            weights_loaded: 0,
            allocator: self.allocator.clone(),
        })
    }
}

impl ModelFactory<TestWeight, TestConfig> for TestFactory {
    fn from_config(
        &self,
        _descriptor: &ClassDescriptor,
        _config: &TestConfig,
    ) -> Result<Box<dyn ModelShell<TestWeight>>> {
        self.from_config_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.shell())
    }

    fn with_config(
        &self,
        _descriptor: &ClassDescriptor,
        _config: &TestConfig,
    ) -> Result<Box<dyn ModelShell<TestWeight>>> {
        self.with_config_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.shell())
    }
}

/// Sizer that reads the size baked into the test payloads.
pub struct TestSizer;

impl ModelSizer<TestWeight, TestConfig> for TestSizer {
    fn size_of(&self, payload: &ModelPayload<TestWeight, TestConfig>) -> u64 {
        match payload {
            ModelPayload::Opaque(model) => model
                .as_any()
                .downcast_ref::<TestArtifact>()
                .map_or(0, |a| a.size),
            ModelPayload::Reconstructable { weights, .. } => weights.values().copied().sum(),
        }
    }
}

#[derive(Default)]
pub struct TestAllocator {
    /// Bytes currently allocated on the (single) fake device.
    pub vram: AtomicU64,
    pub empty_calls: AtomicUsize,
}

impl DeviceAllocator for TestAllocator {
    fn empty_device_cache(&self) {
        self.empty_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, _device: &DeviceId) -> Option<MemorySnapshot> {
        Some(MemorySnapshot {
            device_bytes: self.vram.load(Ordering::Relaxed),
        })
    }
}

pub struct FixedDevices(pub Vec<DeviceId>);

impl DeviceEnumerator for FixedDevices {
    fn execution_devices(&self) -> Vec<DeviceId> {
        self.0.clone()
    }
}

pub fn artifact(size: u64) -> ModelPayload<TestWeight, TestConfig> {
    ModelPayload::Opaque(Arc::new(TestArtifact::new(size)))
}

pub fn host_only_artifact(size: u64) -> ModelPayload<TestWeight, TestConfig> {
    ModelPayload::Opaque(Arc::new(TestArtifact {
        movable: false,
        ..TestArtifact::new(size)
    }))
}

/// Artifact whose first transfer fails with device OOM.
pub fn oom_artifact(size: u64) -> ModelPayload<TestWeight, TestConfig> {
    ModelPayload::Opaque(Arc::new(TestArtifact {
        oom_fuse: Some(Arc::new(AtomicBool::new(true))),
        ..TestArtifact::new(size)
    }))
}

pub fn module(
    weights: &[(&str, u64)],
    from_config: bool,
) -> ModelPayload<TestWeight, TestConfig> {
    let weights: HashMap<String, TestWeight> = weights
        .iter()
        .map(|(name, size)| (name.to_string(), *size))
        .collect();
    ModelPayload::Reconstructable {
        descriptor: if from_config {
            ClassDescriptor::with_config_constructor("test-module")
        } else {
            ClassDescriptor::new("test-module")
        },
        config: Arc::new(TestConfig { layers: 2 }),
        weights: Arc::new(weights),
    }
}

/// Cache over the test fixtures, returning the factory and allocator for
/// assertions.
pub fn build_cache(
    budget: u64,
    devices: &[&str],
) -> (
    ModelCache<TestWeight, TestConfig>,
    Arc<TestFactory>,
    Arc<TestAllocator>,
) {
    let allocator = Arc::new(TestAllocator::default());
    let factory = Arc::new(TestFactory::with_allocator(allocator.clone()));
    let config = ModelCacheConfig {
        max_cache_bytes: budget,
        log_memory_usage: true,
        ..Default::default()
    };
    let cache = ModelCache::new(
        config,
        &FixedDevices(devices.iter().map(|d| DeviceId::from(*d)).collect()),
        factory.clone(),
        Arc::new(TestSizer),
        Some(allocator.clone()),
    );
    (cache, factory, allocator)
}
