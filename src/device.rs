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

/// Identifier of a memory tier or accelerator, e.g. `"host"` or `"cuda:0"`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DeviceId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

/// Reports the execution devices available at startup.
///
/// The cache enumerates devices exactly once when it is constructed; the
/// device set is never resized afterwards.
pub trait DeviceEnumerator: Send + Sync {
    fn execution_devices(&self) -> Vec<DeviceId>;
}

/// Point-in-time view of a device's allocated memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub device_bytes: u64,
}

/// Optional hooks into the device memory allocator.
///
/// `empty_device_cache` is invoked after eviction and after offload so the
/// allocator can return freed blocks. `snapshot` feeds the advisory size
/// diagnostics; returning `None` disables them.
pub trait DeviceAllocator: Send + Sync {
    fn empty_device_cache(&self);

    fn snapshot(&self, device: &DeviceId) -> Option<MemorySnapshot> {
        let _ = device;
        None
    }
}
