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

use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    device::{DeviceAllocator, DeviceId},
    error::{Error, Result},
};

/// Identity of the unit of execution holding a reservation.
///
/// Reservations are keyed by the current tokio task. A session identity
/// would survive work hopping between tasks, but threading one through every
/// call site is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(tokio::task::Id);

impl CallerId {
    /// Identity of the calling task, or `None` outside a task context.
    pub fn current() -> Option<Self> {
        tokio::task::try_id().map(Self)
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct DeviceSlot {
    device: DeviceId,
    owner: Option<CallerId>,
}

/// Tracks which caller owns each execution device and gates new reservations
/// with a counting semaphore sized to the device count.
pub struct DeviceRegistry {
    slots: Mutex<Vec<DeviceSlot>>,
    free: Arc<Semaphore>,
    allocator: Option<Arc<dyn DeviceAllocator>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<DeviceId>, allocator: Option<Arc<dyn DeviceAllocator>>) -> Arc<Self> {
        tracing::info!(
            "using execution device(s): {}",
            devices.iter().map(|d| d.to_string()).sorted().join(", ")
        );
        let free = Arc::new(Semaphore::new(devices.len()));
        let slots = devices
            .into_iter()
            .map(|device| DeviceSlot {
                device,
                owner: None,
            })
            .collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
            free,
            allocator,
        })
    }

    /// The device set, in enumeration order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.slots.lock().iter().map(|s| s.device.clone()).collect()
    }

    /// Number of devices not currently reserved.
    pub fn free_devices(&self) -> usize {
        self.free.available_permits()
    }

    /// Reserve an execution device for the calling task.
    ///
    /// Reentrant: if the caller already owns a device the same device is
    /// returned without consuming a permit, and dropping the nested guard
    /// leaves the outer reservation in place. Otherwise the call waits up to
    /// `timeout` (`None` waits indefinitely) for a permit and then assigns
    /// the first unowned device.
    ///
    /// The slot mutex is never held while waiting on the semaphore.
    pub async fn reserve(self: &Arc<Self>, timeout: Option<Duration>) -> Result<DeviceGuard> {
        let caller = CallerId::current()
            .ok_or_else(|| Error::other(anyhow!("device reservation requires a task context")))?;

        if let Some(device) = self.owned_by(caller) {
            tracing::debug!("task {caller} already holds {device}");
            return Ok(DeviceGuard {
                registry: self.clone(),
                device,
                permit: None,
            });
        }

        let permit = match timeout {
            Some(wait) => tokio::time::timeout(wait, self.free.clone().acquire_owned())
                .await
                .map_err(|_| Error::NoDevice)?,
            None => self.free.clone().acquire_owned().await,
        }
        .map_err(Error::other)?;

        let device = {
            let mut slots = self.slots.lock();
            let slot = slots
                .iter_mut()
                .find(|s| s.owner.is_none())
                .expect("semaphore permit implies a free device");
            slot.owner = Some(caller);
            slot.device.clone()
        };

        tracing::info!("reserved execution device {device} for task {caller}");
        Ok(DeviceGuard {
            registry: self.clone(),
            device,
            permit: Some(permit),
        })
    }

    /// The device reserved by the calling task.
    pub fn current_device(&self) -> Result<DeviceId> {
        let caller = CallerId::current().ok_or(Error::NotReserved)?;
        self.owned_by(caller).ok_or(Error::NotReserved)
    }

    fn owned_by(&self, caller: CallerId) -> Option<DeviceId> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.owner == Some(caller))
            .map(|s| s.device.clone())
    }

    /// Clear ownership of `device`. A no-op if the device is already
    /// unowned. The matching semaphore permit is returned when the owning
    /// guard drops.
    pub(crate) fn release(&self, device: &DeviceId) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| &s.device == device) {
            if slot.owner.take().is_some() {
                tracing::info!("released execution device {device}");
            }
        }
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices())
            .field("free", &self.free_devices())
            .finish()
    }
}

/// Scoped device reservation. Dropping the guard releases the device on
/// every exit path, panics included.
pub struct DeviceGuard {
    registry: Arc<DeviceRegistry>,
    device: DeviceId,
    permit: Option<OwnedSemaphorePermit>,
}

impl DeviceGuard {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Whether this guard piggybacks on an enclosing reservation.
    pub fn is_reentrant(&self) -> bool {
        self.permit.is_none()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.registry.release(&self.device);
            if let Some(allocator) = &self.registry.allocator {
                allocator.empty_device_cache();
            }
        }
        // dropping the permit signals the semaphore
    }
}

impl fmt::Debug for DeviceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGuard")
            .field("device", &self.device)
            .field("reentrant", &self.is_reentrant())
            .finish()
    }
}
