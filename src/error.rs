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

use crate::{device::DeviceId, key::CacheKey};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The requested key is not in the cache.
    #[error("model {0} is not in the cache")]
    NotFound(CacheKey),
    /// The calling task holds no device reservation.
    #[error("no execution device is reserved by the calling task")]
    NotReserved,
    /// Waiting for a free execution device timed out.
    #[error("timed out waiting for a free execution device")]
    NoDevice,
    /// The target device could not hold the model.
    #[error("out of device memory on {device}")]
    OutOfDeviceMemory { device: DeviceId },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Self::Other(err.into())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
