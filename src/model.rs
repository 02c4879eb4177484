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

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::{device::DeviceId, error::Result};

/// Tensor type stored in weight maps. The cache never inspects tensors.
pub trait Weight: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Weight for T {}

/// Model configuration blob. Opaque to the cache; only the factory reads it.
pub trait ModelConfig: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> ModelConfig for T {}

/// Immutable mapping from parameter names to tensors.
///
/// Weight maps are shared read-only between the cache and every shell they
/// populate. Callers that want to patch weights must patch the device-local
/// copy, never the map itself.
pub type WeightMap<W> = Arc<HashMap<String, W>>;

/// Numeric precision for device-resident copies of reconstructed models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

/// Names the model class a reconstructable record is rebuilt from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    /// Class name understood by the factory.
    pub name: String,
    /// Whether the class advertises a config-based constructor.
    pub from_config: bool,
}

impl ClassDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            from_config: false,
        }
    }

    pub fn with_config_constructor(name: &str) -> Self {
        Self {
            name: name.to_string(),
            from_config: true,
        }
    }
}

/// A host-resident model object cached as an opaque blob.
///
/// Device-resident copies are produced by [`deep_clone`](Self::deep_clone)
/// followed by [`transfer_to`](Self::transfer_to). Artifacts that cannot
/// leave host memory return `false` from
/// [`supports_transfer`](Self::supports_transfer) and are handed out shared.
pub trait ModelArtifact: Send + Sync {
    /// Structural deep copy, so concurrent callers never share mutable
    /// device state.
    fn deep_clone(&self) -> Box<dyn ModelArtifact>;

    fn supports_transfer(&self) -> bool {
        true
    }

    /// Move this artifact onto `device` in place.
    fn transfer_to(&mut self, device: &DeviceId) -> Result<()>;

    /// Downcast support so callers can recover their concrete model type.
    fn as_any(&self) -> &dyn Any;
}

/// An uninitialized model produced by the factory, awaiting placement and
/// weight injection.
pub trait ModelShell<W: Weight>: Send + Sync {
    fn transfer_to(&mut self, device: &DeviceId, precision: Precision) -> Result<()>;

    fn load_weights(&mut self, weights: &WeightMap<W>) -> Result<()>;

    /// Downcast support so callers can recover their concrete model type.
    fn as_any(&self) -> &dyn Any;
}

/// Builds empty model shells from a class descriptor and configuration.
///
/// Implementations must suppress default weight initialization; the weights
/// are overwritten immediately after construction.
pub trait ModelFactory<W: Weight, C: ModelConfig>: Send + Sync {
    /// Construct through the class's config-based constructor.
    fn from_config(&self, descriptor: &ClassDescriptor, config: &C)
        -> Result<Box<dyn ModelShell<W>>>;

    /// Construct by passing the configuration as a plain argument.
    fn with_config(&self, descriptor: &ClassDescriptor, config: &C)
        -> Result<Box<dyn ModelShell<W>>>;
}

/// Estimates the host-memory footprint of a model about to be cached.
pub trait ModelSizer<W: Weight, C: ModelConfig>: Send + Sync {
    fn size_of(&self, payload: &ModelPayload<W, C>) -> u64;
}

/// What a caller hands to [`put`](crate::ModelCache::put).
pub enum ModelPayload<W: Weight, C: ModelConfig> {
    /// An opaque host-resident model object.
    Opaque(Arc<dyn ModelArtifact>),
    /// A parameterized module the cache can rebuild from configuration and
    /// weights.
    Reconstructable {
        descriptor: ClassDescriptor,
        config: Arc<C>,
        weights: WeightMap<W>,
    },
}

impl<W: Weight, C: ModelConfig> fmt::Debug for ModelPayload<W, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque(_) => f.debug_struct("ModelPayload::Opaque").finish(),
            Self::Reconstructable { descriptor, .. } => f
                .debug_struct("ModelPayload::Reconstructable")
                .field("descriptor", descriptor)
                .finish(),
        }
    }
}

/// A model made resident for one caller by a successful lock.
pub enum DeviceModel<W: Weight> {
    /// Caller-owned deep copy moved onto the reserved device.
    Copied(Box<dyn ModelArtifact>),
    /// Caller-owned shell rebuilt on the reserved device.
    Reconstructed(Box<dyn ModelShell<W>>),
    /// Host-only artifact, shared with the store. What lives on the host
    /// stays on the host.
    HostBound(Arc<dyn ModelArtifact>),
}

impl<W: Weight> DeviceModel<W> {
    pub fn as_artifact(&self) -> Option<&dyn ModelArtifact> {
        match self {
            Self::Copied(model) => Some(model.as_ref()),
            Self::HostBound(model) => Some(model.as_ref()),
            Self::Reconstructed(_) => None,
        }
    }

    pub fn as_shell(&self) -> Option<&dyn ModelShell<W>> {
        match self {
            Self::Reconstructed(shell) => Some(shell.as_ref()),
            _ => None,
        }
    }

    pub fn is_host_bound(&self) -> bool {
        matches!(self, Self::HostBound(_))
    }
}

impl<W: Weight> fmt::Debug for DeviceModel<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            Self::Copied(_) => "Copied",
            Self::Reconstructed(_) => "Reconstructed",
            Self::HostBound(_) => "HostBound",
        };
        write!(f, "DeviceModel::{variant}")
    }
}
