//! Backend adapters.
//!
//! A backend owns everything that depends on the tensor library: optimizer
//! construction, device placement, data-parallel wrapping, native state
//! serialization and mixed precision. The trainer only talks to [`Backend`].

pub mod reference;
pub mod registry;

pub use reference::ReferenceBackend;
pub use registry::BackendRegistry;

use crate::device::Device;
use crate::error::{DeviceError, Result, TrainError};
use crate::network::{NativeState, Network, OptimizerMap};
use kiln_core::{MixedPrecisionConfig, OptimizerConfig};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const MODEL_KEY: &str = "model";
pub const OPTIMIZER_KEY: &str = "optimizer";
pub const EPOCH_KEY: &str = "epoch";

/// Everything a checkpoint carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBundle {
    pub model: NativeState,
    /// Optimizer name → native state. May be empty.
    pub optimizer: BTreeMap<String, NativeState>,
    pub epoch: usize,
    /// Any further keys, passed through to the trainer's generic merge step.
    pub extra: Map<String, Value>,
}

impl StateBundle {
    /// Parse the logical checkpoint schema. `model` and `epoch` are required.
    pub fn from_json(path: &Path, value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(TrainError::checkpoint(format!(
                "{} does not hold a JSON object",
                path.display()
            )));
        };

        let model = map
            .remove(MODEL_KEY)
            .ok_or_else(|| TrainError::missing_key(path, MODEL_KEY))?;
        let epoch = map
            .remove(EPOCH_KEY)
            .ok_or_else(|| TrainError::missing_key(path, EPOCH_KEY))?;
        let epoch = epoch.as_u64().ok_or_else(|| {
            TrainError::checkpoint(format!("{}: epoch is not an integer", path.display()))
        })? as usize;

        let optimizer = match map.remove(OPTIMIZER_KEY) {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(states)) => states.into_iter().collect(),
            Some(_) => {
                return Err(TrainError::checkpoint(format!(
                    "{}: optimizer state is not a mapping",
                    path.display()
                )));
            }
        };

        Ok(Self {
            model,
            optimizer,
            epoch,
            extra: map,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert(MODEL_KEY.to_string(), self.model.clone());
        map.insert(
            OPTIMIZER_KEY.to_string(),
            Value::Object(self.optimizer.clone().into_iter().collect()),
        );
        map.insert(EPOCH_KEY.to_string(), Value::from(self.epoch));
        Value::Object(map)
    }

    /// Error unless every optimizer in `names` has a stored state.
    ///
    /// A missing entry is reported as a missing `optimizer.<name>` key.
    pub fn require_optimizers<'a>(
        &self,
        path: &Path,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        match names.into_iter().find(|name| !self.optimizer.contains_key(*name)) {
            Some(name) => Err(TrainError::missing_key(path, format!("{OPTIMIZER_KEY}.{name}"))),
            None => Ok(()),
        }
    }

    /// Snapshot a live network and its optimizers.
    pub fn capture(
        network: &dyn Network,
        optimizers: &OptimizerMap,
        epoch: usize,
        extra: &Map<String, Value>,
    ) -> Result<Self> {
        let optimizer = optimizers
            .iter()
            .map(|(name, opt)| Ok((name.clone(), opt.state_dict()?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            model: network.state_dict()?,
            optimizer,
            epoch,
            extra: extra.clone(),
        })
    }
}

/// A network handed back after a failed placement, with the reason.
pub struct PlacementFailure {
    pub network: Box<dyn Network>,
    pub error: DeviceError,
}

impl std::fmt::Debug for PlacementFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacementFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

pub type PlacementResult = std::result::Result<Box<dyn Network>, PlacementFailure>;

/// The contract every tensor backend implements.
pub trait Backend: Send + Sync {
    /// Registry identifier.
    fn id(&self) -> &str;

    /// Checkpoint file extensions, canonical first. Later entries are accepted
    /// on load as fallbacks.
    fn extensions(&self) -> &[&'static str];

    /// Number of usable accelerators. Errors mean the driver is unusable.
    fn probe_accelerators(&self) -> std::result::Result<usize, DeviceError>;

    fn build_optimizers(
        &self,
        network: &dyn Network,
        config: &OptimizerConfig,
    ) -> Result<OptimizerMap>;

    /// Move an unwrapped network onto a single device.
    fn place(&self, network: Box<dyn Network>, device: Device) -> PlacementResult;

    /// Replicate a network across `devices`, gathering outputs on `output_device`.
    fn wrap_for_multi_device(
        &self,
        network: Box<dyn Network>,
        devices: &[Device],
        output_device: Device,
    ) -> PlacementResult;

    /// Where data-parallel outputs are gathered. Defaults to the second
    /// requested device to spread memory load.
    fn output_device(&self, ids: &[usize]) -> Device {
        ids.get(1)
            .or(ids.first())
            .map_or(Device::Cpu, |&id| Device::Accelerator(id))
    }

    /// Write model state, every optimizer's state and `epoch` as one artifact.
    fn save_state(
        &self,
        path: &Path,
        network: &dyn Network,
        optimizers: &OptimizerMap,
        epoch: usize,
        extra: &Map<String, Value>,
    ) -> Result<()> {
        let bundle = StateBundle::capture(network, optimizers, epoch, extra)?;
        kiln_core::persistence::atomic_write_json(path, &bundle.to_json())?;
        Ok(())
    }

    /// Read a bundle without touching any live state.
    fn load_state(&self, path: &Path) -> Result<StateBundle> {
        let value: Value = kiln_core::persistence::load_json(path)?.ok_or_else(|| {
            TrainError::checkpoint(format!("{} does not exist", path.display()))
        })?;
        StateBundle::from_json(path, value)
    }

    /// Optional mixed-precision step. The default leaves optimizers untouched.
    fn apply_mixed_precision(
        &self,
        optimizers: OptimizerMap,
        config: &MixedPrecisionConfig,
    ) -> Result<OptimizerMap> {
        if config.enabled {
            tracing::warn!(
                backend = self.id(),
                "Mixed precision requested but not supported; continuing in full precision"
            );
        }
        Ok(optimizers)
    }
}
