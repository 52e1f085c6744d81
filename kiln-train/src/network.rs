//! The model and optimizer contracts the trainer drives.
//!
//! Both are object-safe so trainers, callbacks and the backend registry can
//! work with `Box<dyn Network>` and `Box<dyn Optimizer>` without knowing the
//! concrete backend.

use crate::data::{Array, Batch};
use crate::device::Device;
use crate::error::Result;
use crate::losses::LossMap;
use crate::metrics::{MetricMap, MetricValues};
use std::any::Any;
use std::collections::BTreeMap;

/// Native optimizer state, as produced by the owning backend.
pub type NativeState = serde_json::Value;

/// Output of one closure invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureOutput {
    pub metrics: MetricValues,
    pub losses: MetricValues,
    pub predictions: Array,
}

/// A trainable module as seen by the trainer.
pub trait Network: Send {
    /// Convert a raw batch into what this network consumes: inputs on
    /// `input_device`, targets on `output_device`.
    fn prepare_batch(&self, batch: &Batch, input_device: Device, output_device: Device)
    -> Result<Batch>;

    /// Forward pass, per-loss backward, gradient aggregation and one optimizer step.
    fn closure(
        &mut self,
        batch: &Batch,
        optimizers: &mut OptimizerMap,
        losses: &LossMap,
        metrics: &MetricMap,
    ) -> Result<ClosureOutput>;

    /// Inference only: no gradients, no optimizer step.
    fn forward(&self, batch: &Batch) -> Result<Array>;

    /// Switch between training and inference behavior.
    fn set_training(&mut self, training: bool);

    fn state_dict(&self) -> Result<NativeState>;

    fn load_state_dict(&mut self, state: &NativeState) -> Result<()>;

    fn num_parameters(&self) -> usize;

    /// Devices the network currently lives on.
    fn devices(&self) -> Vec<Device>;

    /// Downcast hooks so a backend can reach its own network types.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An optimizer built by a backend for a specific network.
pub trait Optimizer: Send {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state_dict(&self) -> Result<NativeState>;

    fn load_state_dict(&mut self, state: &NativeState) -> Result<()>;

    /// Downcast hook so a backend's closure can reach its own optimizer type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Optimizers keyed by a name that stays stable for the trainer's lifetime.
pub type OptimizerMap = BTreeMap<String, Box<dyn Optimizer>>;

/// Current learning rate of every optimizer.
pub fn learning_rates(optimizers: &OptimizerMap) -> BTreeMap<String, f64> {
    optimizers
        .iter()
        .map(|(name, opt)| (name.clone(), opt.learning_rate()))
        .collect()
}
