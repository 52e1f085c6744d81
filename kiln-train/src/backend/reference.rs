//! Reference CPU backend.
//!
//! A dependency-free backend with a single linear model, SGD and Adam, and a
//! data-parallel wrapper over virtual accelerators. It exercises every part of
//! the backend contract and is what the CLI and the integration tests train.

use super::{Backend, PlacementFailure, PlacementResult};
use crate::data::{Array, Batch};
use crate::device::Device;
use crate::error::{DeviceError, Result, TrainError};
use crate::losses::LossMap;
use crate::metrics::{MetricMap, MetricValues, evaluate};
use crate::network::{ClosureOutput, NativeState, Network, Optimizer, OptimizerMap};
use kiln_core::{MixedPrecisionConfig, OptimizerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::any::Any;

pub const BACKEND_ID: &str = "reference";

/// Name of the single optimizer the reference backend builds.
pub const DEFAULT_OPTIMIZER: &str = "default";

// ---------------------------------------------------------------------------
// Optimizers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd {
        momentum: f64,
        weight_decay: f64,
    },
    Adam {
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
    },
}

/// Static or dynamic loss scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    pub scale: f64,
    pub dynamic: bool,
    pub growth_interval: u32,
    clean_steps: u32,
    pub skipped_steps: u64,
}

impl LossScaler {
    pub fn new(scale: f64, dynamic: bool) -> Self {
        Self {
            scale,
            dynamic,
            growth_interval: 2000,
            clean_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Returns false when the step must be skipped.
    fn observe(&mut self, finite: bool) -> bool {
        if !finite {
            self.skipped_steps += 1;
            self.clean_steps = 0;
            if self.dynamic {
                self.scale = (self.scale / 2.0).max(1.0);
            }
            return false;
        }
        self.clean_steps += 1;
        if self.dynamic && self.clean_steps >= self.growth_interval {
            self.scale *= 2.0;
            self.clean_steps = 0;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceOptimizer {
    kind: OptimizerKind,
    lr: f64,
    step: u64,
    first_moment: Vec<f64>,
    second_moment: Vec<f64>,
    #[serde(default)]
    scaler: Option<LossScaler>,
}

fn param_f64(config: &OptimizerConfig, key: &str, default: f64) -> Result<f64> {
    match config.params.get(key) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            TrainError::config(format!("optimizer parameter '{key}' must be a number"))
        }),
    }
}

impl ReferenceOptimizer {
    pub fn sgd(lr: f64, momentum: f64, num_params: usize) -> Self {
        Self::new(
            OptimizerKind::Sgd {
                momentum,
                weight_decay: 0.0,
            },
            lr,
            num_params,
        )
    }

    pub fn adam(lr: f64, num_params: usize) -> Self {
        Self::new(
            OptimizerKind::Adam {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 0.0,
            },
            lr,
            num_params,
        )
    }

    fn new(kind: OptimizerKind, lr: f64, num_params: usize) -> Self {
        let second = match kind {
            OptimizerKind::Adam { .. } => vec![0.0; num_params],
            OptimizerKind::Sgd { .. } => Vec::new(),
        };
        Self {
            kind,
            lr,
            step: 0,
            first_moment: vec![0.0; num_params],
            second_moment: second,
            scaler: None,
        }
    }

    pub fn from_config(config: &OptimizerConfig, num_params: usize) -> Result<Self> {
        let weight_decay = param_f64(config, "weight_decay", 0.0)?;
        let kind = match config.name.to_ascii_lowercase().as_str() {
            "sgd" => OptimizerKind::Sgd {
                momentum: param_f64(config, "momentum", 0.0)?,
                weight_decay,
            },
            "adam" => {
                let (beta1, beta2) = match config.params.get("betas").and_then(|b| b.as_array()) {
                    Some(betas) if betas.len() == 2 => (
                        betas[0].as_f64().unwrap_or(0.9),
                        betas[1].as_f64().unwrap_or(0.999),
                    ),
                    _ => (
                        param_f64(config, "beta1", 0.9)?,
                        param_f64(config, "beta2", 0.999)?,
                    ),
                };
                OptimizerKind::Adam {
                    beta1,
                    beta2,
                    eps: param_f64(config, "eps", 1e-8)?,
                    weight_decay,
                }
            }
            other => {
                return Err(TrainError::UnknownComponent {
                    kind: "optimizer",
                    name: other.to_string(),
                });
            }
        };
        let default_lr = match kind {
            OptimizerKind::Sgd { .. } => 1e-2,
            OptimizerKind::Adam { .. } => 1e-3,
        };
        let lr = param_f64(config, "lr", default_lr)?;
        Ok(Self::new(kind, lr, num_params))
    }

    pub fn kind(&self) -> &OptimizerKind {
        &self.kind
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn loss_scale(&self) -> f64 {
        self.scaler.as_ref().map_or(1.0, |s| s.scale)
    }

    pub fn scaler(&self) -> Option<&LossScaler> {
        self.scaler.as_ref()
    }

    pub fn enable_loss_scaling(&mut self, scaler: LossScaler) {
        self.scaler = Some(scaler);
    }

    /// Apply one update from gradients computed under [`Self::loss_scale`].
    ///
    /// Returns false if loss scaling detected an overflow and skipped the step.
    pub fn step(&mut self, params: &mut [f64], scaled_grads: &[f64]) -> Result<bool> {
        if params.len() != scaled_grads.len() || params.len() != self.first_moment.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![self.first_moment.len()],
                actual: vec![scaled_grads.len()],
            });
        }
        let scale = self.loss_scale();
        let grads: Vec<f64> = scaled_grads.iter().map(|g| g / scale).collect();
        if let Some(scaler) = self.scaler.as_mut() {
            if !scaler.observe(grads.iter().all(|g| g.is_finite())) {
                tracing::debug!(scale = scaler.scale, "Gradient overflow; skipping step");
                return Ok(false);
            }
        }

        self.step += 1;
        match self.kind {
            OptimizerKind::Sgd {
                momentum,
                weight_decay,
            } => {
                for ((p, g), v) in params.iter_mut().zip(&grads).zip(&mut self.first_moment) {
                    let g = g + weight_decay * *p;
                    *v = momentum * *v + g;
                    *p -= self.lr * *v;
                }
            }
            OptimizerKind::Adam {
                beta1,
                beta2,
                eps,
                weight_decay,
            } => {
                let t = self.step as i32;
                let c1 = 1.0 - beta1.powi(t);
                let c2 = 1.0 - beta2.powi(t);
                for (i, (p, g)) in params.iter_mut().zip(&grads).enumerate() {
                    let g = g + weight_decay * *p;
                    let m = &mut self.first_moment[i];
                    let v = &mut self.second_moment[i];
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= self.lr * (*m / c1) / ((*v / c2).sqrt() + eps);
                }
            }
        }
        Ok(true)
    }
}

impl Optimizer for ReferenceOptimizer {
    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> Result<NativeState> {
        Ok(serde_json::to_value(self)?)
    }

    fn load_state_dict(&mut self, state: &NativeState) -> Result<()> {
        let loaded: ReferenceOptimizer = serde_json::from_value(state.clone())?;
        if loaded.first_moment.len() != self.first_moment.len() {
            return Err(TrainError::ShapeMismatch {
                expected: vec![self.first_moment.len()],
                actual: vec![loaded.first_moment.len()],
            });
        }
        *self = loaded;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn reference_optimizer(optimizers: &mut OptimizerMap) -> Result<&mut ReferenceOptimizer> {
    optimizers
        .get_mut(DEFAULT_OPTIMIZER)
        .ok_or_else(|| {
            TrainError::backend(BACKEND_ID, format!("no '{DEFAULT_OPTIMIZER}' optimizer"))
        })?
        .as_any_mut()
        .downcast_mut::<ReferenceOptimizer>()
        .ok_or_else(|| TrainError::backend(BACKEND_ID, "optimizer was not built by this backend"))
}

// ---------------------------------------------------------------------------
// Networks
// ---------------------------------------------------------------------------

/// Serialized parameters: weights (`out × in`, row-major) followed by bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearState {
    in_features: usize,
    out_features: usize,
    params: Vec<f64>,
}

/// `y = x Wᵀ + b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearNetwork {
    state: LinearState,
    device: Device,
    training: bool,
}

struct Gradients {
    grads: Vec<f64>,
    losses: MetricValues,
    predictions: Array,
}

impl LinearNetwork {
    /// Uniform init in `±1/sqrt(in_features)`, reproducible from `seed`.
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let params = (0..(in_features + 1) * out_features)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        Self {
            state: LinearState {
                in_features,
                out_features,
                params,
            },
            device: Device::Cpu,
            training: true,
        }
    }

    pub fn in_features(&self) -> usize {
        self.state.in_features
    }

    pub fn out_features(&self) -> usize {
        self.state.out_features
    }

    pub fn parameters(&self) -> &[f64] {
        &self.state.params
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn weights(&self) -> &[f64] {
        &self.state.params[..self.state.in_features * self.state.out_features]
    }

    fn bias(&self) -> &[f64] {
        &self.state.params[self.state.in_features * self.state.out_features..]
    }

    fn inputs(&self, batch: &Batch) -> Result<Array> {
        let x = batch.data()?.flatten_rows();
        if x.row_len() != self.state.in_features {
            return Err(TrainError::ShapeMismatch {
                expected: vec![x.rows(), self.state.in_features],
                actual: x.shape().to_vec(),
            });
        }
        Ok(x)
    }

    fn predict(&self, x: &Array) -> Result<Array> {
        let (n_in, n_out) = (self.state.in_features, self.state.out_features);
        let (w, b) = (self.weights(), self.bias());
        let mut out = Vec::with_capacity(x.rows() * n_out);
        for r in 0..x.rows() {
            let row = x.row(r);
            for o in 0..n_out {
                let dot: f64 = row
                    .iter()
                    .zip(&w[o * n_in..(o + 1) * n_in])
                    .map(|(a, b)| a * b)
                    .sum();
                out.push(dot + b[o]);
            }
        }
        Array::new(vec![x.rows(), n_out], out)
    }

    /// Summed loss gradients w.r.t. the parameters, multiplied by `scale`.
    fn gradients(&self, batch: &Batch, losses: &LossMap, scale: f64) -> Result<Gradients> {
        let x = self.inputs(batch)?;
        let target = batch.label()?;
        let predictions = self.predict(&x)?;
        let (n_in, n_out) = (self.state.in_features, self.state.out_features);

        let mut grad_pred = vec![0.0; predictions.len()];
        let mut loss_values = MetricValues::new();
        for (name, loss) in losses {
            loss_values.insert(name.clone(), loss.value(&predictions, target)?);
            let g = loss.gradient(&predictions, target)?;
            for (acc, v) in grad_pred.iter_mut().zip(g.data()) {
                *acc += v;
            }
        }

        let mut grads = vec![0.0; self.state.params.len()];
        let (gw, gb) = grads.split_at_mut(n_in * n_out);
        for r in 0..x.rows() {
            let row = x.row(r);
            for o in 0..n_out {
                let gp = grad_pred[r * n_out + o] * scale;
                gb[o] += gp;
                for (i, xi) in row.iter().enumerate() {
                    gw[o * n_in + i] += gp * xi;
                }
            }
        }

        Ok(Gradients {
            grads,
            losses: loss_values,
            predictions,
        })
    }
}

impl Network for LinearNetwork {
    fn prepare_batch(
        &self,
        batch: &Batch,
        input_device: Device,
        _output_device: Device,
    ) -> Result<Batch> {
        self.inputs(batch)?;
        Ok(batch.clone().to_device(input_device))
    }

    fn closure(
        &mut self,
        batch: &Batch,
        optimizers: &mut OptimizerMap,
        losses: &LossMap,
        metrics: &MetricMap,
    ) -> Result<ClosureOutput> {
        let optimizer = reference_optimizer(optimizers)?;
        let computed = self.gradients(batch, losses, optimizer.loss_scale())?;
        optimizer.step(&mut self.state.params, &computed.grads)?;
        let metrics = evaluate(metrics, &computed.predictions, batch.label()?)?;
        Ok(ClosureOutput {
            metrics,
            losses: computed.losses,
            predictions: computed.predictions,
        })
    }

    fn forward(&self, batch: &Batch) -> Result<Array> {
        self.predict(&self.inputs(batch)?)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn state_dict(&self) -> Result<NativeState> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn load_state_dict(&mut self, state: &NativeState) -> Result<()> {
        let loaded: LinearState = serde_json::from_value(state.clone())?;
        if (loaded.in_features, loaded.out_features)
            != (self.state.in_features, self.state.out_features)
            || loaded.params.len() != self.state.params.len()
        {
            return Err(TrainError::ShapeMismatch {
                expected: vec![self.state.out_features, self.state.in_features],
                actual: vec![loaded.out_features, loaded.in_features],
            });
        }
        self.state = loaded;
        Ok(())
    }

    fn num_parameters(&self) -> usize {
        self.state.params.len()
    }

    fn devices(&self) -> Vec<Device> {
        vec![self.device]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Replicates a [`LinearNetwork`] across devices.
///
/// Each batch is split into one chunk per replica; chunk gradients are
/// weighted by chunk size and averaged before a single optimizer step. State
/// dicts are those of the inner network, so checkpoints move freely between
/// wrapped and unwrapped networks.
#[derive(Debug, Clone, PartialEq)]
pub struct DataParallelNetwork {
    inner: LinearNetwork,
    replicas: Vec<Device>,
    output_device: Device,
}

impl DataParallelNetwork {
    pub fn inner(&self) -> &LinearNetwork {
        &self.inner
    }

    pub fn output_device(&self) -> Device {
        self.output_device
    }
}

impl Network for DataParallelNetwork {
    fn prepare_batch(
        &self,
        batch: &Batch,
        input_device: Device,
        output_device: Device,
    ) -> Result<Batch> {
        self.inner.prepare_batch(batch, input_device, output_device)
    }

    fn closure(
        &mut self,
        batch: &Batch,
        optimizers: &mut OptimizerMap,
        losses: &LossMap,
        metrics: &MetricMap,
    ) -> Result<ClosureOutput> {
        let optimizer = reference_optimizer(optimizers)?;
        let scale = optimizer.loss_scale();
        let total = batch.num_samples().max(1) as f64;

        let mut grads = vec![0.0; self.inner.num_parameters()];
        let mut loss_values = MetricValues::new();
        let mut predictions = Vec::new();
        for chunk in batch.split(self.replicas.len()) {
            let weight = chunk.num_samples() as f64 / total;
            let computed = self.inner.gradients(&chunk, losses, scale)?;
            for (acc, g) in grads.iter_mut().zip(&computed.grads) {
                *acc += weight * g;
            }
            for (name, value) in computed.losses {
                *loss_values.entry(name).or_default() += weight * value;
            }
            predictions.push(computed.predictions);
        }

        optimizer.step(&mut self.inner.state.params, &grads)?;
        let predictions = Array::concat_rows(&predictions.iter().collect::<Vec<_>>())?;
        let metrics = evaluate(metrics, &predictions, batch.label()?)?;
        Ok(ClosureOutput {
            metrics,
            losses: loss_values,
            predictions,
        })
    }

    fn forward(&self, batch: &Batch) -> Result<Array> {
        self.inner.forward(batch)
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }

    fn state_dict(&self) -> Result<NativeState> {
        self.inner.state_dict()
    }

    fn load_state_dict(&mut self, state: &NativeState) -> Result<()> {
        self.inner.load_state_dict(state)
    }

    fn num_parameters(&self) -> usize {
        self.inner.num_parameters()
    }

    fn devices(&self) -> Vec<Device> {
        self.replicas.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The reference backend.
///
/// It has no accelerator driver; `with_virtual_accelerators` makes the probe
/// report that many devices so placement and data parallelism can run on the CPU.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend {
    virtual_accelerators: Option<usize>,
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_virtual_accelerators(count: usize) -> Self {
        Self {
            virtual_accelerators: Some(count),
        }
    }

    /// A freshly initialized linear network for this backend.
    pub fn linear(in_features: usize, out_features: usize, seed: u64) -> Box<dyn Network> {
        Box::new(LinearNetwork::new(in_features, out_features, seed))
    }
}

fn unwrap_linear(network: &dyn Network) -> Option<LinearNetwork> {
    let any = network.as_any();
    any.downcast_ref::<LinearNetwork>()
        .cloned()
        .or_else(|| any.downcast_ref::<DataParallelNetwork>().map(|dp| dp.inner.clone()))
}

impl Backend for ReferenceBackend {
    fn id(&self) -> &str {
        BACKEND_ID
    }

    fn extensions(&self) -> &[&'static str] {
        &["ckpt", "json"]
    }

    fn probe_accelerators(&self) -> std::result::Result<usize, DeviceError> {
        self.virtual_accelerators.ok_or_else(|| {
            DeviceError::DriverUnavailable("reference backend has no accelerator driver".into())
        })
    }

    fn build_optimizers(
        &self,
        network: &dyn Network,
        config: &OptimizerConfig,
    ) -> Result<OptimizerMap> {
        let optimizer = ReferenceOptimizer::from_config(config, network.num_parameters())?;
        tracing::debug!(
            optimizer = %config.name,
            lr = optimizer.learning_rate(),
            params = network.num_parameters(),
            "Built optimizer"
        );
        let mut optimizers = OptimizerMap::new();
        optimizers.insert(DEFAULT_OPTIMIZER.to_string(), Box::new(optimizer));
        Ok(optimizers)
    }

    fn place(&self, network: Box<dyn Network>, device: Device) -> PlacementResult {
        let Some(mut linear) = unwrap_linear(network.as_ref()) else {
            return Err(PlacementFailure {
                network,
                error: DeviceError::PlacementFailed {
                    device: device.to_string(),
                    reason: "network was not built by the reference backend".into(),
                },
            });
        };
        if let Device::Accelerator(id) = device {
            let available = self.virtual_accelerators.unwrap_or(0);
            if id >= available {
                return Err(PlacementFailure {
                    network,
                    error: DeviceError::NotPresent { id, available },
                });
            }
        }
        linear.device = device;
        Ok(Box::new(linear))
    }

    fn wrap_for_multi_device(
        &self,
        network: Box<dyn Network>,
        devices: &[Device],
        output_device: Device,
    ) -> PlacementResult {
        let Some(mut inner) = unwrap_linear(network.as_ref()) else {
            return Err(PlacementFailure {
                network,
                error: DeviceError::PlacementFailed {
                    device: format!("{devices:?}"),
                    reason: "network was not built by the reference backend".into(),
                },
            });
        };
        inner.device = devices.first().copied().unwrap_or_default();
        Ok(Box::new(DataParallelNetwork {
            inner,
            replicas: devices.to_vec(),
            output_device,
        }))
    }

    fn apply_mixed_precision(
        &self,
        mut optimizers: OptimizerMap,
        config: &MixedPrecisionConfig,
    ) -> Result<OptimizerMap> {
        if !config.enabled {
            return Ok(optimizers);
        }
        for (name, optimizer) in optimizers.iter_mut() {
            let optimizer = optimizer
                .as_any_mut()
                .downcast_mut::<ReferenceOptimizer>()
                .ok_or_else(|| {
                    TrainError::backend(BACKEND_ID, format!("optimizer '{name}' is foreign"))
                })?;
            optimizer.enable_loss_scaling(LossScaler::new(config.loss_scale, config.dynamic));
        }
        tracing::info!(
            loss_scale = config.loss_scale,
            dynamic = config.dynamic,
            "Enabled loss scaling"
        );
        Ok(optimizers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::{MseLoss, build_losses};
    use std::sync::Arc;

    fn batch(rows: &[(f64, f64)]) -> Batch {
        Batch::from_parts(
            Array::new(vec![rows.len(), 1], rows.iter().map(|r| r.0).collect()).unwrap(),
            Array::new(vec![rows.len(), 1], rows.iter().map(|r| r.1).collect()).unwrap(),
        )
    }

    fn sgd_config(lr: f64) -> OptimizerConfig {
        OptimizerConfig {
            name: "sgd".into(),
            params: [("lr".to_string(), serde_json::json!(lr))].into(),
        }
    }

    #[test]
    fn test_sgd_step() {
        let mut opt = ReferenceOptimizer::sgd(0.5, 0.0, 2);
        let mut params = vec![1.0, 1.0];
        assert!(opt.step(&mut params, &[1.0, -2.0]).unwrap());
        assert_eq!(params, vec![0.5, 2.0]);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut opt = ReferenceOptimizer::adam(0.1, 1);
        let mut params = vec![0.0];
        opt.step(&mut params, &[3.0]).unwrap();
        assert!((params[0] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_optimizer() {
        let config = OptimizerConfig {
            name: "lion".into(),
            params: Default::default(),
        };
        assert!(ReferenceOptimizer::from_config(&config, 3).is_err());
    }

    #[test]
    fn test_loss_scaler_skips_overflow() {
        let mut opt = ReferenceOptimizer::sgd(0.1, 0.0, 1);
        opt.enable_loss_scaling(LossScaler::new(8.0, true));
        let mut params = vec![1.0];
        assert!(!opt.step(&mut params, &[f64::INFINITY]).unwrap());
        assert_eq!(params, vec![1.0]);
        assert_eq!(opt.loss_scale(), 4.0);
        assert!(opt.step(&mut params, &[4.0]).unwrap());
        assert!((params[0] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_linear_closure_reduces_loss() {
        let backend = ReferenceBackend::new();
        let mut net = LinearNetwork::new(1, 1, 3);
        let mut optimizers = backend.build_optimizers(&net, &sgd_config(0.1)).unwrap();
        let losses = build_losses(&["mse".to_string()]).unwrap();
        let data = batch(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]);

        let first = net
            .closure(&data, &mut optimizers, &losses, &MetricMap::new())
            .unwrap();
        for _ in 0..200 {
            net.closure(&data, &mut optimizers, &losses, &MetricMap::new())
                .unwrap();
        }
        let last = net
            .closure(&data, &mut optimizers, &losses, &MetricMap::new())
            .unwrap();
        assert!(last.losses["mse"] < first.losses["mse"]);
        assert!(last.losses["mse"] < 1e-3);
    }

    #[test]
    fn test_data_parallel_matches_single_device_step() {
        let backend = ReferenceBackend::with_virtual_accelerators(2);
        let mut losses = LossMap::new();
        losses.insert("mse".into(), Arc::new(MseLoss));
        let data = batch(&[(0.0, 1.0), (1.0, 3.0), (2.0, 5.0), (3.0, 7.0), (4.0, 9.0)]);

        let mut single = ReferenceBackend::linear(1, 1, 11);
        let mut single_opts = backend.build_optimizers(single.as_ref(), &sgd_config(0.05)).unwrap();
        let mut wrapped = backend
            .wrap_for_multi_device(
                ReferenceBackend::linear(1, 1, 11),
                &[Device::Accelerator(0), Device::Accelerator(1)],
                Device::Accelerator(1),
            )
            .unwrap();
        let mut wrapped_opts = backend
            .build_optimizers(wrapped.as_ref(), &sgd_config(0.05))
            .unwrap();

        let a = single
            .closure(&data, &mut single_opts, &losses, &MetricMap::new())
            .unwrap();
        let b = wrapped
            .closure(&data, &mut wrapped_opts, &losses, &MetricMap::new())
            .unwrap();

        assert!((a.losses["mse"] - b.losses["mse"]).abs() < 1e-12);
        let pa = single.state_dict().unwrap();
        let pb = wrapped.state_dict().unwrap();
        let (pa, pb): (LinearState, LinearState) =
            (serde_json::from_value(pa).unwrap(), serde_json::from_value(pb).unwrap());
        for (x, y) in pa.params.iter().zip(&pb.params) {
            assert!((x - y).abs() < 1e-12);
        }
        assert_eq!(
            wrapped.devices(),
            vec![Device::Accelerator(0), Device::Accelerator(1)]
        );
    }

    #[test]
    fn test_place_rejects_missing_virtual_device() {
        let backend = ReferenceBackend::with_virtual_accelerators(1);
        let Err(failure) = backend.place(ReferenceBackend::linear(2, 1, 0), Device::Accelerator(4))
        else {
            panic!("placement on a missing device succeeded");
        };
        assert_eq!(
            failure.error,
            DeviceError::NotPresent {
                id: 4,
                available: 1
            }
        );
        assert_eq!(failure.network.num_parameters(), 3);
    }

    #[test]
    fn test_probe_without_driver() {
        assert!(ReferenceBackend::new().probe_accelerators().is_err());
        assert_eq!(
            ReferenceBackend::with_virtual_accelerators(2)
                .probe_accelerators()
                .unwrap(),
            2
        );
    }

    #[test]
    fn test_prepare_batch_checks_width() {
        let net = LinearNetwork::new(3, 1, 0);
        let err = net
            .prepare_batch(&batch(&[(1.0, 1.0)]), Device::Cpu, Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_mixed_precision_enables_scaling() {
        let backend = ReferenceBackend::new();
        let net = LinearNetwork::new(2, 1, 0);
        let optimizers = backend.build_optimizers(&net, &sgd_config(0.1)).unwrap();
        let config = MixedPrecisionConfig {
            enabled: true,
            loss_scale: 128.0,
            dynamic: false,
        };
        let mut optimizers = backend.apply_mixed_precision(optimizers, &config).unwrap();
        let opt = reference_optimizer(&mut optimizers).unwrap();
        assert_eq!(opt.loss_scale(), 128.0);
    }
}
