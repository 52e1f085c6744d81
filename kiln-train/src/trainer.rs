//! The trainer: setup, the epoch loop, validation and prediction.

use crate::backend::{Backend, StateBundle};
use crate::callbacks::{
    Callback, CallbackSequencer, EarlyStopping, LEARNING_RATE, LEARNING_RATE_PREFIX, START_EPOCH,
    STOP_TRAINING, StateUpdate, schedule_from_config,
};
use crate::checkpoint::{CheckpointKind, CheckpointManager};
use crate::data::{Array, Batch, BatchIter, BatchSource, LABEL_KEY};
use crate::device::{Device, resolve_placement};
use crate::error::{Result, TrainError};
use crate::losses::{LossMap, build_losses};
use crate::metrics::{
    EpochRecord, MetricAccumulator, MetricMap, MetricValues, TrainingHistory, build_metrics,
    evaluate,
};
use crate::network::{Network, OptimizerMap, learning_rates};
use kiln_core::TrainingConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerPhase {
    Uninitialized,
    Setup,
    Training,
    TrainingEnd,
}

/// Everything the epoch loop mutates. Callbacks read it and change it only
/// through [`StateUpdate`]s.
pub struct TrainerState {
    network: Box<dyn Network>,
    optimizers: OptimizerMap,
    input_device: Device,
    output_device: Device,
    use_accelerator: bool,
    start_epoch: usize,
    epoch: usize,
    stop_training: bool,
    extras: Map<String, Value>,
}

impl TrainerState {
    pub fn new(
        network: Box<dyn Network>,
        optimizers: OptimizerMap,
        input_device: Device,
        output_device: Device,
        use_accelerator: bool,
    ) -> Self {
        Self {
            network,
            optimizers,
            input_device,
            output_device,
            use_accelerator,
            start_epoch: 1,
            epoch: 0,
            stop_training: false,
            extras: Map::new(),
        }
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn network_mut(&mut self) -> &mut dyn Network {
        self.network.as_mut()
    }

    pub fn optimizers(&self) -> &OptimizerMap {
        &self.optimizers
    }

    pub fn input_device(&self) -> Device {
        self.input_device
    }

    pub fn output_device(&self) -> Device {
        self.output_device
    }

    pub fn use_accelerator(&self) -> bool {
        self.use_accelerator
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// The epoch currently running, or the last one that ran.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_training
    }

    /// Overrides the trainer does not interpret.
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    pub fn learning_rates(&self) -> BTreeMap<String, f64> {
        learning_rates(&self.optimizers)
    }

    /// Merge state-field overrides.
    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        for (key, value) in update {
            if key == LEARNING_RATE {
                let lr = lr_value(&key, &value)?;
                for optimizer in self.optimizers.values_mut() {
                    optimizer.set_learning_rate(lr);
                }
            } else if let Some(name) = key.strip_prefix(LEARNING_RATE_PREFIX) {
                let lr = lr_value(&key, &value)?;
                self.optimizers
                    .get_mut(name)
                    .ok_or_else(|| {
                        TrainError::invalid_state(format!("no optimizer named '{name}'"))
                    })?
                    .set_learning_rate(lr);
            } else if key == STOP_TRAINING {
                self.stop_training = value.as_bool().ok_or_else(|| {
                    TrainError::invalid_state(format!("'{STOP_TRAINING}' must be a boolean"))
                })?;
            } else if key == START_EPOCH {
                let epoch = value.as_u64().filter(|&e| e >= 1).ok_or_else(|| {
                    TrainError::invalid_state(format!("'{START_EPOCH}' must be a positive integer"))
                })?;
                self.start_epoch = epoch as usize;
            } else {
                self.extras.insert(key, value);
            }
        }
        Ok(())
    }

    /// Load a checkpoint bundle into the live network and optimizers.
    ///
    /// Every optimizer must have an entry in the bundle; nothing is changed
    /// otherwise. The bundle's epoch becomes the start epoch (never below 1);
    /// remaining keys go through [`Self::apply`].
    pub fn apply_bundle(&mut self, bundle: StateBundle) -> Result<()> {
        if let Some(name) = self
            .optimizers
            .keys()
            .find(|name| !bundle.optimizer.contains_key(*name))
        {
            return Err(TrainError::invalid_state(format!(
                "checkpoint has no state for optimizer '{name}'"
            )));
        }
        self.network.load_state_dict(&bundle.model)?;
        for (name, optimizer) in self.optimizers.iter_mut() {
            if let Some(state) = bundle.optimizer.get(name) {
                optimizer.load_state_dict(state)?;
            }
        }
        for name in bundle.optimizer.keys() {
            if !self.optimizers.contains_key(name) {
                tracing::warn!(
                    optimizer = %name,
                    "Checkpoint has state for an unknown optimizer; ignoring"
                );
            }
        }
        self.epoch = bundle.epoch;
        self.start_epoch = bundle.epoch.max(1);
        self.apply(StateUpdate::from(bundle.extra))
    }
}

fn lr_value(key: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .filter(|lr| lr.is_finite() && *lr >= 0.0)
        .ok_or_else(|| TrainError::invalid_state(format!("'{key}' must be a non-negative number")))
}

impl fmt::Debug for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainerState")
            .field("devices", &self.network.devices())
            .field("optimizers", &self.learning_rates())
            .field("input_device", &self.input_device)
            .field("output_device", &self.output_device)
            .field("use_accelerator", &self.use_accelerator)
            .field("start_epoch", &self.start_epoch)
            .field("epoch", &self.epoch)
            .field("stop_training", &self.stop_training)
            .field("extras", &self.extras)
            .finish()
    }
}

/// Output of [`Trainer::predict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// All predictions in source order; `None` if the source was empty.
    pub predictions: Option<Array>,
    /// Matching labels, when every batch carried them.
    pub targets: Option<Array>,
    /// Per-batch metrics averaged over batches.
    pub batch_metrics: MetricValues,
    /// Metrics computed once over all predictions.
    pub dataset_metrics: MetricValues,
}

impl Prediction {
    /// Batch and dataset metrics in one map; dataset values win on collision.
    pub fn metrics(&self) -> MetricValues {
        let mut merged = self.batch_metrics.clone();
        merged.extend(self.dataset_metrics.clone());
        merged
    }
}

/// Result of a [`Trainer::train`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub history: TrainingHistory,
    pub first_epoch: usize,
    pub last_epoch: Option<usize>,
    pub best_checkpoint: Option<PathBuf>,
    /// Whether the network returned holds the best checkpoint's weights.
    pub restored_best: bool,
}

/// Groups single-sample batches into batches of a fixed size.
struct ArtificialBatches<'a> {
    samples: BatchIter<'a>,
    size: usize,
}

impl Iterator for ArtificialBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut group = Vec::with_capacity(self.size);
        for sample in self.samples.by_ref() {
            match sample {
                Ok(sample) => group.push(sample),
                Err(e) => return Some(Err(e)),
            }
            if group.len() == self.size {
                break;
            }
        }
        (!group.is_empty()).then(|| Batch::stack(&group))
    }
}

/// Drives one network through setup, training and prediction.
pub struct Trainer {
    backend: Arc<dyn Backend>,
    config: TrainingConfig,
    checkpoints: CheckpointManager,
    state: TrainerState,
    callbacks: CallbackSequencer,
    losses: LossMap,
    train_metrics: MetricMap,
    val_metrics: MetricMap,
    val_dataset_metrics: MetricMap,
    phase: TrainerPhase,
    best_score: Option<f64>,
    history: TrainingHistory,
    resumed_from: Option<usize>,
}

impl Trainer {
    /// Build optimizers, place the network, resume from `save_dir` if it holds
    /// a checkpoint, and write the initial checkpoint otherwise.
    pub fn new(
        network: Box<dyn Network>,
        backend: Arc<dyn Backend>,
        config: TrainingConfig,
        save_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if config.save_freq == 0 || config.val_freq == 0 {
            return Err(TrainError::config("save_freq and val_freq must be at least 1"));
        }
        let save_dir = save_dir.into();
        tracing::info!(
            backend = backend.id(),
            save_dir = %save_dir.display(),
            params = network.num_parameters(),
            "Setting up trainer"
        );

        let losses = build_losses(&config.losses)?;
        let train_metrics = build_metrics(&config.train_metrics)?;
        let val_metrics = build_metrics(&config.val_metrics)?;
        let val_dataset_metrics = build_metrics(&config.val_dataset_metrics)?;

        let optimizers = backend.build_optimizers(network.as_ref(), &config.optimizer)?;
        let optimizers = backend.apply_mixed_precision(optimizers, &config.mixed_precision)?;
        let placement = resolve_placement(backend.as_ref(), network, &config.accelerator_ids)?;

        let mut state = TrainerState::new(
            placement.network,
            optimizers,
            placement.input_device,
            placement.output_device,
            placement.use_accelerator,
        );
        state.start_epoch = config.start_epoch.max(1);
        state.extras.insert("fold".into(), Value::from(config.fold));

        let mut callbacks = CallbackSequencer::new();
        if let Some(schedule) = &config.lr_schedule {
            callbacks.register(schedule_from_config(schedule, config.val_score_mode)?);
        }
        if let Some(early) = &config.early_stopping {
            callbacks.register(Box::new(EarlyStopping::from_config(
                early,
                config.val_score_mode,
            )));
        }

        let checkpoints = CheckpointManager::for_backend(save_dir, backend.as_ref())?;
        let mut trainer = Self {
            backend,
            config,
            checkpoints,
            state,
            callbacks,
            losses,
            train_metrics,
            val_metrics,
            val_dataset_metrics,
            phase: TrainerPhase::Uninitialized,
            best_score: None,
            history: TrainingHistory::default(),
            resumed_from: None,
        };
        trainer.setup()?;
        Ok(trainer)
    }

    fn setup(&mut self) -> Result<()> {
        self.phase = TrainerPhase::Setup;

        if let Some((epoch, path)) = self.checkpoints.latest_resumable()? {
            let loaded = self
                .checkpoints
                .load(self.backend.as_ref(), &path)
                .and_then(|bundle| {
                    bundle.require_optimizers(&path, self.state.optimizers.keys())?;
                    Ok(bundle)
                });
            match loaded {
                Ok(bundle) => {
                    self.state.apply_bundle(bundle)?;
                    self.resumed_from = Some(epoch);
                    self.best_score = self.checkpoints.best_entry().and_then(|e| e.score);
                    tracing::info!(
                        epoch,
                        path = %path.display(),
                        start_epoch = self.state.start_epoch,
                        best_score = ?self.best_score,
                        "Resumed from checkpoint"
                    );
                }
                Err(error) if error.is_corrupt_resume_state() => {
                    tracing::warn!(
                        %error,
                        path = %path.display(),
                        "Checkpoint is incomplete; starting fresh"
                    );
                }
                Err(error) => return Err(error),
            }
        } else {
            tracing::debug!(
                dir = %self.checkpoints.dir().display(),
                "No checkpoint to resume from"
            );
        }

        if self.resumed_from.is_none() {
            self.save_checkpoint(CheckpointKind::Initial, 0, None)?;
        }

        tracing::info!(
            input = %self.state.input_device,
            output = %self.state.output_device,
            use_accelerator = self.state.use_accelerator,
            start_epoch = self.state.start_epoch,
            "Trainer ready"
        );
        Ok(())
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn network(&self) -> &dyn Network {
        self.state.network()
    }

    pub fn into_network(self) -> Box<dyn Network> {
        self.state.network
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    /// Epoch of the checkpoint setup resumed from.
    pub fn resumed_from(&self) -> Option<usize> {
        self.resumed_from
    }

    pub fn register_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.register(callback);
    }

    /// Replace the losses built from configuration.
    pub fn set_losses(&mut self, losses: LossMap) {
        self.losses = losses;
    }

    pub fn set_train_metrics(&mut self, metrics: MetricMap) {
        self.train_metrics = metrics;
    }

    pub fn set_val_metrics(&mut self, metrics: MetricMap) {
        self.val_metrics = metrics;
    }

    /// Apply overrides as a callback would.
    pub fn update_state(&mut self, update: StateUpdate) -> Result<()> {
        self.state.apply(update)
    }

    /// Save the current network and optimizers as `epoch` at `path`.
    ///
    /// The backend's canonical extension is appended if missing.
    pub fn save_state(&self, path: &Path, epoch: usize) -> Result<PathBuf> {
        let path = self.checkpoints.canonicalize(path);
        self.backend.save_state(
            &path,
            self.state.network(),
            &self.state.optimizers,
            epoch,
            &self.state.extras,
        )?;
        Ok(path)
    }

    /// Read a bundle without touching the live state.
    pub fn load_state(&self, path: &Path) -> Result<StateBundle> {
        self.checkpoints.load(self.backend.as_ref(), path)
    }

    /// Apply a bundle from [`Self::load_state`].
    pub fn apply_bundle(&mut self, bundle: StateBundle) -> Result<()> {
        self.state.apply_bundle(bundle)
    }

    fn save_checkpoint(
        &self,
        kind: CheckpointKind,
        epoch: usize,
        score: Option<f64>,
    ) -> Result<()> {
        self.checkpoints.save(
            self.backend.as_ref(),
            kind,
            self.state.network(),
            &self.state.optimizers,
            epoch,
            score,
            &self.state.extras,
        )?;
        Ok(())
    }

    /// Run `num_epochs` epochs starting at the current start epoch.
    pub fn train(
        &mut self,
        num_epochs: usize,
        train_source: &mut dyn BatchSource,
        mut val_source: Option<&mut dyn BatchSource>,
    ) -> Result<TrainingSummary> {
        self.phase = TrainerPhase::Training;
        self.state.stop_training = false;
        let first_epoch = self.state.start_epoch;
        let score_key = self.config.val_score_key.clone();
        let mode = self.config.val_score_mode;
        let no_metrics = MetricValues::new();
        let mut last_validation = MetricValues::new();
        let mut warned_missing_score = false;
        let mut last_epoch = None;

        tracing::info!(first_epoch, num_epochs, "Starting training");

        for epoch in first_epoch..first_epoch + num_epochs {
            let started = Instant::now();
            self.state.epoch = epoch;
            self.callbacks.at_epoch_begin(
                &mut self.state,
                &last_validation,
                score_key.as_deref(),
                epoch,
            )?;

            let train_values = self.train_pass(train_source)?;

            let mut validation = None;
            let mut score = None;
            let mut is_best = false;
            if epoch % self.config.val_freq == 0 {
                if let Some(source) = val_source.as_deref_mut() {
                    let values = self.validate(source)?;
                    score = score_key.as_deref().and_then(|k| values.get(k)).copied();
                    if let Some(s) = score.filter(|s| !s.is_finite()) {
                        tracing::warn!(epoch, score = s, "Ignoring non-finite validation score");
                        score = None;
                    }
                    match (score, score_key.as_deref()) {
                        (Some(s), _) => {
                            if self.best_score.is_none_or(|best| mode.is_better(s, best)) {
                                is_best = true;
                                self.best_score = Some(s);
                            }
                        }
                        (None, Some(key))
                            if !warned_missing_score && !values.contains_key(key) =>
                        {
                            tracing::warn!(key, "Validation did not produce the score key");
                            warned_missing_score = true;
                        }
                        _ => {}
                    }
                    last_validation.clone_from(&values);
                    validation = Some(values);
                }
            }

            self.callbacks.at_epoch_end(
                &mut self.state,
                validation.as_ref().unwrap_or(&no_metrics),
                score_key.as_deref(),
                epoch,
                is_best,
            )?;

            if epoch % self.config.save_freq == 0 {
                self.save_checkpoint(CheckpointKind::Periodic, epoch, score)?;
            }
            if is_best {
                tracing::info!(epoch, score = ?score, "New best validation score");
                self.save_checkpoint(CheckpointKind::Best, epoch, score)?;
            }

            let record = EpochRecord {
                epoch,
                train: train_values,
                validation,
                is_best,
                learning_rates: self.state.learning_rates(),
                duration_secs: started.elapsed().as_secs_f64(),
            };
            tracing::info!(
                epoch,
                train = ?record.train,
                validation = ?record.validation,
                is_best,
                duration_secs = record.duration_secs,
                "Epoch finished"
            );
            self.history.record_epoch(record, score);
            last_epoch = Some(epoch);

            if self.state.stop_training {
                tracing::info!(epoch, "Training stopped by callback");
                self.history.stopped_early = true;
                break;
            }
        }

        if let Some(epoch) = last_epoch {
            self.state.start_epoch = epoch + 1;
        }
        self.finish(first_epoch, last_epoch)
    }

    fn finish(&mut self, first_epoch: usize, last_epoch: Option<usize>) -> Result<TrainingSummary> {
        self.phase = TrainerPhase::TrainingEnd;
        let best_checkpoint = self.checkpoints.find_best();
        let mut restored_best = false;
        if let Some(path) = &best_checkpoint {
            let bundle = self.checkpoints.load(self.backend.as_ref(), path)?;
            self.state.network.load_state_dict(&bundle.model)?;
            restored_best = true;
            tracing::info!(
                path = %path.display(),
                epoch = bundle.epoch,
                "Restored best checkpoint"
            );
        }
        Ok(TrainingSummary {
            history: self.history.clone(),
            first_epoch,
            last_epoch,
            best_checkpoint,
            restored_best,
        })
    }

    fn train_pass(&mut self, source: &mut dyn BatchSource) -> Result<MetricValues> {
        self.state.network.set_training(true);
        let mut accumulator = MetricAccumulator::new();
        let mut batches = 0usize;
        for batch in source.batches(None)? {
            let prepared = self.state.network.prepare_batch(
                &batch?,
                self.state.input_device,
                self.state.output_device,
            )?;
            let output = self.state.network.closure(
                &prepared,
                &mut self.state.optimizers,
                &self.losses,
                &self.train_metrics,
            )?;
            let mut values = output.metrics;
            values.extend(output.losses);
            accumulator.add(&values);
            batches += 1;
        }
        if batches == 0 {
            tracing::warn!(epoch = self.state.epoch, "Training source yielded no batches");
        }
        Ok(accumulator.means())
    }

    fn validate(&mut self, source: &mut dyn BatchSource) -> Result<MetricValues> {
        let metrics = self.val_metrics.clone();
        let dataset_metrics = self.val_dataset_metrics.clone();
        Ok(self.predict(source, None, &metrics, &dataset_metrics)?.metrics())
    }

    /// Inference over a whole source: no gradients, no optimizer steps.
    ///
    /// With `artificial_batch_size`, single samples are pulled and stacked
    /// into batches of that size before `prepare_batch`.
    pub fn predict(
        &mut self,
        source: &mut dyn BatchSource,
        artificial_batch_size: Option<usize>,
        metrics: &MetricMap,
        dataset_metrics: &MetricMap,
    ) -> Result<Prediction> {
        self.state.network.set_training(false);
        let result = self.predict_inner(source, artificial_batch_size, metrics, dataset_metrics);
        self.state.network.set_training(true);
        result
    }

    fn predict_inner(
        &mut self,
        source: &mut dyn BatchSource,
        artificial_batch_size: Option<usize>,
        metrics: &MetricMap,
        dataset_metrics: &MetricMap,
    ) -> Result<Prediction> {
        let batches: BatchIter<'_> = match artificial_batch_size {
            Some(0) => return Err(TrainError::config("artificial batch size must be positive")),
            Some(size) => Box::new(ArtificialBatches {
                samples: source.batches(Some(1))?,
                size,
            }),
            None => source.batches(None)?,
        };

        let network = self.state.network.as_ref();
        let mut accumulator = MetricAccumulator::new();
        let mut predictions = Vec::new();
        let mut targets = Vec::new();
        let mut all_labelled = true;

        for batch in batches {
            let prepared = network.prepare_batch(
                &batch?,
                self.state.input_device,
                self.state.output_device,
            )?;
            let output = network.forward(&prepared)?;
            match prepared.get(LABEL_KEY) {
                Some(label) => {
                    if !metrics.is_empty() {
                        accumulator.add(&evaluate(metrics, &output, label)?);
                    }
                    targets.push(label.clone());
                }
                None => all_labelled = false,
            }
            predictions.push(output);
        }

        if predictions.is_empty() {
            tracing::warn!("Prediction source yielded no batches");
            return Ok(Prediction {
                predictions: None,
                targets: None,
                batch_metrics: MetricValues::new(),
                dataset_metrics: MetricValues::new(),
            });
        }

        let predictions = Array::concat_rows(&predictions.iter().collect::<Vec<_>>())?;
        let targets = if all_labelled {
            Some(Array::concat_rows(&targets.iter().collect::<Vec<_>>())?)
        } else {
            None
        };

        let dataset_values = match (&targets, dataset_metrics.is_empty()) {
            (_, true) => MetricValues::new(),
            (Some(t), false) => evaluate(dataset_metrics, &predictions, t)?,
            (None, false) => {
                return Err(TrainError::data("dataset metrics need labels on every batch"));
            }
        };
        if !metrics.is_empty() && !all_labelled {
            return Err(TrainError::data("metrics need labels on every batch"));
        }

        Ok(Prediction {
            predictions: Some(predictions),
            targets,
            batch_metrics: accumulator.means(),
            dataset_metrics: dataset_values,
        })
    }
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("backend", &self.backend.id())
            .field("phase", &self.phase)
            .field("save_dir", &self.checkpoints.dir())
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.names())
            .field("best_score", &self.best_score)
            .finish()
    }
}
