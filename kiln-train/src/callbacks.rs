//! Epoch callbacks and the sequencer that runs them.
//!
//! A callback never mutates the trainer directly. It returns a [`StateUpdate`]
//! that the sequencer applies before the next callback runs, so callbacks
//! registered later see what earlier ones changed.

use crate::error::{Result, TrainError};
use crate::metrics::MetricValues;
use crate::trainer::TrainerState;
use kiln_core::{EarlyStoppingConfig, ScheduleConfig, ScoreMode};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Override every optimizer's learning rate.
pub const LEARNING_RATE: &str = "learning_rate";
/// Prefix for a single optimizer's learning rate: `learning_rate:<name>`.
pub const LEARNING_RATE_PREFIX: &str = "learning_rate:";
pub const STOP_TRAINING: &str = "stop_training";
pub const START_EPOCH: &str = "start_epoch";

/// State-field overrides returned by a callback. Empty means no effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    entries: Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn learning_rate(self, lr: f64) -> Self {
        self.with(LEARNING_RATE, lr)
    }

    pub fn optimizer_learning_rate(self, optimizer: &str, lr: f64) -> Self {
        self.with(format!("{LEARNING_RATE_PREFIX}{optimizer}"), lr)
    }

    pub fn stop_training(self) -> Self {
        self.with(STOP_TRAINING, true)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}

impl IntoIterator for StateUpdate {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl From<Map<String, Value>> for StateUpdate {
    fn from(entries: Map<String, Value>) -> Self {
        Self { entries }
    }
}

/// What a callback sees at an epoch boundary.
#[derive(Debug, Clone, Copy)]
pub struct EpochContext<'a> {
    pub state: &'a TrainerState,
    /// At epoch end, this epoch's validation metrics. At epoch begin, the most
    /// recent ones from this training run. Empty when there are none.
    pub val_metrics: &'a MetricValues,
    pub val_score_key: Option<&'a str>,
    pub epoch: usize,
    /// Only meaningful at epoch end.
    pub is_best: bool,
}

impl EpochContext<'_> {
    /// The monitored validation score, if `val_metrics` carries it.
    pub fn score(&self) -> Option<f64> {
        self.val_score_key
            .and_then(|key| self.val_metrics.get(key))
            .copied()
    }
}

pub trait Callback: Send {
    fn name(&self) -> &str;

    fn at_epoch_begin(&mut self, _ctx: &EpochContext<'_>) -> StateUpdate {
        StateUpdate::new()
    }

    fn at_epoch_end(&mut self, _ctx: &EpochContext<'_>) -> StateUpdate {
        StateUpdate::new()
    }
}

/// Runs callbacks in registration order, merging each update immediately.
#[derive(Default)]
pub struct CallbackSequencer {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: Box<dyn Callback>) {
        tracing::debug!(callback = callback.name(), "Registered callback");
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.callbacks.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn at_epoch_begin(
        &mut self,
        state: &mut TrainerState,
        val_metrics: &MetricValues,
        val_score_key: Option<&str>,
        epoch: usize,
    ) -> Result<()> {
        self.run(state, val_metrics, val_score_key, epoch, false, |cb, ctx| {
            cb.at_epoch_begin(ctx)
        })
    }

    pub fn at_epoch_end(
        &mut self,
        state: &mut TrainerState,
        val_metrics: &MetricValues,
        val_score_key: Option<&str>,
        epoch: usize,
        is_best: bool,
    ) -> Result<()> {
        self.run(state, val_metrics, val_score_key, epoch, is_best, |cb, ctx| {
            cb.at_epoch_end(ctx)
        })
    }

    fn run(
        &mut self,
        state: &mut TrainerState,
        val_metrics: &MetricValues,
        val_score_key: Option<&str>,
        epoch: usize,
        is_best: bool,
        mut hook: impl FnMut(&mut dyn Callback, &EpochContext<'_>) -> StateUpdate,
    ) -> Result<()> {
        for callback in &mut self.callbacks {
            let update = {
                let ctx = EpochContext {
                    state: &*state,
                    val_metrics,
                    val_score_key,
                    epoch,
                    is_best,
                };
                hook(callback.as_mut(), &ctx)
            };
            if update.is_empty() {
                continue;
            }
            tracing::debug!(
                callback = callback.name(),
                epoch,
                keys = ?update.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
                "Applying callback overrides"
            );
            state.apply(update)?;
        }
        Ok(())
    }
}

fn param_f64(params: &BTreeMap<String, Value>, key: &str, default: f64) -> Result<f64> {
    params.get(key).map_or(Ok(default), |v| {
        v.as_f64().ok_or_else(|| {
            TrainError::config(format!("schedule parameter '{key}' must be a number"))
        })
    })
}

fn param_usize(params: &BTreeMap<String, Value>, key: &str, default: usize) -> Result<usize> {
    params.get(key).map_or(Ok(default), |v| {
        v.as_u64().map(|n| n as usize).ok_or_else(|| {
            TrainError::config(format!("schedule parameter '{key}' must be a non-negative integer"))
        })
    })
}

fn param_mode(params: &BTreeMap<String, Value>, default: ScoreMode) -> Result<ScoreMode> {
    match params.get("mode").and_then(Value::as_str) {
        None => Ok(default),
        Some("max" | "highest") => Ok(ScoreMode::Highest),
        Some("min" | "lowest") => Ok(ScoreMode::Lowest),
        Some(other) => Err(TrainError::config(format!("unknown schedule mode '{other}'"))),
    }
}

/// Multiply every optimizer's learning rate by `factor`, clamped at `floor`.
fn scaled_learning_rates(state: &TrainerState, factor: f64, floor: f64) -> StateUpdate {
    state
        .learning_rates()
        .into_iter()
        .filter_map(|(name, lr)| {
            let next = (lr * factor).max(floor);
            ((lr - next).abs() > f64::EPSILON * lr.abs().max(1.0)).then_some((name, next))
        })
        .fold(StateUpdate::new(), |update, (name, lr)| {
            update.optimizer_learning_rate(&name, lr)
        })
}

/// Lower learning rates when the monitored score stops improving.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    pub mode: ScoreMode,
    pub factor: f64,
    pub patience: usize,
    /// Absolute margin a score must beat the best by to count as improvement.
    pub threshold: f64,
    pub cooldown: usize,
    pub min_lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
    cooldown_left: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(mode: ScoreMode, factor: f64, patience: usize) -> Self {
        Self {
            mode,
            factor,
            patience,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
            best: None,
            bad_epochs: 0,
            cooldown_left: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn from_params(params: &BTreeMap<String, Value>, default_mode: ScoreMode) -> Result<Self> {
        let factor = param_f64(params, "factor", 0.1)?;
        if !(0.0..1.0).contains(&factor) {
            return Err(TrainError::config("plateau factor must be in [0, 1)"));
        }
        Ok(Self::new(
            param_mode(params, default_mode)?,
            factor,
            param_usize(params, "patience", 10)?,
        )
        .with_threshold(param_f64(params, "threshold", 1e-4)?)
        .with_cooldown(param_usize(params, "cooldown", 0)?)
        .with_min_lr(param_f64(params, "min_lr", 0.0)?))
    }

    fn improved(&self, score: f64) -> bool {
        match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), ScoreMode::Highest) => score > best + self.threshold,
            (Some(best), ScoreMode::Lowest) => score < best - self.threshold,
        }
    }
}

impl Callback for ReduceLrOnPlateau {
    fn name(&self) -> &str {
        "reduce_lr_on_plateau"
    }

    fn at_epoch_end(&mut self, ctx: &EpochContext<'_>) -> StateUpdate {
        let Some(score) = ctx.score() else {
            return StateUpdate::new();
        };

        if self.improved(score) {
            self.best = Some(score);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs <= self.patience {
            return StateUpdate::new();
        }

        self.bad_epochs = 0;
        self.cooldown_left = self.cooldown;
        let update = scaled_learning_rates(ctx.state, self.factor, self.min_lr);
        if !update.is_empty() {
            tracing::info!(
                epoch = ctx.epoch,
                score,
                factor = self.factor,
                "Reducing learning rate on plateau"
            );
        }
        update
    }
}

/// Decay learning rates by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f64,
}

impl StepLr {
    pub fn new(step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
        }
    }

    pub fn from_params(params: &BTreeMap<String, Value>) -> Result<Self> {
        let step_size = param_usize(params, "step_size", 10)?;
        if step_size == 0 {
            return Err(TrainError::config("step_size must be at least 1"));
        }
        Ok(Self::new(step_size, param_f64(params, "gamma", 0.1)?))
    }
}

impl Callback for StepLr {
    fn name(&self) -> &str {
        "step_lr"
    }

    fn at_epoch_end(&mut self, ctx: &EpochContext<'_>) -> StateUpdate {
        if ctx.epoch == 0 || ctx.epoch % self.step_size != 0 {
            return StateUpdate::new();
        }
        scaled_learning_rates(ctx.state, self.gamma, 0.0)
    }
}

/// Request a stop once the monitored score stalls for `patience` validations.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub mode: ScoreMode,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(mode: ScoreMode, patience: usize, min_delta: f64) -> Self {
        Self {
            mode,
            patience,
            min_delta,
            counter: 0,
            best: None,
        }
    }

    pub fn from_config(config: &EarlyStoppingConfig, mode: ScoreMode) -> Self {
        Self::new(mode, config.patience, config.min_delta)
    }

    /// Feed one score. Returns true when training should stop.
    pub fn observe(&mut self, score: f64) -> bool {
        match self.best {
            None => {
                self.best = Some(score);
                false
            }
            Some(best) => {
                let improved = match self.mode {
                    ScoreMode::Highest => score > best + self.min_delta,
                    ScoreMode::Lowest => score < best - self.min_delta,
                };
                if improved {
                    self.best = Some(score);
                    self.counter = 0;
                    false
                } else {
                    self.counter += 1;
                    self.counter >= self.patience
                }
            }
        }
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn at_epoch_end(&mut self, ctx: &EpochContext<'_>) -> StateUpdate {
        match ctx.score() {
            Some(score) if self.observe(score) => {
                tracing::info!(
                    epoch = ctx.epoch,
                    patience = self.patience,
                    best = ?self.best,
                    "Early stopping: no improvement"
                );
                StateUpdate::new().stop_training()
            }
            _ => StateUpdate::new(),
        }
    }
}

/// Build the learning-rate schedule callback named in configuration.
pub fn schedule_from_config(config: &ScheduleConfig, mode: ScoreMode) -> Result<Box<dyn Callback>> {
    match config.name.as_str() {
        "reduce_on_plateau" | "reduce_lr_on_plateau" | "plateau" => {
            Ok(Box::new(ReduceLrOnPlateau::from_params(&config.params, mode)?))
        }
        "step" | "step_lr" => Ok(Box::new(StepLr::from_params(&config.params)?)),
        other => Err(TrainError::UnknownComponent {
            kind: "lr schedule",
            name: other.to_string(),
        }),
    }
}
