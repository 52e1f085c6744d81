//! Metrics, per-epoch accumulation and training history.

use crate::data::Array;
use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Named scalar values: losses, metrics, validation scores.
pub type MetricValues = BTreeMap<String, f64>;

/// A `(prediction, target) -> scalar` callable.
pub trait Metric: Send + Sync {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64>;
}

impl<F> Metric for F
where
    F: Fn(&Array, &Array) -> f64 + Send + Sync,
{
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        Ok(self(prediction, target))
    }
}

/// Named metrics, in a stable order.
pub type MetricMap = BTreeMap<String, Arc<dyn Metric>>;

/// Evaluate every metric on one prediction/target pair.
pub fn evaluate(metrics: &MetricMap, prediction: &Array, target: &Array) -> Result<MetricValues> {
    metrics
        .iter()
        .map(|(name, metric)| Ok((name.clone(), metric.compute(prediction, target)?)))
        .collect()
}

fn paired<'a>(
    prediction: &'a Array,
    target: &'a Array,
) -> Result<impl Iterator<Item = (f64, f64)> + 'a> {
    if prediction.len() != target.len() {
        return Err(TrainError::ShapeMismatch {
            expected: prediction.shape().to_vec(),
            actual: target.shape().to_vec(),
        });
    }
    Ok(prediction.data().iter().copied().zip(target.data().iter().copied()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Metric for MeanSquaredError {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        let n = prediction.len().max(1) as f64;
        Ok(paired(prediction, target)?.map(|(p, t)| (p - t).powi(2)).sum::<f64>() / n)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RootMeanSquaredError;

impl Metric for RootMeanSquaredError {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        Ok(MeanSquaredError.compute(prediction, target)?.sqrt())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        let n = prediction.len().max(1) as f64;
        Ok(paired(prediction, target)?.map(|(p, t)| (p - t).abs()).sum::<f64>() / n)
    }
}

/// Coefficient of determination over all values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RSquared;

impl Metric for RSquared {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        let pairs: Vec<(f64, f64)> = paired(prediction, target)?.collect();
        if pairs.is_empty() {
            return Ok(0.0);
        }
        let mean = pairs.iter().map(|(_, t)| t).sum::<f64>() / pairs.len() as f64;
        let ss_res: f64 = pairs.iter().map(|(p, t)| (t - p).powi(2)).sum();
        let ss_tot: f64 = pairs.iter().map(|(_, t)| (t - mean).powi(2)).sum();
        if ss_tot == 0.0 {
            return Ok(if ss_res == 0.0 { 1.0 } else { 0.0 });
        }
        Ok(1.0 - ss_res / ss_tot)
    }
}

/// Classification accuracy.
///
/// Single-output predictions are thresholded at 0.5; wider predictions use
/// the arg-max, compared against a one-hot or class-index target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accuracy;

fn argmax(row: &[f64]) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i)
}

impl Metric for Accuracy {
    fn compute(&self, prediction: &Array, target: &Array) -> Result<f64> {
        let rows = prediction.rows();
        if rows == 0 {
            return Ok(0.0);
        }
        if target.rows() != rows {
            return Err(TrainError::ShapeMismatch {
                expected: prediction.shape().to_vec(),
                actual: target.shape().to_vec(),
            });
        }
        let correct = (0..rows)
            .filter(|&i| {
                let p = prediction.row(i);
                let t = target.row(i);
                match (p.len(), t.len()) {
                    (1, _) => (p[0] >= 0.5) == (t[0] >= 0.5),
                    (_, 1) => argmax(p) == t[0].round() as usize,
                    _ => argmax(p) == argmax(t),
                }
            })
            .count();
        Ok(correct as f64 / rows as f64)
    }
}

/// Look up a built-in metric by its configuration name.
pub fn metric_by_name(name: &str) -> Result<Arc<dyn Metric>> {
    match name {
        "mse" => Ok(Arc::new(MeanSquaredError)),
        "rmse" => Ok(Arc::new(RootMeanSquaredError)),
        "mae" => Ok(Arc::new(MeanAbsoluteError)),
        "r2" => Ok(Arc::new(RSquared)),
        "accuracy" => Ok(Arc::new(Accuracy)),
        other => Err(TrainError::UnknownComponent {
            kind: "metric",
            name: other.to_string(),
        }),
    }
}

pub fn build_metrics(names: &[String]) -> Result<MetricMap> {
    names
        .iter()
        .map(|name| Ok((name.clone(), metric_by_name(name)?)))
        .collect()
}

/// Arithmetic mean per key over the batches of one pass.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, values: &MetricValues) {
        for (key, value) in values {
            *self.sums.entry(key.clone()).or_default() += value;
            *self.counts.entry(key.clone()).or_default() += 1;
        }
    }

    pub fn means(&self) -> MetricValues {
        self.sums
            .iter()
            .map(|(key, sum)| (key.clone(), sum / self.counts[key] as f64))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// What happened in one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Mean training losses and metrics.
    pub train: MetricValues,
    /// Validation metrics, present on validation epochs.
    pub validation: Option<MetricValues>,
    pub is_best: bool,
    pub learning_rates: BTreeMap<String, f64>,
    pub duration_secs: f64,
}

/// Training history for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_score: Option<f64>,
    pub stopped_early: bool,
    pub total_training_time_secs: f64,
}

impl TrainingHistory {
    pub fn record_epoch(&mut self, record: EpochRecord, score: Option<f64>) {
        self.total_training_time_secs += record.duration_secs;
        if record.is_best {
            self.best_epoch = Some(record.epoch);
            self.best_score = score;
        }
        self.epochs.push(record);
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    /// History of one training value across epochs.
    pub fn train_series(&self, key: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|e| e.train.get(key).copied())
            .collect()
    }
}
