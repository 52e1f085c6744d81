//! Batch sources: datasets, the data manager and its prefetching workers.

use super::array::{Array, Batch};
use crate::error::{Result, TrainError};
use kiln_core::DataConfig;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Iterator over the batches of one pass.
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// A restartable producer of batches.
///
/// Each call to [`BatchSource::batches`] starts a new pass. The trainer only
/// ever blocks on the next item; buffering is the source's business.
pub trait BatchSource {
    /// Start a pass. `batch_size` overrides the configured size; `Some(1)`
    /// yields single samples (used for artificial batch sizes).
    fn batches(&mut self, batch_size: Option<usize>) -> Result<BatchIter<'_>>;

    /// Number of batches a default pass yields, if known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// A fixed list of prepared batches replays identically on every pass.
impl BatchSource for Vec<Batch> {
    fn batches(&mut self, batch_size: Option<usize>) -> Result<BatchIter<'_>> {
        match batch_size {
            None => Ok(Box::new(self.iter().cloned().map(Ok))),
            Some(1) => Ok(Box::new(
                self.iter()
                    .flat_map(|b| b.split(b.num_samples()))
                    .map(Ok),
            )),
            Some(n) => Err(TrainError::data(format!(
                "a fixed batch list cannot be re-batched to size {n}"
            ))),
        }
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// Random-access sample storage.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index` as a batch with a leading dimension of one.
    fn get(&self, index: usize) -> Result<Batch>;
}

/// A dataset held entirely in memory as `data`/`label` arrays.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    data: Array,
    label: Array,
}

impl InMemoryDataset {
    pub fn new(data: Array, label: Array) -> Result<Self> {
        if data.rows() != label.rows() {
            return Err(TrainError::data(format!(
                "{} data rows but {} label rows",
                data.rows(),
                label.rows()
            )));
        }
        Ok(Self { data, label })
    }

    /// Noisy samples of `y = x · w + b` with weights drawn from `seed`.
    pub fn linear_regression(
        samples: usize,
        in_features: usize,
        out_features: usize,
        noise: f64,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f64> = (0..in_features * out_features)
            .map(|_| rng.gen_range(-2.0..2.0))
            .collect();
        let bias: Vec<f64> = (0..out_features).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let mut xs = Vec::with_capacity(samples * in_features);
        let mut ys = Vec::with_capacity(samples * out_features);
        for _ in 0..samples {
            let x: Vec<f64> = (0..in_features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            for (o, b) in bias.iter().enumerate() {
                let w = &weights[o * in_features..(o + 1) * in_features];
                let y: f64 = x.iter().zip(w).map(|(a, b)| a * b).sum::<f64>() + b;
                ys.push(y + noise * rng.gen_range(-1.0..1.0));
            }
            xs.extend(x);
        }
        Self::new(
            Array::new(vec![samples, in_features], xs)?,
            Array::new(vec![samples, out_features], ys)?,
        )
    }

    /// Split into the first `index` samples and the rest.
    pub fn split_at(&self, index: usize) -> Result<(Self, Self)> {
        let n = self.len();
        if index > n {
            return Err(TrainError::data(format!(
                "split index {index} out of range for {n} samples"
            )));
        }
        Ok((
            Self {
                data: self.data.slice_rows(0, index),
                label: self.label.slice_rows(0, index),
            },
            Self {
                data: self.data.slice_rows(index, n),
                label: self.label.slice_rows(index, n),
            },
        ))
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.data.rows()
    }

    fn get(&self, index: usize) -> Result<Batch> {
        if index >= self.len() {
            return Err(TrainError::data(format!(
                "index {index} out of range for {} samples",
                self.len()
            )));
        }
        Ok(Batch::from_parts(
            self.data.slice_rows(index, index + 1),
            self.label.slice_rows(index, index + 1),
        ))
    }
}

/// Groups dataset samples into batches, optionally on background threads.
///
/// With `num_workers > 0` every worker owns a bounded channel of `prefetch`
/// batches and handles every `num_workers`-th batch; the consumer polls the
/// channels round-robin so batch order matches the single-threaded plan.
pub struct DataManager {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    num_workers: usize,
    prefetch: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    passes: u64,
}

impl DataManager {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            num_workers: 0,
            prefetch: 4,
            shuffle: false,
            drop_last: false,
            seed: 0,
            passes: 0,
        }
    }

    pub fn from_config(dataset: Arc<dyn Dataset>, config: &DataConfig, seed: u64) -> Self {
        Self::new(dataset, config.batch_size)
            .with_workers(config.num_workers, config.prefetch)
            .with_shuffle(config.shuffle, seed)
            .with_drop_last(config.drop_last)
    }

    pub fn with_workers(mut self, num_workers: usize, prefetch: usize) -> Self {
        self.num_workers = num_workers;
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool, seed: u64) -> Self {
        self.shuffle = shuffle;
        self.seed = seed;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    fn plan(&mut self, batch_size: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.passes));
            indices.shuffle(&mut rng);
        }
        self.passes += 1;

        indices
            .chunks(batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

fn load_batch(dataset: &dyn Dataset, indices: &[usize]) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i))
        .collect::<Result<Vec<_>>>()?;
    Batch::stack(&samples)
}

impl BatchSource for DataManager {
    fn batches(&mut self, batch_size: Option<usize>) -> Result<BatchIter<'_>> {
        let size = batch_size.unwrap_or(self.batch_size).max(1);
        let plan = self.plan(size);

        if self.num_workers == 0 {
            let dataset = Arc::clone(&self.dataset);
            return Ok(Box::new(
                plan.into_iter()
                    .map(move |indices| load_batch(dataset.as_ref(), &indices)),
            ));
        }

        Ok(Box::new(PrefetchIter::spawn(
            Arc::clone(&self.dataset),
            plan,
            self.num_workers,
            self.prefetch,
        )))
    }

    fn len_hint(&self) -> Option<usize> {
        let n = self.dataset.len();
        Some(if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        })
    }
}

/// Consumer side of the worker threads.
///
/// Uses tokio's blocking channel API, so it must not be driven from inside an
/// async task.
struct PrefetchIter {
    receivers: Vec<mpsc::Receiver<Result<Batch>>>,
    workers: Vec<JoinHandle<()>>,
    next: usize,
    remaining: usize,
}

impl PrefetchIter {
    fn spawn(
        dataset: Arc<dyn Dataset>,
        plan: Vec<Vec<usize>>,
        num_workers: usize,
        prefetch: usize,
    ) -> Self {
        let remaining = plan.len();
        let num_workers = num_workers.min(remaining).max(1);
        let plan = Arc::new(plan);
        let mut receivers = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);

        for worker in 0..num_workers {
            let (tx, rx) = mpsc::channel(prefetch);
            let dataset = Arc::clone(&dataset);
            let plan = Arc::clone(&plan);
            workers.push(std::thread::spawn(move || {
                for indices in plan.iter().skip(worker).step_by(num_workers) {
                    let batch = load_batch(dataset.as_ref(), indices);
                    // Receiver gone: the pass was abandoned.
                    if tx.blocking_send(batch).is_err() {
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }

        tracing::debug!(num_workers, batches = remaining, "Started batch workers");
        Self {
            receivers,
            workers,
            next: 0,
            remaining,
        }
    }
}

impl Iterator for PrefetchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next % self.receivers.len();
        match self.receivers[slot].blocking_recv() {
            Some(batch) => {
                self.next += 1;
                self.remaining -= 1;
                Some(batch)
            }
            None => {
                self.remaining = 0;
                Some(Err(TrainError::data(format!(
                    "batch worker {slot} exited before producing all batches"
                ))))
            }
        }
    }
}

impl Drop for PrefetchIter {
    fn drop(&mut self) {
        self.receivers.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("Batch worker panicked");
            }
        }
    }
}
