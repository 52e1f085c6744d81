//! End-to-end tests for the trainer against the reference backend.
//!
//! Every test trains in its own temporary save location.

use kiln_core::{EarlyStoppingConfig, OptimizerConfig, ScoreMode, TrainingConfig};
use kiln_train::backend::Backend;
use kiln_train::callbacks::{Callback, EpochContext, StateUpdate};
use kiln_train::checkpoint::CheckpointKind;
use kiln_train::{
    Array, Batch, DataManager, InMemoryDataset, MetricMap, ReferenceBackend, Trainer,
    TrainerPhase,
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn regression_batches() -> Vec<Batch> {
    let xs: Vec<f64> = (0..8).map(|i| i as f64 / 4.0).collect();
    let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
    xs.chunks(4)
        .zip(ys.chunks(4))
        .map(|(x, y)| {
            Batch::from_parts(
                Array::new(vec![x.len(), 1], x.to_vec()).unwrap(),
                Array::new(vec![y.len(), 1], y.to_vec()).unwrap(),
            )
        })
        .collect()
}

fn config() -> TrainingConfig {
    TrainingConfig {
        optimizer: OptimizerConfig {
            name: "sgd".into(),
            params: [("lr".to_string(), serde_json::json!(0.05))].into(),
        },
        val_metrics: vec!["mse".into()],
        val_score_key: Some("mse".into()),
        val_score_mode: ScoreMode::Lowest,
        ..TrainingConfig::default()
    }
}

fn trainer(dir: &Path, config: TrainingConfig) -> Trainer {
    Trainer::new(
        ReferenceBackend::linear(1, 1, 7),
        Arc::new(ReferenceBackend::new()),
        config,
        dir,
    )
    .unwrap()
}

fn file_names(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

/// A metric that replays a fixed sequence of scores, one per call.
fn scripted_metric(scores: &[f64]) -> MetricMap {
    let queue = Arc::new(Mutex::new(scores.iter().copied().collect::<VecDeque<_>>()));
    let mut metrics = MetricMap::new();
    metrics.insert(
        "scripted".to_string(),
        Arc::new(move |_p: &Array, _t: &Array| queue.lock().unwrap().pop_front().unwrap_or(0.0)),
    );
    metrics
}

#[test]
fn periodic_cadence_writes_expected_epochs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.save_freq = 3;
    let mut t = trainer(dir.path(), cfg);

    let summary = t.train(10, &mut regression_batches(), None).unwrap();

    assert_eq!(summary.first_epoch, 1);
    assert_eq!(summary.last_epoch, Some(10));
    assert_eq!(
        file_names(dir.path()),
        BTreeSet::from([
            "checkpoint_epoch_0.ckpt".to_string(),
            "checkpoint_epoch_3.ckpt".to_string(),
            "checkpoint_epoch_6.ckpt".to_string(),
            "checkpoint_epoch_9.ckpt".to_string(),
            "checkpoints.json".to_string(),
        ])
    );
    let kinds: Vec<(CheckpointKind, usize)> = t
        .checkpoints()
        .manifest()
        .unwrap()
        .iter()
        .map(|e| (e.kind, e.epoch))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (CheckpointKind::Initial, 0),
            (CheckpointKind::Periodic, 3),
            (CheckpointKind::Periodic, 6),
            (CheckpointKind::Periodic, 9),
        ]
    );
    assert_eq!(t.phase(), TrainerPhase::TrainingEnd);
    assert!(!summary.restored_best);
}

#[test]
fn resume_selects_highest_epoch_and_ignores_best() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ReferenceBackend::new();
    let network = ReferenceBackend::linear(1, 1, 99);
    let optimizers = backend
        .build_optimizers(network.as_ref(), &config().optimizer)
        .unwrap();
    let extra = serde_json::Map::new();
    for epoch in [1, 3, 7] {
        let path = dir.path().join(format!("checkpoint_epoch_{epoch}.ckpt"));
        backend
            .save_state(&path, network.as_ref(), &optimizers, epoch, &extra)
            .unwrap();
    }
    backend
        .save_state(
            &dir.path().join("checkpoint_best.ckpt"),
            network.as_ref(),
            &optimizers,
            9,
            &extra,
        )
        .unwrap();

    let t = trainer(dir.path(), config());

    assert_eq!(t.resumed_from(), Some(7));
    assert_eq!(t.state().start_epoch(), 7);
    assert_eq!(
        t.network().state_dict().unwrap(),
        network.state_dict().unwrap()
    );
    assert!(!dir.path().join("checkpoint_epoch_0.ckpt").exists());
}

#[test]
fn resume_falls_back_to_secondary_extension() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ReferenceBackend::new();
    let network = ReferenceBackend::linear(1, 1, 5);
    backend
        .save_state(
            &dir.path().join("checkpoint_epoch_4.json"),
            network.as_ref(),
            &Default::default(),
            4,
            &serde_json::Map::new(),
        )
        .unwrap();

    let t = trainer(dir.path(), config());
    assert_eq!(t.resumed_from(), Some(4));
    assert_eq!(t.state().start_epoch(), 4);
}

#[test]
fn resume_continues_epoch_counter_and_best_score() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = trainer(dir.path(), config());
    first.train(4, &mut regression_batches(), Some(&mut regression_batches())).unwrap();
    let best = first.best_score();
    assert!(best.is_some());
    drop(first);

    let mut second = trainer(dir.path(), config());
    assert_eq!(second.resumed_from(), Some(4));
    assert_eq!(second.best_score(), best);
    let summary = second.train(2, &mut regression_batches(), None).unwrap();
    assert_eq!(summary.first_epoch, 4);
    assert_eq!(summary.last_epoch, Some(5));
}

#[test]
fn corrupt_resume_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("checkpoint_epoch_3.ckpt"),
        r#"{"epoch": 3, "optimizer": {}}"#,
    )
    .unwrap();

    let t = trainer(dir.path(), config());

    assert_eq!(t.resumed_from(), None);
    assert_eq!(t.state().start_epoch(), 1);
    assert!(dir.path().join("checkpoint_epoch_0.ckpt").exists());
}

#[test]
fn resume_without_optimizer_state_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let stored = ReferenceBackend::linear(1, 1, 3).state_dict().unwrap();
    let bundle = serde_json::json!({
        "model": stored,
        "optimizer": {"other": {}},
        "epoch": 5
    });
    std::fs::write(
        dir.path().join("checkpoint_epoch_5.ckpt"),
        serde_json::to_string(&bundle).unwrap(),
    )
    .unwrap();

    let t = trainer(dir.path(), config());

    assert_eq!(t.resumed_from(), None);
    assert_eq!(t.state().start_epoch(), 1);
    assert_ne!(t.network().state_dict().unwrap(), stored);
    assert!(dir.path().join("checkpoint_epoch_0.ckpt").exists());
}

#[test]
fn malformed_checkpoint_content_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("checkpoint_epoch_2.ckpt"), "[1, 2, 3]").unwrap();

    let result = Trainer::new(
        ReferenceBackend::linear(1, 1, 7),
        Arc::new(ReferenceBackend::new()),
        config(),
        dir.path(),
    );
    assert!(result.is_err());
}

#[test]
fn best_checkpoint_only_on_strict_improvement() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.val_score_key = Some("scripted".into());
    cfg.val_score_mode = ScoreMode::Highest;
    cfg.save_freq = 100;
    let mut t = trainer(dir.path(), cfg);
    t.set_val_metrics(scripted_metric(&[0.5, 0.7, 0.7, 0.6, 0.9]));

    // One validation batch per epoch, so one scripted score per epoch.
    let mut val = vec![regression_batches().remove(0)];
    let summary = t.train(5, &mut regression_batches(), Some(&mut val)).unwrap();

    let flags: Vec<bool> = summary.history.epochs.iter().map(|e| e.is_best).collect();
    assert_eq!(flags, vec![true, true, false, false, true]);
    assert_eq!(summary.history.best_epoch, Some(5));
    assert_eq!(t.best_score(), Some(0.9));

    let best = t.checkpoints().best_entry().unwrap();
    assert_eq!((best.epoch, best.score), (5, Some(0.9)));
    let bundle = t.load_state(&dir.path().join("checkpoint_best")).unwrap();
    assert_eq!(bundle.epoch, 5);
    assert!(summary.restored_best);
    assert_eq!(t.network().state_dict().unwrap(), bundle.model);
}

#[test]
fn non_finite_scores_never_become_best() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.val_score_key = Some("scripted".into());
    cfg.val_score_mode = ScoreMode::Highest;
    cfg.save_freq = 100;
    let mut t = trainer(dir.path(), cfg);
    t.set_val_metrics(scripted_metric(&[f64::NAN, 0.5, f64::INFINITY, 0.9]));

    let mut val = vec![regression_batches().remove(0)];
    let summary = t.train(4, &mut regression_batches(), Some(&mut val)).unwrap();

    let flags: Vec<bool> = summary.history.epochs.iter().map(|e| e.is_best).collect();
    assert_eq!(flags, vec![false, true, false, true]);
    assert_eq!(t.best_score(), Some(0.9));
    assert_eq!(t.checkpoints().best_entry().unwrap().epoch, 4);
}

#[test]
fn validation_respects_val_freq() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.val_freq = 2;
    let mut t = trainer(dir.path(), cfg);
    let summary = t
        .train(4, &mut regression_batches(), Some(&mut regression_batches()))
        .unwrap();
    let validated: Vec<usize> = summary
        .history
        .epochs
        .iter()
        .filter(|e| e.validation.is_some())
        .map(|e| e.epoch)
        .collect();
    assert_eq!(validated, vec![2, 4]);
}

#[test]
fn save_load_roundtrip_reproduces_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(dir.path(), config());
    t.train(3, &mut regression_batches(), None).unwrap();

    let path = t.save_state(&dir.path().join("snapshot"), 3).unwrap();
    assert_eq!(path, dir.path().join("snapshot.ckpt"));
    let bundle = t.load_state(&path).unwrap();
    assert_eq!(bundle.epoch, 3);

    let sample = regression_batches().remove(1);
    let expected = t.network().forward(&sample).unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let mut fresh = trainer(other_dir.path(), config());
    fresh.apply_bundle(bundle).unwrap();
    assert_eq!(fresh.network().forward(&sample).unwrap(), expected);
    assert_eq!(fresh.state().start_epoch(), 3);
}

#[test]
fn training_reduces_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(dir.path(), config());
    let summary = t.train(40, &mut regression_batches(), None).unwrap();
    let losses = summary.history.train_series("mse");
    assert_eq!(losses.len(), 40);
    assert!(losses[39] < losses[0] / 4.0);
}

struct SetKeys(&'static str, i64);

impl Callback for SetKeys {
    fn name(&self) -> &str {
        self.0
    }

    fn at_epoch_end(&mut self, _ctx: &EpochContext<'_>) -> StateUpdate {
        StateUpdate::new()
            .with(self.0, true)
            .with("shared", self.1)
    }
}

#[test]
fn callback_overrides_chain_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(dir.path(), config());
    t.register_callback(Box::new(SetKeys("first", 1)));
    t.register_callback(Box::new(SetKeys("second", 2)));
    t.train(1, &mut regression_batches(), None).unwrap();

    let extras = t.state().extras();
    assert_eq!(extras["first"], Value::Bool(true));
    assert_eq!(extras["second"], Value::Bool(true));
    assert_eq!(extras["shared"], Value::from(2));
}

/// Records the score each epoch-begin hook sees.
struct BeginScores(Arc<Mutex<Vec<Option<f64>>>>);

impl Callback for BeginScores {
    fn name(&self) -> &str {
        "begin_scores"
    }

    fn at_epoch_begin(&mut self, ctx: &EpochContext<'_>) -> StateUpdate {
        self.0.lock().unwrap().push(ctx.score());
        StateUpdate::new()
    }
}

#[test]
fn epoch_begin_sees_previous_validation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.val_score_key = Some("scripted".into());
    cfg.val_freq = 2;
    let mut t = trainer(dir.path(), cfg);
    t.set_val_metrics(scripted_metric(&[0.25, 0.75]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    t.register_callback(Box::new(BeginScores(Arc::clone(&seen))));

    let mut val = vec![regression_batches().remove(0)];
    t.train(5, &mut regression_batches(), Some(&mut val)).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![None, None, Some(0.25), Some(0.25), Some(0.75)]
    );
}

#[test]
fn early_stopping_ends_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.val_score_key = Some("scripted".into());
    cfg.early_stopping = Some(EarlyStoppingConfig {
        patience: 2,
        min_delta: 0.0,
    });
    let mut t = trainer(dir.path(), cfg);
    t.set_val_metrics(scripted_metric(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]));

    let mut val = vec![regression_batches().remove(0)];
    let summary = t.train(6, &mut regression_batches(), Some(&mut val)).unwrap();

    assert!(summary.history.stopped_early);
    assert_eq!(summary.last_epoch, Some(3));
}

#[test]
fn lr_schedule_from_config_changes_learning_rate() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.lr_schedule = Some(kiln_core::ScheduleConfig {
        name: "step".into(),
        params: [
            ("step_size".to_string(), serde_json::json!(2)),
            ("gamma".to_string(), serde_json::json!(0.5)),
        ]
        .into(),
    });
    let mut t = trainer(dir.path(), cfg);
    let summary = t.train(4, &mut regression_batches(), None).unwrap();
    let lrs: Vec<f64> = summary
        .history
        .epochs
        .iter()
        .map(|e| e.learning_rates["default"])
        .collect();
    assert_eq!(lrs, vec![0.05, 0.025, 0.025, 0.0125]);
}

#[test]
fn predict_with_artificial_batch_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut t = trainer(dir.path(), config());
    let dataset = InMemoryDataset::linear_regression(10, 1, 1, 0.0, 3).unwrap();
    let mut manager = DataManager::new(Arc::new(dataset), 3);

    let metrics = kiln_train::metrics::build_metrics(&["mse".into()]).unwrap();
    let dataset_metrics = kiln_train::metrics::build_metrics(&["r2".into()]).unwrap();
    let plain = t
        .predict(&mut manager, None, &metrics, &dataset_metrics)
        .unwrap();
    let grouped = t
        .predict(&mut manager, Some(4), &metrics, &dataset_metrics)
        .unwrap();

    assert_eq!(plain.predictions.as_ref().unwrap().shape(), &[10, 1]);
    assert_eq!(grouped.predictions.as_ref().unwrap().shape(), &[10, 1]);
    assert_eq!(plain.predictions, grouped.predictions);
    assert!(grouped.batch_metrics.contains_key("mse"));
    assert!(grouped.metrics().contains_key("r2"));
    assert_eq!(t.phase(), TrainerPhase::Setup);
}

#[test]
fn trains_from_threaded_data_manager() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = Arc::new(InMemoryDataset::linear_regression(64, 1, 1, 0.01, 11).unwrap());
    let mut train = DataManager::new(dataset.clone(), 8)
        .with_workers(2, 2)
        .with_shuffle(true, 1);
    let mut val = DataManager::new(dataset, 16);

    let mut t = trainer(dir.path(), config());
    let summary = t.train(5, &mut train, Some(&mut val)).unwrap();
    assert_eq!(summary.history.epochs_completed(), 5);
    assert!(summary.history.best_epoch.is_some());
}

#[test]
fn mixed_precision_training_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config();
    cfg.mixed_precision.enabled = true;
    cfg.mixed_precision.loss_scale = 1024.0;
    let mut t = trainer(dir.path(), cfg);
    let summary = t.train(20, &mut regression_batches(), None).unwrap();
    let losses = summary.history.train_series("mse");
    assert!(losses.last().unwrap() < &losses[0]);
}
