//! Configuration system for Kiln.
//!
//! Uses `figment` for layered configuration: defaults -> config files -> environment -> overrides.
//! Configuration is loaded from `~/.config/kiln/config.toml` and/or `.kiln/config.toml`
//! in the workspace directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for a Kiln training job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which direction of the validation score counts as an improvement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMode {
    #[default]
    Highest,
    Lowest,
}

impl ScoreMode {
    /// Strict improvement: ties never count.
    pub fn is_better(self, candidate: f64, best: f64) -> bool {
        match self {
            ScoreMode::Highest => candidate > best,
            ScoreMode::Lowest => candidate < best,
        }
    }

    /// The score every real value improves on.
    pub fn worst(self) -> f64 {
        match self {
            ScoreMode::Highest => f64::NEG_INFINITY,
            ScoreMode::Lowest => f64::INFINITY,
        }
    }
}

/// Trainer parameters. Consumed once when a trainer is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Registry id of the backend to train with.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Loss names. The legacy `criterions` key is migrated into this field at load time.
    #[serde(default = "default_losses")]
    pub losses: Vec<String>,
    /// Metrics evaluated per training batch.
    #[serde(default)]
    pub train_metrics: Vec<String>,
    /// Metrics evaluated per validation batch and averaged.
    #[serde(default = "default_val_metrics")]
    pub val_metrics: Vec<String>,
    /// Metrics evaluated once over the concatenated validation predictions.
    #[serde(default)]
    pub val_dataset_metrics: Vec<String>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Optional learning-rate schedule, realized as an epoch callback.
    #[serde(default)]
    pub lr_schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
    /// Accelerator ids to train on. Empty means CPU.
    #[serde(default)]
    pub accelerator_ids: Vec<usize>,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_one")]
    pub start_epoch: usize,
    /// Write a periodic checkpoint every `save_freq` epochs.
    #[serde(default = "default_one")]
    pub save_freq: usize,
    /// Validate every `val_freq` epochs.
    #[serde(default = "default_one")]
    pub val_freq: usize,
    #[serde(default = "default_val_score_key")]
    pub val_score_key: Option<String>,
    #[serde(default)]
    pub val_score_mode: ScoreMode,
    /// Cross-validation fold, stored alongside every checkpoint.
    #[serde(default)]
    pub fold: usize,
    #[serde(default)]
    pub mixed_precision: MixedPrecisionConfig,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            losses: default_losses(),
            train_metrics: Vec::new(),
            val_metrics: default_val_metrics(),
            val_dataset_metrics: Vec::new(),
            optimizer: OptimizerConfig::default(),
            lr_schedule: None,
            early_stopping: None,
            accelerator_ids: Vec::new(),
            num_epochs: default_num_epochs(),
            start_epoch: 1,
            save_freq: 1,
            val_freq: 1,
            val_score_key: default_val_score_key(),
            val_score_mode: ScoreMode::default(),
            fold: 0,
            mixed_precision: MixedPrecisionConfig::default(),
            seed: default_seed(),
        }
    }
}

fn default_backend() -> String {
    "reference".to_string()
}

fn default_losses() -> Vec<String> {
    vec!["mse".to_string()]
}

fn default_val_metrics() -> Vec<String> {
    vec!["r2".to_string()]
}

fn default_val_score_key() -> Option<String> {
    Some("r2".to_string())
}

fn default_num_epochs() -> usize {
    10
}

fn default_one() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

/// Optimizer class and constructor parameters, interpreted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer")]
    pub name: String,
    #[serde(default = "default_optimizer_params")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: default_optimizer(),
            params: default_optimizer_params(),
        }
    }
}

fn default_optimizer() -> String {
    "adam".to_string()
}

fn default_optimizer_params() -> BTreeMap<String, serde_json::Value> {
    BTreeMap::from([("lr".to_string(), serde_json::json!(1e-3))])
}

/// Learning-rate schedule class and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// `reduce_on_plateau` or `step`.
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_delta: 0.0,
        }
    }
}

fn default_patience() -> usize {
    5
}

/// Mixed-precision settings handed to the backend's optional wrapping step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Initial loss scale.
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f64,
    /// Halve the scale on overflow and grow it again after a run of clean steps.
    #[serde(default = "default_true")]
    pub dynamic: bool,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            loss_scale: default_loss_scale(),
            dynamic: true,
        }
    }
}

fn default_loss_scale() -> f64 {
    65536.0
}

fn default_true() -> bool {
    true
}

/// Batch-source settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Producer threads. Zero loads batches on the calling thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Bounded buffer size per producer thread.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub drop_last: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            num_workers: 0,
            prefetch: default_prefetch(),
            shuffle: true,
            drop_last: false,
        }
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_prefetch() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save location for checkpoints and the manifest.
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
        }
    }
}

fn default_save_dir() -> PathBuf {
    PathBuf::from(".kiln/checkpoints")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write JSON log files next to the stderr output.
    #[serde(default = "default_true")]
    pub json_file: bool,
    /// Directory for JSON log files. Defaults to the user data directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_file: true,
            log_dir: None,
        }
    }
}

/// Non-fatal findings produced while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Only the deprecated `criterions` key was supplied; its value was moved to `losses`.
    DeprecatedCriterions,
    /// Both `criterions` and `losses` were supplied; `losses` wins.
    CriterionsConflict,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedCriterions => f.write_str(
                "'training.criterions' is deprecated and will be removed; use 'training.losses'",
            ),
            ConfigWarning::CriterionsConflict => f.write_str(
                "both 'training.criterions' and 'training.losses' are set; using 'training.losses'",
            ),
        }
    }
}

/// Collapse the legacy `criterions` key into `losses`.
///
/// `losses` always takes precedence; returns the losses to use (if either was
/// supplied) and the warning to report.
pub fn resolve_losses(
    losses: Option<Vec<String>>,
    criterions: Option<Vec<String>>,
) -> (Option<Vec<String>>, Option<ConfigWarning>) {
    match (losses, criterions) {
        (Some(losses), Some(_)) => (Some(losses), Some(ConfigWarning::CriterionsConflict)),
        (None, Some(criterions)) => (Some(criterions), Some(ConfigWarning::DeprecatedCriterions)),
        (losses, None) => (losses, None),
    }
}

/// Configuration together with the warnings raised while loading it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: KilnConfig,
    pub warnings: Vec<ConfigWarning>,
}

impl KilnConfig {
    /// Reject values the trainer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.training;
        if t.save_freq == 0 {
            return Err(ConfigError::invalid("training.save_freq", "must be at least 1"));
        }
        if t.val_freq == 0 {
            return Err(ConfigError::invalid("training.val_freq", "must be at least 1"));
        }
        if t.start_epoch == 0 {
            return Err(ConfigError::invalid(
                "training.start_epoch",
                "epochs are 1-based; epoch 0 is the initial checkpoint",
            ));
        }
        if t.losses.is_empty() {
            return Err(ConfigError::invalid("training.losses", "at least one loss is required"));
        }
        if self.data.batch_size == 0 {
            return Err(ConfigError::invalid("data.batch_size", "must be at least 1"));
        }
        if t.mixed_precision.enabled && t.mixed_precision.loss_scale <= 0.0 {
            return Err(ConfigError::invalid(
                "training.mixed_precision.loss_scale",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `KILN_`)
/// 3. Explicit config file (`config_file`)
/// 4. Workspace-local config (`.kiln/config.toml`)
/// 5. User config (`~/.config/kiln/config.toml`)
/// 6. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
    overrides: Option<&KilnConfig>,
) -> Result<LoadedConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(KilnConfig::default()));
    let mut sources = Figment::new();

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "kiln", "kiln") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            sources = sources.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".kiln").join("config.toml");
        if ws_config.exists() {
            sources = sources.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        sources = sources.merge(Toml::file(path));
    }

    // KILN_TRAINING__NUM_EPOCHS, KILN_DATA__BATCH_SIZE, etc.
    sources = sources.merge(Env::prefixed("KILN_").split("__"));

    let (losses, warning) = resolve_losses(
        find_string_list(&sources, "training.losses")?,
        find_string_list(&sources, "training.criterions")?,
    );

    figment = figment.merge(sources);
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let mut config: KilnConfig = figment.extract().map_err(Box::new)?;
    if let (Some(losses), None) = (losses, overrides) {
        config.training.losses = losses;
    }

    let warnings: Vec<ConfigWarning> = warning.into_iter().collect();
    for warning in &warnings {
        tracing::warn!(%warning, "Configuration conflict resolved");
    }

    config.validate()?;
    Ok(LoadedConfig { config, warnings })
}

fn find_string_list(figment: &Figment, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match figment.find_value(key) {
        Ok(value) => value
            .deserialize::<Vec<String>>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("job.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = KilnConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training.backend, "reference");
        assert_eq!(config.training.losses, vec!["mse".to_string()]);
        assert_eq!(config.training.val_score_mode, ScoreMode::Highest);
        assert!(config.training.accelerator_ids.is_empty());
    }

    #[test]
    fn test_score_mode_is_strict() {
        assert!(ScoreMode::Highest.is_better(0.6, 0.5));
        assert!(!ScoreMode::Highest.is_better(0.5, 0.5));
        assert!(ScoreMode::Lowest.is_better(0.4, 0.5));
        assert!(!ScoreMode::Lowest.is_better(0.5, 0.5));
        assert!(ScoreMode::Highest.is_better(-1e9, ScoreMode::Highest.worst()));
    }

    #[test]
    fn test_resolve_losses_precedence() {
        let losses = Some(vec!["l1".to_string()]);
        let criterions = Some(vec!["mse".to_string()]);

        assert_eq!(
            resolve_losses(losses.clone(), criterions.clone()),
            (losses.clone(), Some(ConfigWarning::CriterionsConflict))
        );
        assert_eq!(
            resolve_losses(None, criterions.clone()),
            (criterions, Some(ConfigWarning::DeprecatedCriterions))
        );
        assert_eq!(resolve_losses(losses.clone(), None), (losses, None));
        assert_eq!(resolve_losses(None, None), (None, None));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[training]
num_epochs = 4
save_freq = 2
accelerator_ids = [0, 1]
val_score_mode = "lowest"

[training.optimizer]
name = "sgd"
params = { lr = 0.1, momentum = 0.9 }

[data]
batch_size = 8
"#,
        );

        let loaded = load_config(Some(dir.path()), Some(&path), None).unwrap();
        let t = &loaded.config.training;
        assert_eq!(t.num_epochs, 4);
        assert_eq!(t.save_freq, 2);
        assert_eq!(t.accelerator_ids, vec![0, 1]);
        assert_eq!(t.val_score_mode, ScoreMode::Lowest);
        assert_eq!(t.optimizer.name, "sgd");
        assert_eq!(t.optimizer.params["momentum"], serde_json::json!(0.9));
        assert_eq!(loaded.config.data.batch_size, 8);
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn test_legacy_criterions_migrated() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[training]\ncriterions = [\"l1\"]\n");

        let loaded = load_config(None, Some(&path), None).unwrap();
        assert_eq!(loaded.config.training.losses, vec!["l1".to_string()]);
        assert_eq!(loaded.warnings, vec![ConfigWarning::DeprecatedCriterions]);
    }

    #[test]
    fn test_conflicting_loss_fields_prefer_losses() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[training]\ncriterions = [\"l1\"]\nlosses = [\"mse\", \"l1\"]\n",
        );

        let loaded = load_config(None, Some(&path), None).unwrap();
        assert_eq!(
            loaded.config.training.losses,
            vec!["mse".to_string(), "l1".to_string()]
        );
        assert_eq!(loaded.warnings, vec![ConfigWarning::CriterionsConflict]);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/kiln.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_frequencies() {
        let mut config = KilnConfig::default();
        config.training.save_freq = 0;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.training.val_freq = 0;
        assert!(config.validate().is_err());

        let mut config = KilnConfig::default();
        config.training.start_epoch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_win() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[training]\nnum_epochs = 4\n");
        let mut overrides = KilnConfig::default();
        overrides.training.num_epochs = 7;

        let loaded = load_config(None, Some(&path), Some(&overrides)).unwrap();
        assert_eq!(loaded.config.training.num_epochs, 7);
    }

    #[test]
    fn test_serialized_defaults_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = KilnConfig::default();
        config.training.save_freq = 5;
        config.training.fold = 2;
        let path = write_config(&dir, &toml::to_string_pretty(&config).unwrap());

        let loaded = load_config(None, Some(&path), None).unwrap();
        assert!(loaded.warnings.is_empty());
        assert_eq!(loaded.config.training.save_freq, 5);
        assert_eq!(loaded.config.training.fold, 2);
        assert_eq!(loaded.config.checkpoint.save_dir, config.checkpoint.save_dir);
    }
}
