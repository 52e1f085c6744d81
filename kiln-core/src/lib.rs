//! # kiln-core: shared configuration and persistence
//!
//! The ambient layer used by every Kiln crate: layered configuration
//! (`figment`), configuration errors, and atomic JSON persistence used by
//! checkpoint bundles and manifests.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{
    CheckpointConfig, ConfigWarning, DataConfig, EarlyStoppingConfig, KilnConfig, LoadedConfig,
    LoggingConfig, MixedPrecisionConfig, OptimizerConfig, ScheduleConfig, ScoreMode,
    TrainingConfig, load_config,
};
pub use error::ConfigError;
