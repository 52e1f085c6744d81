//! Error types for the kiln-train crate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = TrainError> = std::result::Result<T, E>;

/// Top-level error type for training operations.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown backend '{id}' (available: {available})")]
    UnknownBackend { id: String, available: String },

    #[error("Backend '{id}' is already registered")]
    AlreadyRegistered { id: String },

    #[error("Backend '{backend}' error: {message}")]
    Backend { backend: String, message: String },

    /// A checkpoint exists but lacks a field the bundle requires.
    #[error("Checkpoint {} is missing key '{key}'", path.display())]
    MissingStateKey { path: PathBuf, key: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Malformed checkpoint file name: {0}")]
    MalformedCheckpointName(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Unknown {kind} '{name}'")]
    UnknownComponent { kind: &'static str, name: String },

    #[error("Invalid trainer state: {0}")]
    InvalidState(String),

    #[error("Core configuration error: {0}")]
    Core(#[from] kiln_core::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn backend(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn missing_key(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self::MissingStateKey {
            path: path.into(),
            key: key.into(),
        }
    }

    /// Whether resume should recover from this error by starting fresh.
    pub fn is_corrupt_resume_state(&self) -> bool {
        matches!(self, Self::MissingStateKey { .. })
    }
}

/// Failures raised by accelerator probes and placement.
///
/// These never abort setup: the placement resolver catches them and falls
/// back to the CPU.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("No accelerator driver available: {0}")]
    DriverUnavailable(String),

    #[error("Accelerator {id} not present ({available} visible)")]
    NotPresent { id: usize, available: usize },

    #[error("Placement on {device} failed: {reason}")]
    PlacementFailed { device: String, reason: String },
}
