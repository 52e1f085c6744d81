//! # kiln-train: backend-agnostic training orchestration
//!
//! Drives any network that implements [`Network`] through a configurable
//! epoch loop with validation, best-score tracking, periodic checkpoints,
//! resume, callbacks and device placement. Everything that depends on a tensor
//! library lives behind the [`Backend`] trait; [`BackendRegistry`] resolves the
//! configured backend id.
//!
//! ```no_run
//! use kiln_train::{BackendRegistry, ReferenceBackend, Trainer};
//! # fn main() -> kiln_train::Result<()> {
//! let registry = BackendRegistry::with_defaults();
//! let backend = registry.get("reference")?;
//! let config = kiln_core::TrainingConfig::default();
//! let network = ReferenceBackend::linear(4, 1, 42);
//! let mut trainer = Trainer::new(network, backend, config, "runs/demo")?;
//! # let _ = &mut trainer;
//! # Ok(())
//! # }
//! ```

// Contracts
pub mod backend;
pub mod error;
pub mod network;

// Data and scoring
pub mod data;
pub mod losses;
pub mod metrics;

// Orchestration
pub mod callbacks;
pub mod checkpoint;
pub mod device;
pub mod trainer;

pub use backend::{Backend, BackendRegistry, ReferenceBackend, StateBundle};
pub use callbacks::{
    Callback, CallbackSequencer, EarlyStopping, EpochContext, ReduceLrOnPlateau, StateUpdate,
    StepLr,
};
pub use checkpoint::{CheckpointEntry, CheckpointKind, CheckpointManager};
pub use data::{Array, Batch, BatchSource, DataManager, Dataset, InMemoryDataset};
pub use device::{Device, Placement, resolve_placement};
pub use error::{DeviceError, Result, TrainError};
pub use losses::{Loss, LossMap};
pub use metrics::{Metric, MetricMap, MetricValues, TrainingHistory};
pub use network::{ClosureOutput, NativeState, Network, Optimizer, OptimizerMap};
pub use trainer::{Prediction, Trainer, TrainerPhase, TrainerState, TrainingSummary};
