//! Batch data model and batch sources.

pub mod array;
pub mod loader;

pub use array::{Array, Batch, DATA_KEY, LABEL_KEY};
pub use loader::{BatchIter, BatchSource, DataManager, Dataset, InMemoryDataset};
