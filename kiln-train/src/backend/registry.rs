//! Backend registry: resolves the configured backend id to an adapter.

use super::{Backend, ReferenceBackend};
use crate::error::{Result, TrainError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Holds every backend the process knows about, keyed by [`Backend::id`].
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in reference backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.replace(Arc::new(ReferenceBackend::new()));
        registry
    }

    /// Register a backend. Returns an error if the id is already taken.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<()> {
        let id = backend.id().to_string();
        if self.backends.contains_key(&id) {
            return Err(TrainError::AlreadyRegistered { id });
        }
        debug!(backend = %id, extensions = ?backend.extensions(), "Registering backend");
        self.backends.insert(id, backend);
        Ok(())
    }

    /// Replace (or add) a backend under its id.
    pub fn replace(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.id().to_string(), backend)
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| TrainError::UnknownBackend {
                id: id.to_string(),
                available: self.ids().join(", "),
            })
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}
