use tracing::debug;

use baler_types::error::{BalerError, Result};

use crate::{backend_from_config, StorageBackend, StorageConfig};

struct Registered {
    priority: i32,
    backend: Box<dyn StorageBackend>,
}

/// Ordered set of storage backends, built once at startup.
///
/// Iteration order is ascending priority, ties broken by id.
#[derive(Default)]
pub struct StorageRegistry {
    entries: Vec<Registered>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured backend and register it.
    pub fn from_configs(configs: &[StorageConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for cfg in configs {
            registry.register(cfg.priority, backend_from_config(cfg)?)?;
        }
        Ok(registry)
    }

    /// Add a backend. Duplicate ids are rejected.
    pub fn register(&mut self, priority: i32, backend: Box<dyn StorageBackend>) -> Result<()> {
        if self.get(backend.id()).is_some() {
            return Err(BalerError::Config(format!(
                "duplicate storage id '{}'",
                backend.id()
            )));
        }
        debug!(storage = backend.id(), kind = %backend.kind(), priority, "registered storage");
        self.entries.push(Registered { priority, backend });
        self.entries.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.backend.id().cmp(b.backend.id()))
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&dyn StorageBackend> {
        self.entries
            .iter()
            .find(|e| e.backend.id() == id)
            .map(|e| e.backend.as_ref())
    }

    /// Like [`Self::get`] but fails with `StorageNotFound`.
    pub fn require(&self, id: &str) -> Result<&dyn StorageBackend> {
        self.get(id)
            .ok_or_else(|| BalerError::StorageNotFound(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn StorageBackend> {
        self.entries.iter().map(|e| e.backend.as_ref())
    }

    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|b| b.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
