use super::{FlatFileBackend, MemoryBackend, StorageBackend};
use crate::config::StorageConfig;
use crate::BuildWorldError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub type BackendFactory =
    Box<dyn Fn(&StorageConfig) -> crate::Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// Maps a backend tag to the factory that builds it. Resolved once at startup.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry knowing the backends shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("flat-file", |config: &StorageConfig| {
            let backend = FlatFileBackend::new(config.data_dir.clone())?;
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry.register("memory", |_: &StorageConfig| {
            Ok(Arc::new(MemoryBackend::new()) as Arc<dyn StorageBackend>)
        });
        registry
    }

    /// Adds or replaces the factory for `tag`.
    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&StorageConfig) -> crate::Result<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_ascii_lowercase(), Box::new(factory));
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn resolve(&self, config: &StorageConfig) -> crate::Result<Arc<dyn StorageBackend>> {
        let tag = config.backend.to_ascii_lowercase();
        let factory = self.factories.get(&tag).ok_or_else(|| {
            BuildWorldError::Configuration(format!(
                "unknown storage backend '{}' (available: {})",
                config.backend,
                self.tags().join(", ")
            ))
        })?;
        let backend = factory(config)?;
        info!(backend = %tag, "storage backend ready");
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
