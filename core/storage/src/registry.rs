//! Backend construction from configuration.
//!
//! A storage backend is declared as a `provider` kind plus a free-form JSON
//! object. The registry maps each kind to the factory that builds it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::StorageProvider;
use strata_common::{Error, Result};

/// Builds a backend from its JSON configuration.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Backend factories keyed by provider kind.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the factory of provider kind `kind`.
    ///
    /// # Errors
    /// - `kind` already has a factory
    pub fn register(&mut self, kind: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let kind = kind.into();
        if self.has_provider(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Build a backend of kind `kind` from `config`.
    ///
    /// An unknown kind and a config the factory rejects are both
    /// configuration errors, reported before any storage is assembled.
    pub fn resolve(&self, kind: &str, config: Value) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(kind).ok_or_else(|| {
            Error::Configuration(format!(
                "Unknown provider '{}', expected one of: {}",
                kind,
                self.providers().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Registered provider kinds, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn has_provider(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

/// Create a registry with default providers.
///
/// - `memory`: volatile in-process storage, no configuration
/// - `local`: filesystem storage, `{"root": "...", "public_url": "..."}` with
///   `public_url` optional
pub fn create_default_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry
        .factories
        .insert("memory".to_string(), Box::new(memory_factory));
    registry
        .factories
        .insert("local".to_string(), Box::new(local_factory));
    registry
}

fn memory_factory(_config: Value) -> Result<Arc<dyn StorageProvider>> {
    Ok(Arc::new(crate::memory::MemoryProvider::new()))
}

fn local_factory(config: Value) -> Result<Arc<dyn StorageProvider>> {
    let root = config
        .get("root")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::Configuration("Local provider requires 'root' path".to_string())
        })?;

    let mut provider = crate::local::LocalProvider::new(root)?;
    if let Some(base) = config.get("public_url") {
        let base = base.as_str().ok_or_else(|| {
            Error::Configuration("Local provider 'public_url' must be a string".to_string())
        })?;
        provider = provider.with_public_base_url(base)?;
    }
    Ok(Arc::new(provider))
}
