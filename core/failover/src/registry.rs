//! Lookup of failover storages by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::FailoverStorage;
use strata_common::{Error, Result};

/// Every failover storage known to the process.
///
/// Storages are kept in registration order: the first registered storage is
/// the default one of the command line tools.
#[derive(Default)]
pub struct FailoverRegistry {
    storages: Vec<Arc<FailoverStorage>>,
    by_name: HashMap<String, usize>,
}

impl FailoverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage.
    ///
    /// # Errors
    /// - A storage with the same name is already registered
    pub fn register(&mut self, storage: Arc<FailoverStorage>) -> Result<()> {
        let name = storage.storage_name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(Error::Configuration(format!(
                "Failover storage \"{}\" is declared twice",
                name
            )));
        }
        self.by_name.insert(name, self.storages.len());
        self.storages.push(storage);
        Ok(())
    }

    /// Get a storage by name.
    ///
    /// # Errors
    /// - No storage is registered under `name`
    pub fn get(&self, name: &str) -> Result<Arc<FailoverStorage>> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.storages[index]))
            .ok_or_else(|| Error::StorageNotFound {
                name: name.to_string(),
            })
    }

    /// First registered storage, if any.
    pub fn first(&self) -> Option<Arc<FailoverStorage>> {
        self.storages.first().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FailoverStorage>> {
        self.storages.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.storages
            .iter()
            .map(|storage| storage.storage_name().as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}
