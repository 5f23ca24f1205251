//! JSON configuration of failover storages and their queue.
//!
//! ```json
//! {
//!   "queue": { "database": "strata-queue.db" },
//!   "storages": [
//!     { "name": "default",
//!       "backends": [
//!         { "provider": "local", "config": { "root": "/srv/a" } },
//!         { "provider": "local", "config": { "root": "/srv/b" }, "time_shift": 3600 }
//!       ] }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::registry::FailoverRegistry;
use crate::storage::FailoverStorage;
use strata_common::{Error, Result, StorageName};
use strata_queue::{MessageQueue, QueuePolicy, SqliteQueue, DEFAULT_TABLE_NAME};
use strata_storage::ProviderRegistry;

/// Queue database used when the configuration names none.
pub const DEFAULT_DATABASE: &str = "strata-queue.db";

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    pub storages: Vec<StorageConfig>,
}

/// Where pending replications are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// SQLite database file, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Drop messages retried more often than this.
    #[serde(default)]
    pub max_retry_count: Option<u32>,
}

/// One failover storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub name: StorageName,
    /// Backends by priority, primary first.
    pub backends: Vec<BackendConfig>,
}

/// One backend of a failover storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Provider name in the provider registry (`local`, `memory`, ...).
    pub provider: String,
    /// Provider specific configuration.
    #[serde(default)]
    pub config: Value,
    /// Seconds subtracted from this backend's modification times.
    #[serde(default)]
    pub time_shift: i64,
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            table_name: default_table_name(),
            max_retry_count: None,
        }
    }
}

impl StrataConfig {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    /// - Malformed JSON or unknown fields
    /// - Invalid storage declarations (see [`StrataConfig::validate`])
    pub fn from_json(text: &str) -> Result<Self> {
        let config: StrataConfig = serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Unable to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// # Errors
    /// - No storage declared
    /// - A storage name is used twice
    /// - A storage has fewer than two backends
    pub fn validate(&self) -> Result<()> {
        if self.storages.is_empty() {
            return Err(Error::Configuration(
                "At least one failover storage must be declared".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for storage in &self.storages {
            if !names.insert(storage.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "Failover storage \"{}\" is declared twice",
                    storage.name
                )));
            }
            if storage.backends.len() < 2 {
                return Err(Error::Configuration(format!(
                    "Failover storage \"{}\" needs at least two backends, got {}",
                    storage.name,
                    storage.backends.len()
                )));
            }
        }
        Ok(())
    }

    /// Open the configured queue.
    pub fn open_queue(&self) -> Result<SqliteQueue> {
        info!("Using queue {}", self.queue.database);
        Ok(SqliteQueue::open(&self.queue.database)?
            .with_table_name(&self.queue.table_name)?
            .with_policy(QueuePolicy::default().with_max_retry_count(self.queue.max_retry_count)))
    }

    /// Build every declared storage on top of `queue`.
    ///
    /// # Errors
    /// - Unknown provider or invalid provider configuration
    pub fn build_registry(
        &self,
        providers: &ProviderRegistry,
        queue: Arc<dyn MessageQueue>,
    ) -> Result<FailoverRegistry> {
        let mut registry = FailoverRegistry::new();

        for storage in &self.storages {
            let mut backends = Vec::with_capacity(storage.backends.len());
            for (index, backend) in storage.backends.iter().enumerate() {
                let provider = providers
                    .resolve(&backend.provider, backend.config.clone())
                    .map_err(|e| {
                        Error::Configuration(format!(
                            "Backend {} of \"{}\": {}",
                            index, storage.name, e
                        ))
                    })?;
                backends.push((provider, backend.time_shift));
            }

            let failover = FailoverStorage::with_time_shifts(
                storage.name.clone(),
                backends,
                Arc::clone(&queue),
            )?;
            registry.register(Arc::new(failover))?;
            debug!(
                "Registered failover storage {} with {} backends",
                storage.name,
                storage.backends.len()
            );
        }

        Ok(registry)
    }
}
