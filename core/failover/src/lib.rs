//! Failover storages for Strata.
//!
//! A failover storage groups several storage backends under one name. Reads
//! fall back from one backend to the next, writes succeed as soon as one
//! backend accepts them, and every divergence between backends is recorded in
//! the replication queue so a worker can repair it later.

pub mod backend;
pub mod config;
pub mod registry;
pub mod storage;

pub use backend::Backend;
pub use config::{BackendConfig, QueueConfig, StorageConfig, StrataConfig, DEFAULT_DATABASE};
pub use registry::FailoverRegistry;
pub use storage::FailoverStorage;
