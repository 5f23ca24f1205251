//! Common utilities and types shared across Strata crates.
//!
//! This module provides the error type and the path/name types used by the
//! storage backends, the replication queue and the failover layer.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{StorageName, StoragePath};
