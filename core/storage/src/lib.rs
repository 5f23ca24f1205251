//! Storage backend abstraction for Strata.
//!
//! This module provides a trait-based interface for the physical backends a
//! failover storage is built from (local filesystem, memory, ...) and a
//! provider registry that builds them from configuration.
//!
//! # Design Principles
//! - Async operations: All I/O operations are async
//! - Streaming support: Large files are handled via streams
//! - Optional capabilities: URL generation is discovered at runtime
//! - Unified error semantics: Consistent error types across providers

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{
    collect_stream, stream_from_bytes, ByteStream, Metadata, PublicUrlGenerator,
    StorageProvider, TemporaryUrlGenerator, UrlOptions, Visibility, WriteOptions,
};
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};
