//! Replication and reconciliation for Strata failover storages.
//!
//! This crate applies the messages queued by failover storages and detects
//! divergences between backends.
//!
//! # Components
//! - Handlers: apply one replication message, requeueing it on failure
//! - Worker: consumes the queue and dispatches messages to handlers
//! - Reconciler: diffs backend listings and queues the corrections

pub mod handlers;
pub mod reconcile;
pub mod worker;

pub use handlers::{
    DeleteDirectoryHandler, DeleteFileHandler, HandlerOutcome, HandlerTable, MessageHandler,
    ReplicateFileHandler,
};
pub use reconcile::{
    BackendReport, ExtraFilesStrategy, ListingOutcome, Reconciler, SyncEvent, SyncListener,
    SyncOptions, SyncReport,
};
pub use worker::{ProcessedMessage, QueueWorker, DEFAULT_POLL_INTERVAL};
