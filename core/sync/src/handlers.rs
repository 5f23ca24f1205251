//! Replication message handlers.
//!
//! Each message kind has one handler. A handler applies the message to the
//! backend(s) it names; when a backend fails, the message goes back to the
//! queue with its retry counter incremented.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use strata_common::{Error, Result, StoragePath};
use strata_failover::{FailoverRegistry, FailoverStorage};
use strata_queue::{MessageKind, PushOutcome, ReplicationMessage};
use strata_storage::{collect_stream, WriteOptions};

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The action was applied.
    Completed,
    /// The action failed and a retry was queued.
    Requeued,
}

/// Applies one kind of replication message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Apply `message`.
    ///
    /// # Errors
    /// - Unknown storage or backend (configuration errors, never retried)
    /// - Queue failure while scheduling a retry
    async fn handle(&self, message: &ReplicationMessage) -> Result<HandlerOutcome>;
}

/// Push `message` back with one more retry.
async fn requeue(
    storage: &FailoverStorage,
    message: &ReplicationMessage,
    error: &Error,
) -> Result<HandlerOutcome> {
    let retry = message.with_incremented_retry();
    warn!("{} Failed, retry {} queued: {}", message, retry.retry_count(), error);

    if storage.queue().push(retry).await? == PushOutcome::Discarded {
        warn!("Gave up on: {}", message);
    }
    Ok(HandlerOutcome::Requeued)
}

/// Copies a file from its source backend to its destination backend.
pub struct ReplicateFileHandler {
    storages: Arc<FailoverRegistry>,
}

impl ReplicateFileHandler {
    pub fn new(storages: Arc<FailoverRegistry>) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl MessageHandler for ReplicateFileHandler {
    async fn handle(&self, message: &ReplicationMessage) -> Result<HandlerOutcome> {
        let ReplicationMessage::ReplicateFile {
            storage,
            path,
            source,
            destination,
            ..
        } = message
        else {
            return Err(Error::Configuration(format!(
                "Replication handler cannot process {} messages",
                message.kind()
            )));
        };

        let storage = self.storages.get(storage.as_str())?;
        let source = storage.backend(*source)?;
        let destination = storage.backend(*destination)?;

        let copied = async {
            // Buffered so a destination needing the payload twice never
            // reads the source again.
            let stream = source.provider().read_stream(path).await?;
            let data = collect_stream(stream).await?;
            debug!("Read {} bytes of {} from backend {}", data.len(), path, source.index());

            destination
                .provider()
                .write(path, data, &WriteOptions::default())
                .await
        }
        .await;

        match copied {
            Ok(()) => Ok(HandlerOutcome::Completed),
            Err(e) => requeue(&storage, message, &e).await,
        }
    }
}

/// Deletes a file on one backend.
pub struct DeleteFileHandler {
    storages: Arc<FailoverRegistry>,
}

impl DeleteFileHandler {
    pub fn new(storages: Arc<FailoverRegistry>) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl MessageHandler for DeleteFileHandler {
    async fn handle(&self, message: &ReplicationMessage) -> Result<HandlerOutcome> {
        let ReplicationMessage::DeleteFile {
            storage,
            path,
            destination,
            ..
        } = message
        else {
            return Err(Error::Configuration(format!(
                "File deletion handler cannot process {} messages",
                message.kind()
            )));
        };

        delete_on_backend(&self.storages, message, storage.as_str(), path, *destination, false)
            .await
    }
}

/// Deletes a directory on one backend.
pub struct DeleteDirectoryHandler {
    storages: Arc<FailoverRegistry>,
}

impl DeleteDirectoryHandler {
    pub fn new(storages: Arc<FailoverRegistry>) -> Self {
        Self { storages }
    }
}

#[async_trait]
impl MessageHandler for DeleteDirectoryHandler {
    async fn handle(&self, message: &ReplicationMessage) -> Result<HandlerOutcome> {
        let ReplicationMessage::DeleteDirectory {
            storage,
            path,
            destination,
            ..
        } = message
        else {
            return Err(Error::Configuration(format!(
                "Directory deletion handler cannot process {} messages",
                message.kind()
            )));
        };

        delete_on_backend(&self.storages, message, storage.as_str(), path, *destination, true)
            .await
    }
}

async fn delete_on_backend(
    storages: &FailoverRegistry,
    message: &ReplicationMessage,
    storage: &str,
    path: &StoragePath,
    destination: usize,
    directory: bool,
) -> Result<HandlerOutcome> {
    let storage = storages.get(storage)?;
    let backend = storage.backend(destination)?;

    let deleted = if directory {
        backend.provider().delete_dir(path).await
    } else {
        backend.provider().delete(path).await
    };

    match deleted {
        Ok(()) => Ok(HandlerOutcome::Completed),
        Err(e) => requeue(&storage, message, &e).await,
    }
}

/// Dispatch table from message kind to handler.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the standard handler for every message kind.
    pub fn with_default_handlers(storages: Arc<FailoverRegistry>) -> Self {
        let mut table = Self::new();
        table.handlers.insert(
            MessageKind::ReplicateFile,
            Arc::new(ReplicateFileHandler::new(Arc::clone(&storages))),
        );
        table.handlers.insert(
            MessageKind::DeleteFile,
            Arc::new(DeleteFileHandler::new(Arc::clone(&storages))),
        );
        table.handlers.insert(
            MessageKind::DeleteDirectory,
            Arc::new(DeleteDirectoryHandler::new(storages)),
        );
        table
    }

    /// Register the handler of `kind`.
    ///
    /// # Errors
    /// - A handler is already registered for `kind`
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(Error::Configuration(format!(
                "A handler is already registered for {} messages",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Get the handler of `kind`.
    pub fn get(&self, kind: MessageKind) -> Result<&Arc<dyn MessageHandler>> {
        self.handlers.get(&kind).ok_or_else(|| {
            Error::Configuration(format!("No handler is registered for {} messages", kind))
        })
    }

    /// Hand `message` to the handler of its kind.
    pub async fn dispatch(&self, message: &ReplicationMessage) -> Result<HandlerOutcome> {
        self.get(message.kind())?.handle(message).await
    }
}
