//! The failover storage.
//!
//! A [`FailoverStorage`] presents several backends as one storage:
//!
//! - reads are served by the first backend able to answer, in priority order
//! - writes land on the first backend accepting them; every other backend
//!   receives the file later through a queued replication
//! - deletes are applied everywhere; backends that fail get a queued retry
//!
//! Operations that only make sense against a single authoritative backend
//! (directory creation, listing, moves, visibility changes) are rejected.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use strata_common::{Error, Result, StorageName, StoragePath};
use strata_queue::{MessageQueue, PushOutcome, ReplicationMessage};
use strata_storage::{
    collect_stream, stream_from_bytes, ByteStream, Metadata, PublicUrlGenerator,
    StorageProvider, TemporaryUrlGenerator, UrlOptions, Visibility, WriteOptions,
};

/// A logical storage backed by an ordered list of physical backends.
pub struct FailoverStorage {
    name: StorageName,
    backends: Vec<Backend>,
    queue: Arc<dyn MessageQueue>,
}

impl FailoverStorage {
    /// Create a failover storage whose backends report comparable clocks.
    ///
    /// # Errors
    /// - Fewer than two backends
    pub fn new(
        name: StorageName,
        providers: Vec<Arc<dyn StorageProvider>>,
        queue: Arc<dyn MessageQueue>,
    ) -> Result<Self> {
        let providers = providers.into_iter().map(|p| (p, 0)).collect();
        Self::with_time_shifts(name, providers, queue)
    }

    /// Create a failover storage from `(provider, time_shift)` pairs.
    ///
    /// Backends keep the order they are given in: the first one is the
    /// primary.
    ///
    /// # Errors
    /// - Fewer than two backends
    pub fn with_time_shifts(
        name: StorageName,
        providers: Vec<(Arc<dyn StorageProvider>, i64)>,
        queue: Arc<dyn MessageQueue>,
    ) -> Result<Self> {
        if providers.len() < 2 {
            return Err(Error::Configuration(format!(
                "Failover storage \"{}\" needs at least two backends, got {}",
                name,
                providers.len()
            )));
        }

        let backends = providers
            .into_iter()
            .enumerate()
            .map(|(index, (provider, time_shift))| Backend::new(index, provider, time_shift))
            .collect();

        Ok(Self {
            name,
            backends,
            queue,
        })
    }

    pub fn storage_name(&self) -> &StorageName {
        &self.name
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Get a backend by ordinal.
    ///
    /// # Errors
    /// - No backend at `index`
    pub fn backend(&self, index: usize) -> Result<&Backend> {
        self.backends.get(index).ok_or_else(|| Error::BackendNotFound {
            storage: self.name.to_string(),
            index,
        })
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    fn skip(&self, operation: &str, backend: &Backend, path: &StoragePath, error: &Error) {
        debug!(
            "{}: {} of {} failed on backend {}, trying next: {}",
            self.name,
            operation,
            path,
            backend.index(),
            error
        );
    }

    fn unavailable(&self, operation: &str, path: &StoragePath) -> Error {
        warn!("{}: no backend could {} {}", self.name, operation, path);
        Error::Unavailable {
            operation: operation.to_string(),
            path: path.to_string(),
        }
    }

    async fn enqueue(&self, message: ReplicationMessage) -> Result<()> {
        let description = message.to_string();
        match self.queue.push(message).await? {
            PushOutcome::Enqueued => debug!("Queued: {}", description),
            PushOutcome::Duplicate => debug!("Already queued: {}", description),
            PushOutcome::Discarded => warn!("Not queued: {}", description),
        }
        Ok(())
    }

    /// Queue a copy of `path` from `source` to every other backend.
    async fn replicate_from(&self, path: &StoragePath, source: usize) -> Result<()> {
        for backend in &self.backends {
            if backend.index() == source {
                continue;
            }
            self.enqueue(ReplicationMessage::replicate_file(
                self.name.clone(),
                path.clone(),
                source,
                backend.index(),
            ))
            .await?;
        }
        Ok(())
    }

    fn unsupported(operation: &str) -> Error {
        Error::Unsupported {
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl StorageProvider for FailoverStorage {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        for backend in &self.backends {
            match backend.provider().exists(path).await {
                Ok(exists) => return Ok(exists),
                Err(e) => self.skip("check", backend, path, &e),
            }
        }
        Err(self.unavailable("check", path))
    }

    async fn read(&self, path: &StoragePath) -> Result<Bytes> {
        for backend in &self.backends {
            match backend.provider().read(path).await {
                Ok(data) => return Ok(data),
                Err(e) => self.skip("read", backend, path, &e),
            }
        }
        Err(self.unavailable("read", path))
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        for backend in &self.backends {
            match backend.provider().read_stream(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => self.skip("read", backend, path, &e),
            }
        }
        Err(self.unavailable("read", path))
    }

    async fn write(&self, path: &StoragePath, data: Bytes, options: &WriteOptions) -> Result<()> {
        for backend in &self.backends {
            match backend
                .provider()
                .write_stream(path, stream_from_bytes(data.clone()), options)
                .await
            {
                Ok(()) => {
                    info!("{}: wrote {} to backend {}", self.name, path, backend.index());
                    return self.replicate_from(path, backend.index()).await;
                }
                Err(e) => {
                    warn!(
                        "{}: write of {} failed on backend {}: {}",
                        self.name,
                        path,
                        backend.index(),
                        e
                    );
                }
            }
        }

        Err(Error::WriteFailed {
            path: path.to_string(),
        })
    }

    async fn write_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: &WriteOptions,
    ) -> Result<()> {
        // A failed attempt must not consume the payload of the next one.
        let data = collect_stream(stream).await?;
        self.write(path, data, options).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        for backend in &self.backends {
            if let Err(e) = backend.provider().delete(path).await {
                warn!(
                    "{}: delete of {} failed on backend {}, queueing retry: {}",
                    self.name,
                    path,
                    backend.index(),
                    e
                );
                self.enqueue(ReplicationMessage::delete_file(
                    self.name.clone(),
                    path.clone(),
                    backend.index(),
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn delete_dir(&self, path: &StoragePath) -> Result<()> {
        for backend in &self.backends {
            if let Err(e) = backend.provider().delete_dir(path).await {
                warn!(
                    "{}: delete of directory {} failed on backend {}, queueing retry: {}",
                    self.name,
                    path,
                    backend.index(),
                    e
                );
                self.enqueue(ReplicationMessage::delete_directory(
                    self.name.clone(),
                    path.clone(),
                    backend.index(),
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn metadata(&self, path: &StoragePath) -> Result<Metadata> {
        for backend in &self.backends {
            match backend.provider().metadata(path).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => self.skip("get metadata of", backend, path, &e),
            }
        }
        Err(self.unavailable("get metadata of", path))
    }

    async fn list(&self, _path: &StoragePath, _recursive: bool) -> Result<Vec<Metadata>> {
        Err(Self::unsupported("list"))
    }

    async fn create_dir(&self, _path: &StoragePath) -> Result<()> {
        Err(Self::unsupported("create_dir"))
    }

    async fn set_visibility(&self, _path: &StoragePath, _visibility: Visibility) -> Result<()> {
        Err(Self::unsupported("set_visibility"))
    }

    async fn rename(&self, _from: &StoragePath, _to: &StoragePath) -> Result<()> {
        Err(Self::unsupported("rename"))
    }

    async fn copy(&self, _from: &StoragePath, _to: &StoragePath) -> Result<()> {
        Err(Self::unsupported("copy"))
    }

    fn public_urls(&self) -> Option<&dyn PublicUrlGenerator> {
        Some(self as &dyn PublicUrlGenerator)
    }

    fn temporary_urls(&self) -> Option<&dyn TemporaryUrlGenerator> {
        Some(self as &dyn TemporaryUrlGenerator)
    }
}

#[async_trait]
impl PublicUrlGenerator for FailoverStorage {
    async fn public_url(&self, path: &StoragePath, options: &UrlOptions) -> Result<String> {
        for backend in &self.backends {
            let Some(urls) = backend.provider().public_urls() else {
                continue;
            };
            match urls.public_url(path, options).await {
                Ok(url) => return Ok(url),
                Err(e) => self.skip("get public URL of", backend, path, &e),
            }
        }
        Err(self.unavailable("get public URL of", path))
    }
}

#[async_trait]
impl TemporaryUrlGenerator for FailoverStorage {
    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_at: DateTime<Utc>,
        options: &UrlOptions,
    ) -> Result<String> {
        for backend in &self.backends {
            let Some(urls) = backend.provider().temporary_urls() else {
                continue;
            };
            match urls.temporary_url(path, expires_at, options).await {
                Ok(url) => return Ok(url),
                Err(e) => self.skip("get temporary URL of", backend, path, &e),
            }
        }
        Err(self.unavailable("get temporary URL of", path))
    }
}
