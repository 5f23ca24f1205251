//! Failure injection for tests.
//!
//! [`FlakyProvider`] wraps another provider and fails selected operations on
//! demand, while counting how often each operation was attempted.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::provider::{
    ByteStream, Metadata, PublicUrlGenerator, StorageProvider, TemporaryUrlGenerator, UrlOptions,
    Visibility, WriteOptions,
};
use strata_common::{Error, Result, StoragePath};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Exists,
    Read,
    ReadStream,
    Write,
    WriteStream,
    Delete,
    DeleteDir,
    Metadata,
    List,
    CreateDir,
    SetVisibility,
    Rename,
    Copy,
    PublicUrl,
    TemporaryUrl,
}

#[derive(Default)]
struct State {
    failing: HashSet<Operation>,
    calls: HashMap<Operation, usize>,
    consumed: HashSet<StoragePath>,
}

/// Provider wrapper that fails on demand.
pub struct FlakyProvider {
    name: String,
    inner: Arc<dyn StorageProvider>,
    state: Mutex<State>,
    public_urls: bool,
    temporary_urls: bool,
    one_shot_chunk: Option<usize>,
    replay_writes: bool,
}

impl FlakyProvider {
    /// Wrap `inner`, reporting `name` as the provider name.
    pub fn new(name: impl Into<String>, inner: Arc<dyn StorageProvider>) -> Self {
        Self {
            name: name.into(),
            inner,
            state: Mutex::new(State::default()),
            public_urls: false,
            temporary_urls: false,
            one_shot_chunk: None,
            replay_writes: false,
        }
    }

    /// Serve each file once, as a stream of `chunk_size` byte chunks.
    ///
    /// Any later `read` or `read_stream` of the same path fails, like a
    /// pipe or socket that cannot be rewound.
    pub fn with_one_shot_reads(mut self, chunk_size: usize) -> Self {
        self.one_shot_chunk = Some(chunk_size.max(1));
        self
    }

    /// Hand every written payload to the wrapped provider twice, like a
    /// backend retrying an upload internally.
    pub fn with_replayed_writes(mut self) -> Self {
        self.replay_writes = true;
        self
    }

    /// Advertise public URL support. URLs look like `public://<name><path>`.
    pub fn with_public_urls(mut self) -> Self {
        self.public_urls = true;
        self
    }

    /// Advertise temporary URL support. URLs look like
    /// `temporary://<name><path>?expires=<unix seconds>`.
    pub fn with_temporary_urls(mut self) -> Self {
        self.temporary_urls = true;
        self
    }

    /// Make `operation` fail from now on.
    pub fn fail(&self, operation: Operation) {
        self.lock().failing.insert(operation);
    }

    /// Make every operation fail from now on.
    pub fn fail_all(&self) {
        let mut state = self.lock();
        for operation in ALL_OPERATIONS {
            state.failing.insert(operation);
        }
    }

    /// Let `operation` succeed again.
    pub fn heal(&self, operation: Operation) {
        self.lock().failing.remove(&operation);
    }

    /// Let every operation succeed again.
    pub fn heal_all(&self) {
        self.lock().failing.clear();
    }

    /// Number of times `operation` was attempted, failed attempts included.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &Arc<dyn StorageProvider> {
        &self.inner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic inside a test already fails it, the poisoned state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn consume(&self, path: &StoragePath) -> Result<()> {
        if self.one_shot_chunk.is_some() && !self.lock().consumed.insert(path.clone()) {
            return Err(Error::Storage(format!("{}: {} was already read", self.name, path)));
        }
        Ok(())
    }

    fn enter(&self, operation: Operation, path: &StoragePath) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.failing.contains(&operation) {
            return Err(Error::Storage(format!(
                "{}: injected {:?} failure for {}",
                self.name, operation, path
            )));
        }
        Ok(())
    }
}

const ALL_OPERATIONS: [Operation; 15] = [
    Operation::Exists,
    Operation::Read,
    Operation::ReadStream,
    Operation::Write,
    Operation::WriteStream,
    Operation::Delete,
    Operation::DeleteDir,
    Operation::Metadata,
    Operation::List,
    Operation::CreateDir,
    Operation::SetVisibility,
    Operation::Rename,
    Operation::Copy,
    Operation::PublicUrl,
    Operation::TemporaryUrl,
];

#[async_trait]
impl StorageProvider for FlakyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        self.enter(Operation::Exists, path)?;
        self.inner.exists(path).await
    }

    async fn read(&self, path: &StoragePath) -> Result<Bytes> {
        self.enter(Operation::Read, path)?;
        self.consume(path)?;
        self.inner.read(path).await
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        self.enter(Operation::ReadStream, path)?;
        let Some(chunk_size) = self.one_shot_chunk else {
            return self.inner.read_stream(path).await;
        };

        self.consume(path)?;
        let data = self.inner.read(path).await?;
        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..data.len().min(start + chunk_size))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn write(&self, path: &StoragePath, data: Bytes, options: &WriteOptions) -> Result<()> {
        self.enter(Operation::Write, path)?;
        if self.replay_writes {
            self.inner.write(path, data.clone(), options).await?;
        }
        self.inner.write(path, data, options).await
    }

    async fn write_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: &WriteOptions,
    ) -> Result<()> {
        self.enter(Operation::WriteStream, path)?;
        self.inner.write_stream(path, stream, options).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        self.enter(Operation::Delete, path)?;
        self.inner.delete(path).await
    }

    async fn delete_dir(&self, path: &StoragePath) -> Result<()> {
        self.enter(Operation::DeleteDir, path)?;
        self.inner.delete_dir(path).await
    }

    async fn metadata(&self, path: &StoragePath) -> Result<Metadata> {
        self.enter(Operation::Metadata, path)?;
        self.inner.metadata(path).await
    }

    async fn list(&self, path: &StoragePath, recursive: bool) -> Result<Vec<Metadata>> {
        self.enter(Operation::List, path)?;
        self.inner.list(path, recursive).await
    }

    async fn create_dir(&self, path: &StoragePath) -> Result<()> {
        self.enter(Operation::CreateDir, path)?;
        self.inner.create_dir(path).await
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        self.enter(Operation::SetVisibility, path)?;
        self.inner.set_visibility(path, visibility).await
    }

    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.enter(Operation::Rename, from)?;
        self.inner.rename(from, to).await
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        self.enter(Operation::Copy, from)?;
        self.inner.copy(from, to).await
    }

    fn public_urls(&self) -> Option<&dyn PublicUrlGenerator> {
        if self.public_urls {
            Some(self as &dyn PublicUrlGenerator)
        } else {
            None
        }
    }

    fn temporary_urls(&self) -> Option<&dyn TemporaryUrlGenerator> {
        if self.temporary_urls {
            Some(self as &dyn TemporaryUrlGenerator)
        } else {
            None
        }
    }
}

#[async_trait]
impl PublicUrlGenerator for FlakyProvider {
    async fn public_url(&self, path: &StoragePath, _options: &UrlOptions) -> Result<String> {
        self.enter(Operation::PublicUrl, path)?;
        Ok(format!("public://{}{}", self.name, path))
    }
}

#[async_trait]
impl TemporaryUrlGenerator for FlakyProvider {
    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_at: DateTime<Utc>,
        _options: &UrlOptions,
    ) -> Result<String> {
        self.enter(Operation::TemporaryUrl, path)?;
        Ok(format!(
            "temporary://{}{}?expires={}",
            self.name,
            path,
            expires_at.timestamp()
        ))
    }
}
