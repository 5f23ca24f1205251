//! Storage provider trait definition.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use strata_common::{Result, StoragePath};

/// Visibility of a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Readable by anyone who can reach the backend.
    Public,
    /// Restricted to the backend owner.
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Path of the object within the backend.
    pub path: StoragePath,
    /// Size in bytes (None for directories).
    pub size: Option<u64>,
    /// Whether this is a directory.
    pub is_directory: bool,
    /// MIME type, when the backend knows it.
    pub mime_type: Option<String>,
    /// Visibility, when the backend tracks it.
    pub visibility: Option<Visibility>,
    /// Last modification time, when the backend reports it.
    pub modified: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Whether this entry is a regular file.
    pub fn is_file(&self) -> bool {
        !self.is_directory
    }
}

/// Options applied when writing a file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// Visibility to give the written file.
    pub visibility: Option<Visibility>,
    /// MIME type to record for the written file.
    pub mime_type: Option<String>,
    /// Explicit modification time. Backends unable to set it ignore it.
    pub modified: Option<DateTime<Utc>>,
}

impl WriteOptions {
    /// Set the modification time to record.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Set the visibility to apply.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Set the MIME type to record.
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Free-form options forwarded to URL generators.
pub type UrlOptions = BTreeMap<String, String>;

/// Byte stream type for read/write operations.
///
/// A stream can be consumed only once. Callers needing to replay the content
/// must buffer it with [`collect_stream`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Drain a byte stream into a single contiguous buffer.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes> {
    let mut data = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }

    Ok(data.freeze())
}

/// Build a single-chunk stream from a buffer.
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Storage provider trait for different backends.
///
/// All operations are async. Every failure is reported through the shared
/// error type; callers treat any error as "this backend could not do it".
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Check if a path exists.
    async fn exists(&self, path: &StoragePath) -> Result<bool>;

    /// Read the complete content of a file.
    ///
    /// # Errors
    /// - File not found
    /// - Backend I/O errors
    async fn read(&self, path: &StoragePath) -> Result<Bytes>;

    /// Read a file as a stream.
    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream>;

    /// Write a file, creating missing parent directories.
    ///
    /// # Postconditions
    /// - File is created or replaced at the specified path
    async fn write(&self, path: &StoragePath, data: Bytes, options: &WriteOptions) -> Result<()>;

    /// Write a file from a stream.
    async fn write_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: &WriteOptions,
    ) -> Result<()>;

    /// Delete a file. Deleting a missing file succeeds.
    ///
    /// # Errors
    /// - Path is a directory
    async fn delete(&self, path: &StoragePath) -> Result<()>;

    /// Delete a directory and everything below it. Deleting a missing
    /// directory succeeds.
    async fn delete_dir(&self, path: &StoragePath) -> Result<()>;

    /// Get metadata for a path.
    ///
    /// # Errors
    /// - Path not found
    async fn metadata(&self, path: &StoragePath) -> Result<Metadata>;

    /// List contents of a directory, descending into subdirectories when
    /// `recursive` is set.
    async fn list(&self, path: &StoragePath, recursive: bool) -> Result<Vec<Metadata>>;

    /// Create a directory (including parents).
    async fn create_dir(&self, path: &StoragePath) -> Result<()>;

    /// Change the visibility of a file.
    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()>;

    /// Move/rename a path.
    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Copy a file.
    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()>;

    /// Public URL generation, if this backend supports it.
    fn public_urls(&self) -> Option<&dyn PublicUrlGenerator> {
        None
    }

    /// Temporary URL generation, if this backend supports it.
    fn temporary_urls(&self) -> Option<&dyn TemporaryUrlGenerator> {
        None
    }
}

/// Optional capability: generate a permanent public URL for a file.
#[async_trait]
pub trait PublicUrlGenerator: Send + Sync {
    async fn public_url(&self, path: &StoragePath, options: &UrlOptions) -> Result<String>;
}

/// Optional capability: generate a URL valid until `expires_at`.
#[async_trait]
pub trait TemporaryUrlGenerator: Send + Sync {
    async fn temporary_url(
        &self,
        path: &StoragePath,
        expires_at: DateTime<Utc>,
        options: &UrlOptions,
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::Error;

    #[test]
    fn test_metadata_serialization() {
        let metadata = Metadata {
            path: StoragePath::parse("/dir/test-file.txt").unwrap(),
            size: Some(1024),
            is_directory: false,
            mime_type: Some("text/plain".to_string()),
            visibility: Some(Visibility::Private),
            modified: Some(Utc::now()),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"private\""));
        let deserialized: Metadata = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, metadata);
    }

    #[tokio::test]
    async fn test_collect_stream_concatenates_chunks() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let data = collect_stream(Box::pin(stream::iter(chunks))).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_collect_stream_propagates_errors() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(Error::Storage("connection reset".to_string())),
        ];
        assert!(collect_stream(Box::pin(stream::iter(chunks))).await.is_err());
    }
}
