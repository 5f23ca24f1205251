//! Local filesystem storage provider.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::provider::{
    ByteStream, Metadata, PublicUrlGenerator, StorageProvider, UrlOptions, Visibility,
    WriteOptions,
};
use strata_common::{Error, Result, StoragePath};

/// Local filesystem storage provider.
///
/// Stores files below a root directory. When a public base URL is
/// configured, the provider also generates public URLs by appending the
/// file path to that base.
pub struct LocalProvider {
    root: PathBuf,
    public_base_url: Option<Url>,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            public_base_url: None,
        })
    }

    /// Serve public URLs below `base`.
    ///
    /// # Errors
    /// - `base` is not a valid absolute URL
    pub fn with_public_base_url(mut self, base: &str) -> Result<Self> {
        let mut url = Url::parse(base)
            .map_err(|e| Error::Configuration(format!("Invalid public URL \"{}\": {}", base, e)))?;
        if url.cannot_be_a_base() {
            return Err(Error::Configuration(format!(
                "Public URL \"{}\" cannot be used as a base",
                base
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.public_base_url = Some(url);
        Ok(self)
    }

    /// Root directory of this provider.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a StoragePath to a filesystem path.
    fn to_fs_path(&self, path: &StoragePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    /// Create metadata from filesystem metadata.
    fn create_metadata(&self, path: &StoragePath, fs_meta: &std::fs::Metadata) -> Metadata {
        let modified: Option<DateTime<Utc>> = fs_meta.modified().ok().map(|t| t.into());

        Metadata {
            path: path.clone(),
            size: if fs_meta.is_file() {
                Some(fs_meta.len())
            } else {
                None
            },
            is_directory: fs_meta.is_dir(),
            mime_type: None,
            visibility: if fs_meta.is_file() {
                Self::visibility_of(fs_meta)
            } else {
                None
            },
            modified,
        }
    }

    #[cfg(unix)]
    fn visibility_of(fs_meta: &std::fs::Metadata) -> Option<Visibility> {
        use std::os::unix::fs::PermissionsExt;

        if fs_meta.permissions().mode() & 0o004 != 0 {
            Some(Visibility::Public)
        } else {
            Some(Visibility::Private)
        }
    }

    #[cfg(not(unix))]
    fn visibility_of(_fs_meta: &std::fs::Metadata) -> Option<Visibility> {
        None
    }

    #[cfg(unix)]
    async fn apply_visibility(fs_path: &Path, visibility: Visibility) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mode = match visibility {
            Visibility::Public => 0o644,
            Visibility::Private => 0o600,
        };
        fs::set_permissions(fs_path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn apply_visibility(_fs_path: &Path, _visibility: Visibility) -> Result<()> {
        Err(Error::Storage(
            "Visibility is not supported on this platform".to_string(),
        ))
    }

    async fn prepare_file(&self, path: &StoragePath) -> Result<PathBuf> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to the root".to_string()));
        }

        let fs_path = self.to_fs_path(path);
        if fs_path.is_dir() {
            return Err(Error::InvalidInput(format!("{} is a directory", path)));
        }
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs_path)
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        Ok(fs::try_exists(self.to_fs_path(path)).await?)
    }

    async fn read(&self, path: &StoragePath) -> Result<Bytes> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput("Cannot read a directory".to_string()));
        }

        Ok(Bytes::from(fs::read(&fs_path).await?))
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        let file = fs::File::open(&fs_path).await?;
        Ok(Box::pin(ReaderStream::new(file).map_err(Error::Io)))
    }

    async fn write(&self, path: &StoragePath, data: Bytes, options: &WriteOptions) -> Result<()> {
        let fs_path = self.prepare_file(path).await?;

        fs::write(&fs_path, &data).await?;

        if let Some(visibility) = options.visibility {
            Self::apply_visibility(&fs_path, visibility).await?;
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        path: &StoragePath,
        mut stream: ByteStream,
        options: &WriteOptions,
    ) -> Result<()> {
        let fs_path = self.prepare_file(path).await?;

        let mut file = fs::File::create(&fs_path).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        if let Some(visibility) = options.visibility {
            Self::apply_visibility(&fs_path, visibility).await?;
        }
        Ok(())
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Ok(());
        }

        if fs_path.is_dir() {
            return Err(Error::InvalidInput(
                "Use delete_dir for directories".to_string(),
            ));
        }

        fs::remove_file(&fs_path).await?;
        Ok(())
    }

    async fn delete_dir(&self, path: &StoragePath) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Ok(());
        }

        if !fs_path.is_dir() {
            return Err(Error::InvalidInput("Not a directory".to_string()));
        }

        if path.is_root() {
            // Keep the root itself, only empty it.
            let mut entries = fs::read_dir(&fs_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(entry.path()).await?;
                } else {
                    fs::remove_file(entry.path()).await?;
                }
            }
            return Ok(());
        }

        fs::remove_dir_all(&fs_path).await?;
        Ok(())
    }

    async fn metadata(&self, path: &StoragePath) -> Result<Metadata> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Path not found: {}", path)));
        }

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(self.create_metadata(path, &fs_meta))
    }

    async fn list(&self, path: &StoragePath, recursive: bool) -> Result<Vec<Metadata>> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.exists() {
            return Err(Error::NotFound(format!("Directory not found: {}", path)));
        }

        if !fs_path.is_dir() {
            return Err(Error::InvalidInput("Not a directory".to_string()));
        }

        let mut results = Vec::new();
        let mut pending = vec![(path.clone(), fs_path)];

        while let Some((dir, dir_fs_path)) = pending.pop() {
            let mut entries = fs::read_dir(&dir_fs_path).await?;

            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(String::from) else {
                    tracing::warn!("Skipping non UTF-8 entry in {}", dir_fs_path.display());
                    continue;
                };

                let Ok(child) = dir.join(&name) else {
                    tracing::warn!("Skipping unsupported entry name {:?}", name);
                    continue;
                };
                let fs_meta = entry.metadata().await?;
                if recursive && fs_meta.is_dir() {
                    pending.push((child.clone(), entry.path()));
                }
                results.push(self.create_metadata(&child, &fs_meta));
            }
        }

        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    async fn create_dir(&self, path: &StoragePath) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if fs_path.is_file() {
            return Err(Error::AlreadyExists(format!(
                "A file already exists at {}",
                path
            )));
        }

        fs::create_dir_all(&fs_path).await?;
        Ok(())
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let fs_path = self.to_fs_path(path);

        if !fs_path.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", path)));
        }

        Self::apply_visibility(&fs_path, visibility).await
    }

    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.exists() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);

        if !from_path.is_file() {
            return Err(Error::NotFound(format!("Source not found: {}", from)));
        }

        if to_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from_path, &to_path).await?;
        Ok(())
    }

    fn public_urls(&self) -> Option<&dyn PublicUrlGenerator> {
        self.public_base_url
            .as_ref()
            .map(|_| self as &dyn PublicUrlGenerator)
    }
}

#[async_trait]
impl PublicUrlGenerator for LocalProvider {
    async fn public_url(&self, path: &StoragePath, options: &UrlOptions) -> Result<String> {
        let Some(base) = &self.public_base_url else {
            return Err(Error::Storage(
                "No public URL is configured for this backend".to_string(),
            ));
        };

        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Storage(format!("Cannot build a public URL for {}", path)))?
            .pop_if_empty()
            .extend(path.components());

        if !options.is_empty() {
            url.query_pairs_mut().extend_pairs(options.iter());
        }

        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::collect_stream;
    use tempfile::TempDir;

    fn path(p: &str) -> StoragePath {
        StoragePath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        let data = Bytes::from_static(b"Hello, Local!");

        provider
            .write(&path("/nested/test.txt"), data.clone(), &WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.read(&path("/nested/test.txt")).await.unwrap(), data);
        let streamed = collect_stream(provider.read_stream(&path("/nested/test.txt")).await.unwrap())
            .await
            .unwrap();
        assert_eq!(streamed, data);
    }

    #[tokio::test]
    async fn test_local_write_stream() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"chunk-1;")),
            Ok(Bytes::from_static(b"chunk-2")),
        ];

        provider
            .write_stream(
                &path("/streamed.bin"),
                Box::pin(futures::stream::iter(chunks)),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            provider.read(&path("/streamed.bin")).await.unwrap(),
            Bytes::from_static(b"chunk-1;chunk-2")
        );
    }

    #[tokio::test]
    async fn test_local_list_recursive() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        let opts = WriteOptions::default();

        provider.write(&path("/dir/file1.txt"), Bytes::from_static(&[1]), &opts).await.unwrap();
        provider.write(&path("/dir/sub/file2.txt"), Bytes::from_static(&[2]), &opts).await.unwrap();

        let shallow = provider.list(&path("/dir"), false).await.unwrap();
        assert_eq!(shallow.len(), 2);

        let files: Vec<String> = provider
            .list(&StoragePath::root(), true)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.is_file())
            .map(|m| m.path.to_string())
            .collect();
        assert_eq!(files, vec!["/dir/file1.txt", "/dir/sub/file2.txt"]);
    }

    #[tokio::test]
    async fn test_local_delete_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();

        provider.delete(&path("/missing.txt")).await.unwrap();
        provider.delete_dir(&path("/missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_dir() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        provider
            .write(&path("/dir/sub/f"), Bytes::new(), &WriteOptions::default())
            .await
            .unwrap();

        provider.delete_dir(&path("/dir")).await.unwrap();
        assert!(!provider.exists(&path("/dir")).await.unwrap());
    }

    #[test]
    fn test_public_urls_require_base() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        assert!(provider.public_urls().is_none());

        let provider = provider
            .with_public_base_url("https://cdn.example.com/files")
            .unwrap();
        assert!(provider.public_urls().is_some());
    }

    #[tokio::test]
    async fn test_public_url_appends_path_and_options() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path())
            .unwrap()
            .with_public_base_url("https://cdn.example.com/files")
            .unwrap();

        let mut options = UrlOptions::new();
        options.insert("v".to_string(), "2".to_string());

        let url = provider
            .public_urls()
            .unwrap()
            .public_url(&path("/img/logo.png"), &options)
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example.com/files/img/logo.png?v=2");
    }
}
