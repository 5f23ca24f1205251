//! In-memory storage provider for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::provider::{
    collect_stream, stream_from_bytes, ByteStream, Metadata, StorageProvider, Visibility,
    WriteOptions,
};
use strata_common::{Error, Result, StoragePath};

/// In-memory storage entry.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Bytes, metadata: Metadata },
    Directory { metadata: Metadata },
}

impl Entry {
    fn metadata(&self) -> &Metadata {
        match self {
            Entry::File { metadata, .. } => metadata,
            Entry::Directory { metadata } => metadata,
        }
    }
}

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Parent directories are created implicitly on write,
/// and an explicit modification time in [`WriteOptions`] is honoured.
pub struct MemoryProvider {
    storage: Arc<RwLock<BTreeMap<StoragePath, Entry>>>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        let mut storage = BTreeMap::new();
        storage.insert(
            StoragePath::root(),
            Entry::Directory {
                metadata: Self::directory_metadata(&StoragePath::root()),
            },
        );

        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    fn directory_metadata(path: &StoragePath) -> Metadata {
        Metadata {
            path: path.clone(),
            size: None,
            is_directory: true,
            mime_type: None,
            visibility: None,
            modified: Some(Utc::now()),
        }
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, BTreeMap<StoragePath, Entry>>> {
        self.storage
            .read()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<StoragePath, Entry>>> {
        self.storage
            .write()
            .map_err(|_| Error::Storage("Memory storage lock poisoned".to_string()))
    }

    /// Create every missing ancestor of `path` as a directory.
    fn ensure_parents(
        storage: &mut BTreeMap<StoragePath, Entry>,
        path: &StoragePath,
    ) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut current = path.parent();
        while let Some(dir) = current {
            current = dir.parent();
            ancestors.push(dir);
        }

        for dir in ancestors.into_iter().rev() {
            match storage.get(&dir) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(Error::InvalidInput(format!("Parent {} is a file", dir)));
                }
                None => {
                    let metadata = Self::directory_metadata(&dir);
                    storage.insert(dir, Entry::Directory { metadata });
                }
            }
        }

        Ok(())
    }

    fn file_metadata(path: &StoragePath, data: &Bytes, options: &WriteOptions) -> Metadata {
        Metadata {
            path: path.clone(),
            size: Some(data.len() as u64),
            is_directory: false,
            mime_type: options.mime_type.clone(),
            visibility: Some(options.visibility.unwrap_or(Visibility::Public)),
            modified: Some(options.modified.unwrap_or_else(Utc::now)),
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        Ok(self.read_lock()?.contains_key(path))
    }

    async fn read(&self, path: &StoragePath) -> Result<Bytes> {
        match self.read_lock()?.get(path) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => {
                Err(Error::InvalidInput("Cannot read a directory".to_string()))
            }
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn read_stream(&self, path: &StoragePath) -> Result<ByteStream> {
        let data = self.read(path).await?;
        Ok(stream_from_bytes(data))
    }

    async fn write(&self, path: &StoragePath, data: Bytes, options: &WriteOptions) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot write to the root".to_string()));
        }

        let mut storage = self.write_lock()?;
        if let Some(Entry::Directory { .. }) = storage.get(path) {
            return Err(Error::InvalidInput(format!("{} is a directory", path)));
        }
        Self::ensure_parents(&mut storage, path)?;

        let metadata = Self::file_metadata(path, &data, options);
        storage.insert(path.clone(), Entry::File { data, metadata });

        Ok(())
    }

    async fn write_stream(
        &self,
        path: &StoragePath,
        stream: ByteStream,
        options: &WriteOptions,
    ) -> Result<()> {
        let data = collect_stream(stream).await?;
        self.write(path, data, options).await
    }

    async fn delete(&self, path: &StoragePath) -> Result<()> {
        let mut storage = self.write_lock()?;

        match storage.get(path) {
            Some(Entry::File { .. }) => {
                storage.remove(path);
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(Error::InvalidInput(
                "Use delete_dir for directories".to_string(),
            )),
            None => Ok(()),
        }
    }

    async fn delete_dir(&self, path: &StoragePath) -> Result<()> {
        let mut storage = self.write_lock()?;

        match storage.get(path) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            None => return Ok(()),
        }

        storage.retain(|key, _| !key.starts_with(path) || key.is_root());
        Ok(())
    }

    async fn metadata(&self, path: &StoragePath) -> Result<Metadata> {
        self.read_lock()?
            .get(path)
            .map(|entry| entry.metadata().clone())
            .ok_or_else(|| Error::NotFound(format!("Path not found: {}", path)))
    }

    async fn list(&self, path: &StoragePath, recursive: bool) -> Result<Vec<Metadata>> {
        let storage = self.read_lock()?;

        // Verify path is a directory
        match storage.get(path) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => {
                return Err(Error::InvalidInput("Not a directory".to_string()));
            }
            None => {
                return Err(Error::NotFound(format!("Directory not found: {}", path)));
            }
        }

        let depth = path.components().len();
        let results = storage
            .iter()
            .filter(|(key, _)| *key != path && key.starts_with(path))
            .filter(|(key, _)| recursive || key.components().len() == depth + 1)
            .map(|(_, entry)| entry.metadata().clone())
            .collect();

        Ok(results)
    }

    async fn create_dir(&self, path: &StoragePath) -> Result<()> {
        let mut storage = self.write_lock()?;

        match storage.get(path) {
            Some(Entry::Directory { .. }) => return Ok(()),
            Some(Entry::File { .. }) => {
                return Err(Error::AlreadyExists(format!(
                    "A file already exists at {}",
                    path
                )));
            }
            None => {}
        }

        Self::ensure_parents(&mut storage, path)?;
        storage.insert(
            path.clone(),
            Entry::Directory {
                metadata: Self::directory_metadata(path),
            },
        );

        Ok(())
    }

    async fn set_visibility(&self, path: &StoragePath, visibility: Visibility) -> Result<()> {
        let mut storage = self.write_lock()?;

        match storage.get_mut(path) {
            Some(Entry::File { metadata, .. }) => {
                metadata.visibility = Some(visibility);
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(Error::InvalidInput(
                "Visibility applies to files only".to_string(),
            )),
            None => Err(Error::NotFound(format!("File not found: {}", path))),
        }
    }

    async fn rename(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let mut storage = self.write_lock()?;

        if storage.contains_key(to) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        match storage.get(from) {
            Some(Entry::File { .. }) => {}
            Some(Entry::Directory { .. }) => {
                return Err(Error::InvalidInput(
                    "Only files can be renamed".to_string(),
                ));
            }
            None => return Err(Error::NotFound(format!("Source not found: {}", from))),
        }

        Self::ensure_parents(&mut storage, to)?;
        if let Some(Entry::File { data, mut metadata }) = storage.remove(from) {
            metadata.path = to.clone();
            metadata.modified = Some(Utc::now());
            storage.insert(to.clone(), Entry::File { data, metadata });
        }

        Ok(())
    }

    async fn copy(&self, from: &StoragePath, to: &StoragePath) -> Result<()> {
        let mut storage = self.write_lock()?;

        if storage.contains_key(to) {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to
            )));
        }

        let (data, mut metadata) = match storage.get(from) {
            Some(Entry::File { data, metadata }) => (data.clone(), metadata.clone()),
            Some(Entry::Directory { .. }) => {
                return Err(Error::InvalidInput("Only files can be copied".to_string()));
            }
            None => return Err(Error::NotFound(format!("Source not found: {}", from))),
        };

        Self::ensure_parents(&mut storage, to)?;
        metadata.path = to.clone();
        metadata.modified = Some(Utc::now());
        storage.insert(to.clone(), Entry::File { data, metadata });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn path(p: &str) -> StoragePath {
        StoragePath::parse(p).unwrap()
    }

    #[tokio::test]
    async fn test_write_read() {
        let provider = MemoryProvider::new();
        let data = Bytes::from_static(b"Hello, World!");

        provider
            .write(&path("/test.txt"), data.clone(), &WriteOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.read(&path("/test.txt")).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let provider = MemoryProvider::new();

        provider
            .write(&path("/a/b/c.txt"), Bytes::from_static(b"x"), &WriteOptions::default())
            .await
            .unwrap();

        assert!(provider.metadata(&path("/a/b")).await.unwrap().is_directory);
        assert!(provider.exists(&path("/a")).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_honours_explicit_modification_time() {
        let provider = MemoryProvider::new();
        let modified = Utc.timestamp_opt(20, 0).unwrap();

        provider
            .write(
                &path("/f"),
                Bytes::from_static(b"x"),
                &WriteOptions::default().with_modified(modified),
            )
            .await
            .unwrap();

        let metadata = provider.metadata(&path("/f")).await.unwrap();
        assert_eq!(metadata.modified, Some(modified));
        assert_eq!(metadata.size, Some(1));
        assert_eq!(metadata.visibility, Some(Visibility::Public));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let provider = MemoryProvider::new();
        let p = path("/test.txt");

        provider
            .write(&p, Bytes::from_static(&[1, 2, 3]), &WriteOptions::default())
            .await
            .unwrap();
        provider.delete(&p).await.unwrap();
        assert!(!provider.exists(&p).await.unwrap());

        provider.delete(&p).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_dir_is_recursive() {
        let provider = MemoryProvider::new();
        let opts = WriteOptions::default();

        provider.write(&path("/dir/a"), Bytes::new(), &opts).await.unwrap();
        provider.write(&path("/dir/sub/b"), Bytes::new(), &opts).await.unwrap();
        provider.write(&path("/dirty"), Bytes::new(), &opts).await.unwrap();

        provider.delete_dir(&path("/dir")).await.unwrap();

        assert!(!provider.exists(&path("/dir")).await.unwrap());
        assert!(!provider.exists(&path("/dir/sub/b")).await.unwrap());
        assert!(provider.exists(&path("/dirty")).await.unwrap());
        provider.delete_dir(&path("/dir")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_shallow_and_recursive() {
        let provider = MemoryProvider::new();
        let opts = WriteOptions::default();

        provider.write(&path("/dir/file1.txt"), Bytes::from_static(&[1]), &opts).await.unwrap();
        provider.write(&path("/dir/file2.txt"), Bytes::from_static(&[2]), &opts).await.unwrap();
        provider.write(&path("/dir/sub/file3.txt"), Bytes::from_static(&[3]), &opts).await.unwrap();

        let shallow = provider.list(&path("/dir"), false).await.unwrap();
        assert_eq!(shallow.len(), 3);

        let deep = provider.list(&StoragePath::root(), true).await.unwrap();
        let files: Vec<String> = deep
            .iter()
            .filter(|m| m.is_file())
            .map(|m| m.path.to_string())
            .collect();
        assert_eq!(
            files,
            vec!["/dir/file1.txt", "/dir/file2.txt", "/dir/sub/file3.txt"]
        );
    }

    #[tokio::test]
    async fn test_rename_and_copy() {
        let provider = MemoryProvider::new();
        let opts = WriteOptions::default();
        provider.write(&path("/old.txt"), Bytes::from_static(&[1, 2, 3]), &opts).await.unwrap();

        provider.rename(&path("/old.txt"), &path("/new.txt")).await.unwrap();
        assert!(!provider.exists(&path("/old.txt")).await.unwrap());

        provider.copy(&path("/new.txt"), &path("/copy/new.txt")).await.unwrap();
        assert_eq!(
            provider.read(&path("/copy/new.txt")).await.unwrap(),
            Bytes::from_static(&[1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_set_visibility() {
        let provider = MemoryProvider::new();
        provider
            .write(&path("/f"), Bytes::new(), &WriteOptions::default())
            .await
            .unwrap();

        provider.set_visibility(&path("/f"), Visibility::Private).await.unwrap();

        let metadata = provider.metadata(&path("/f")).await.unwrap();
        assert_eq!(metadata.visibility, Some(Visibility::Private));
    }
}
