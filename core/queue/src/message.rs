//! Replication messages.
//!
//! A message describes one pending cross-backend action for a logical
//! storage. Messages are immutable: retrying one means pushing a copy with an
//! incremented retry counter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use strata_common::{Error, Result, StorageName, StoragePath};

/// Kind of a replication message, as stored in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ReplicateFile,
    DeleteFile,
    DeleteDirectory,
}

impl MessageKind {
    /// Every kind, in declaration order.
    pub const ALL: [MessageKind; 3] = [
        MessageKind::ReplicateFile,
        MessageKind::DeleteFile,
        MessageKind::DeleteDirectory,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::ReplicateFile => "replicate_file",
            MessageKind::DeleteFile => "delete_file",
            MessageKind::DeleteDirectory => "delete_directory",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::Queue(format!("Unknown message kind \"{}\"", s)))
    }
}

/// A pending cross-backend action.
///
/// Backends are addressed by their ordinal within the logical storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// Copy `path` from backend `source` to backend `destination`.
    ReplicateFile {
        storage: StorageName,
        path: StoragePath,
        source: usize,
        destination: usize,
        retry_count: u32,
    },
    /// Delete the file at `path` on backend `destination`.
    DeleteFile {
        storage: StorageName,
        path: StoragePath,
        destination: usize,
        retry_count: u32,
    },
    /// Delete the directory at `path` on backend `destination`.
    DeleteDirectory {
        storage: StorageName,
        path: StoragePath,
        destination: usize,
        retry_count: u32,
    },
}

/// Deduplication key of a message. The retry counter is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageIdentity {
    pub storage: StorageName,
    pub kind: MessageKind,
    pub path: StoragePath,
    pub source: Option<usize>,
    pub destination: usize,
}

impl ReplicationMessage {
    pub fn replicate_file(
        storage: StorageName,
        path: StoragePath,
        source: usize,
        destination: usize,
    ) -> Self {
        ReplicationMessage::ReplicateFile {
            storage,
            path,
            source,
            destination,
            retry_count: 0,
        }
    }

    pub fn delete_file(storage: StorageName, path: StoragePath, destination: usize) -> Self {
        ReplicationMessage::DeleteFile {
            storage,
            path,
            destination,
            retry_count: 0,
        }
    }

    pub fn delete_directory(storage: StorageName, path: StoragePath, destination: usize) -> Self {
        ReplicationMessage::DeleteDirectory {
            storage,
            path,
            destination,
            retry_count: 0,
        }
    }

    /// Rebuild a message from its stored columns.
    ///
    /// # Errors
    /// - `ReplicateFile` without a source backend
    pub fn from_parts(
        kind: MessageKind,
        storage: StorageName,
        path: StoragePath,
        source: Option<usize>,
        destination: usize,
        retry_count: u32,
    ) -> Result<Self> {
        Ok(match kind {
            MessageKind::ReplicateFile => {
                let source = source.ok_or_else(|| {
                    Error::Queue(format!(
                        "Replication of {} for storage \"{}\" has no source backend",
                        path, storage
                    ))
                })?;
                ReplicationMessage::ReplicateFile {
                    storage,
                    path,
                    source,
                    destination,
                    retry_count,
                }
            }
            MessageKind::DeleteFile => ReplicationMessage::DeleteFile {
                storage,
                path,
                destination,
                retry_count,
            },
            MessageKind::DeleteDirectory => ReplicationMessage::DeleteDirectory {
                storage,
                path,
                destination,
                retry_count,
            },
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ReplicationMessage::ReplicateFile { .. } => MessageKind::ReplicateFile,
            ReplicationMessage::DeleteFile { .. } => MessageKind::DeleteFile,
            ReplicationMessage::DeleteDirectory { .. } => MessageKind::DeleteDirectory,
        }
    }

    pub fn storage(&self) -> &StorageName {
        match self {
            ReplicationMessage::ReplicateFile { storage, .. }
            | ReplicationMessage::DeleteFile { storage, .. }
            | ReplicationMessage::DeleteDirectory { storage, .. } => storage,
        }
    }

    pub fn path(&self) -> &StoragePath {
        match self {
            ReplicationMessage::ReplicateFile { path, .. }
            | ReplicationMessage::DeleteFile { path, .. }
            | ReplicationMessage::DeleteDirectory { path, .. } => path,
        }
    }

    /// Source backend, only set for replications.
    pub fn source(&self) -> Option<usize> {
        match self {
            ReplicationMessage::ReplicateFile { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn destination(&self) -> usize {
        match self {
            ReplicationMessage::ReplicateFile { destination, .. }
            | ReplicationMessage::DeleteFile { destination, .. }
            | ReplicationMessage::DeleteDirectory { destination, .. } => *destination,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            ReplicationMessage::ReplicateFile { retry_count, .. }
            | ReplicationMessage::DeleteFile { retry_count, .. }
            | ReplicationMessage::DeleteDirectory { retry_count, .. } => *retry_count,
        }
    }

    /// Copy of this message scheduled as the next retry.
    pub fn with_incremented_retry(&self) -> Self {
        let mut next = self.clone();
        match &mut next {
            ReplicationMessage::ReplicateFile { retry_count, .. }
            | ReplicationMessage::DeleteFile { retry_count, .. }
            | ReplicationMessage::DeleteDirectory { retry_count, .. } => {
                *retry_count = retry_count.saturating_add(1);
            }
        }
        next
    }

    pub fn identity(&self) -> MessageIdentity {
        MessageIdentity {
            storage: self.storage().clone(),
            kind: self.kind(),
            path: self.path().clone(),
            source: self.source(),
            destination: self.destination(),
        }
    }
}

impl fmt::Display for ReplicationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationMessage::ReplicateFile {
                storage,
                path,
                source,
                destination,
                ..
            } => write!(
                f,
                "For storage \"{}\", replicate file \"{}\" from backend {} to {}.",
                storage, path, source, destination
            ),
            ReplicationMessage::DeleteFile {
                storage,
                path,
                destination,
                ..
            } => write!(
                f,
                "For storage \"{}\", delete file \"{}\" on backend {}.",
                storage, path, destination
            ),
            ReplicationMessage::DeleteDirectory {
                storage,
                path,
                destination,
                ..
            } => write!(
                f,
                "For storage \"{}\", delete directory \"{}\" on backend {}.",
                storage, path, destination
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> StorageName {
        StorageName::new("default").unwrap()
    }

    fn path(p: &str) -> StoragePath {
        StoragePath::parse(p).unwrap()
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert_eq!(MessageKind::DeleteDirectory.to_string(), "delete_directory");
        assert!("move_file".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_display() {
        let message = ReplicationMessage::replicate_file(storage(), path("/a"), 0, 1);
        assert_eq!(
            message.to_string(),
            "For storage \"default\", replicate file \"/a\" from backend 0 to 1."
        );

        let message = ReplicationMessage::delete_directory(storage(), path("/dir"), 2);
        assert_eq!(
            message.to_string(),
            "For storage \"default\", delete directory \"/dir\" on backend 2."
        );
    }

    #[test]
    fn test_incremented_retry_keeps_identity() {
        let message = ReplicationMessage::delete_file(storage(), path("/a"), 1);
        let retried = message.with_incremented_retry().with_incremented_retry();

        assert_eq!(message.retry_count(), 0);
        assert_eq!(retried.retry_count(), 2);
        assert_eq!(retried.identity(), message.identity());
        assert_ne!(retried, message);
    }

    #[test]
    fn test_identity_distinguishes_kind_and_backends() {
        let replicate = ReplicationMessage::replicate_file(storage(), path("/a"), 0, 1);
        let other_source = ReplicationMessage::replicate_file(storage(), path("/a"), 2, 1);
        let delete = ReplicationMessage::delete_file(storage(), path("/a"), 1);

        assert_ne!(replicate.identity(), other_source.identity());
        assert_ne!(replicate.identity(), delete.identity());
    }

    #[test]
    fn test_from_parts_requires_source_for_replication() {
        let result = ReplicationMessage::from_parts(
            MessageKind::ReplicateFile,
            storage(),
            path("/a"),
            None,
            1,
            0,
        );
        assert!(result.is_err());

        let message = ReplicationMessage::from_parts(
            MessageKind::DeleteFile,
            storage(),
            path("/a"),
            None,
            1,
            3,
        )
        .unwrap();
        assert_eq!(message.retry_count(), 3);
        assert_eq!(message.kind(), MessageKind::DeleteFile);
    }
}
