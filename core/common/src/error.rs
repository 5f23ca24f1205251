//! Common error types for Strata.

use thiserror::Error;

/// Top-level error type for Strata operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage backend failed to perform an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Every backend of a logical storage failed a read-family operation.
    #[error("Unable to {operation} \"{path}\": no backend is available")]
    Unavailable { operation: String, path: String },

    /// No backend of a logical storage accepted a write.
    #[error("Unable to write \"{path}\": every backend rejected the write")]
    WriteFailed { path: String },

    /// The operation cannot be performed by a failover storage.
    #[error("Operation \"{operation}\" is not supported by failover storages")]
    Unsupported { operation: String },

    /// No logical storage is registered under this name.
    #[error("Unable to find failover storage \"{name}\"")]
    StorageNotFound { name: String },

    /// The logical storage has no backend at this ordinal.
    #[error("Failover storage \"{storage}\" has no backend {index}")]
    BackendNotFound { storage: String, index: usize },

    /// The replication queue store failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Whether the error comes from a misconfiguration rather than a
    /// transient failure. Such errors are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::StorageNotFound { .. }
                | Error::BackendNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        assert!(Error::Configuration("bad".to_string()).is_configuration());
        assert!(Error::StorageNotFound {
            name: "default".to_string()
        }
        .is_configuration());
        assert!(Error::BackendNotFound {
            storage: "default".to_string(),
            index: 3
        }
        .is_configuration());
        assert!(!Error::Storage("boom".to_string()).is_configuration());
    }

    #[test]
    fn test_unavailable_message_names_operation_and_path() {
        let err = Error::Unavailable {
            operation: "read".to_string(),
            path: "/a.txt".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unable to read \"/a.txt\": no backend is available"
        );
    }
}
