//! Backend handles.

use std::fmt;
use std::sync::Arc;

use strata_storage::StorageProvider;

/// One physical backend of a failover storage.
///
/// The index is the backend's priority within its storage: backend 0 is the
/// primary and is always tried first.
#[derive(Clone)]
pub struct Backend {
    index: usize,
    provider: Arc<dyn StorageProvider>,
    time_shift: i64,
}

impl Backend {
    pub fn new(index: usize, provider: Arc<dyn StorageProvider>, time_shift: i64) -> Self {
        Self {
            index,
            provider,
            time_shift,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Seconds to subtract from modification times reported by this backend
    /// before comparing them with other backends.
    pub fn time_shift(&self) -> i64 {
        self.time_shift
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("index", &self.index)
            .field("provider", &self.provider.name())
            .field("time_shift", &self.time_shift)
            .finish()
    }
}
