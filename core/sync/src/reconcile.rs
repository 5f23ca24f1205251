//! Reconciliation of the backends of a failover storage.
//!
//! A reconciliation lists every backend, compares the listings and queues the
//! replications (or deletions) that bring the backends back in line with the
//! primary. Nothing is copied synchronously: the queue worker applies the
//! queued messages afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use strata_common::{Error, Result, StorageName, StoragePath};
use strata_failover::{Backend, FailoverRegistry, FailoverStorage};
use strata_queue::{PushOutcome, ReplicationMessage};

/// What to do with files found on a secondary backend but missing (or
/// outdated) elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraFilesStrategy {
    /// Leave them alone.
    #[default]
    Ignore,
    /// Replicate them to the backends missing them.
    Copy,
    /// Delete them from the backend holding them.
    Delete,
}

impl ExtraFilesStrategy {
    pub const ALL: [ExtraFilesStrategy; 3] = [
        ExtraFilesStrategy::Ignore,
        ExtraFilesStrategy::Copy,
        ExtraFilesStrategy::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtraFilesStrategy::Ignore => "ignore",
            ExtraFilesStrategy::Copy => "copy",
            ExtraFilesStrategy::Delete => "delete",
        }
    }
}

impl fmt::Display for ExtraFilesStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtraFilesStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                let choices: Vec<&str> = Self::ALL.iter().map(|s| s.as_str()).collect();
                Error::Configuration(format!(
                    "Invalid extra files strategy \"{}\", expected one of: {}",
                    s,
                    choices.join(", ")
                ))
            })
    }
}

/// Options of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub extra_files: ExtraFilesStrategy,
    /// Only look for missing files, never compare modification times.
    pub ignore_modification_dates: bool,
}

/// Progress of a reconciliation run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ListingStarted { backend: usize },
    ListingSucceeded { backend: usize, files: usize },
    ListingFailed { backend: usize, error: String },
    SearchingStarted,
    BeforeDispatch { message: ReplicationMessage },
    Dispatched {
        message: ReplicationMessage,
        outcome: PushOutcome,
    },
}

/// Callback receiving [`SyncEvent`]s.
pub type SyncListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// How listing a backend went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOutcome {
    Listed { files: usize },
    /// The backend was treated as empty.
    Failed,
}

/// Per-backend counters of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReport {
    pub index: usize,
    pub listing: ListingOutcome,
    /// Replications queued with this backend as destination.
    pub replicated: usize,
    /// Deletions queued on this backend.
    pub deleted: usize,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub storage: StorageName,
    pub backends: Vec<BackendReport>,
}

impl SyncReport {
    pub fn total_replicated(&self) -> usize {
        self.backends.iter().map(|b| b.replicated).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.backends.iter().map(|b| b.deleted).sum()
    }
}

/// Path to skew-corrected modification time, in seconds.
type Snapshot = BTreeMap<StoragePath, i64>;

/// Compares the backends of failover storages and queues the fixes.
pub struct Reconciler {
    storages: Arc<FailoverRegistry>,
    listener: Option<SyncListener>,
}

impl Reconciler {
    pub fn new(storages: Arc<FailoverRegistry>) -> Self {
        Self {
            storages,
            listener: None,
        }
    }

    /// Receive progress events.
    pub fn with_listener(mut self, listener: SyncListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    /// Reconcile the backends of the storage called `storage_name`.
    ///
    /// Backend 0 is the reference: every file it holds is replicated to the
    /// backends where it is missing or older. Files only found on other
    /// backends are handled according to `options.extra_files`.
    ///
    /// # Errors
    /// - Unknown storage
    /// - Queue failure
    pub async fn sync(&self, storage_name: &str, options: &SyncOptions) -> Result<SyncReport> {
        let storage = self.storages.get(storage_name)?;
        info!(
            "Reconciling {} (extra files: {}, compare dates: {})",
            storage_name, options.extra_files, !options.ignore_modification_dates
        );

        let mut report = SyncReport {
            storage: storage.storage_name().clone(),
            backends: Vec::with_capacity(storage.backends().len()),
        };

        let mut snapshots = Vec::with_capacity(storage.backends().len());
        for backend in storage.backends() {
            let (snapshot, listing) = self.snapshot(backend).await;
            snapshots.push(snapshot);
            report.backends.push(BackendReport {
                index: backend.index(),
                listing,
                replicated: 0,
                deleted: 0,
            });
        }

        self.emit(SyncEvent::SearchingStarted);
        let ignore_dates = options.ignore_modification_dates;

        for (path, &time) in &snapshots[0] {
            for destination in missing_on(&snapshots, 0, path, time, ignore_dates) {
                let message = ReplicationMessage::replicate_file(
                    storage.storage_name().clone(),
                    path.clone(),
                    0,
                    destination,
                );
                self.dispatch(&storage, message).await?;
                report.backends[destination].replicated += 1;
            }
        }

        if options.extra_files != ExtraFilesStrategy::Ignore {
            for source in 1..snapshots.len() {
                for (path, &time) in &snapshots[source] {
                    let destinations = missing_on(&snapshots, source, path, time, ignore_dates);
                    if destinations.is_empty() {
                        continue;
                    }

                    if options.extra_files == ExtraFilesStrategy::Delete {
                        let message = ReplicationMessage::delete_file(
                            storage.storage_name().clone(),
                            path.clone(),
                            source,
                        );
                        self.dispatch(&storage, message).await?;
                        report.backends[source].deleted += 1;
                        // One deletion per backend and run.
                        break;
                    }

                    for destination in destinations {
                        let message = ReplicationMessage::replicate_file(
                            storage.storage_name().clone(),
                            path.clone(),
                            source,
                            destination,
                        );
                        self.dispatch(&storage, message).await?;
                        report.backends[destination].replicated += 1;
                    }
                }
            }
        }

        info!(
            "Reconciled {}: {} replications and {} deletions queued",
            storage_name,
            report.total_replicated(),
            report.total_deleted()
        );
        Ok(report)
    }

    /// List the files of `backend`. A failed listing yields an empty snapshot.
    async fn snapshot(&self, backend: &Backend) -> (Snapshot, ListingOutcome) {
        self.emit(SyncEvent::ListingStarted {
            backend: backend.index(),
        });

        match backend.provider().list(&StoragePath::root(), true).await {
            Ok(entries) => {
                let snapshot: Snapshot = entries
                    .into_iter()
                    .filter(|entry| entry.is_file())
                    .map(|entry| {
                        let time = entry
                            .modified
                            .map(|modified| {
                                modified.timestamp().saturating_sub(backend.time_shift())
                            })
                            .unwrap_or(0);
                        (entry.path, time)
                    })
                    .collect();

                debug!("Backend {} holds {} files", backend.index(), snapshot.len());
                self.emit(SyncEvent::ListingSucceeded {
                    backend: backend.index(),
                    files: snapshot.len(),
                });
                let files = snapshot.len();
                (snapshot, ListingOutcome::Listed { files })
            }
            Err(e) => {
                warn!("Unable to list backend {}: {}", backend.index(), e);
                self.emit(SyncEvent::ListingFailed {
                    backend: backend.index(),
                    error: e.to_string(),
                });
                (Snapshot::new(), ListingOutcome::Failed)
            }
        }
    }

    async fn dispatch(&self, storage: &FailoverStorage, message: ReplicationMessage) -> Result<()> {
        self.emit(SyncEvent::BeforeDispatch {
            message: message.clone(),
        });
        let outcome = storage.queue().push(message.clone()).await?;
        self.emit(SyncEvent::Dispatched { message, outcome });
        Ok(())
    }
}

/// Backends other than `source` where `path` is missing, or older than `time`.
fn missing_on(
    snapshots: &[Snapshot],
    source: usize,
    path: &StoragePath,
    time: i64,
    ignore_dates: bool,
) -> Vec<usize> {
    snapshots
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != source)
        .filter(|(_, snapshot)| match snapshot.get(path) {
            None => true,
            Some(&other) => !ignore_dates && time > other,
        })
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use strata_queue::InMemoryQueue;
    use strata_storage::testing::{FlakyProvider, Operation};
    use strata_storage::{MemoryProvider, StorageProvider, WriteOptions};

    struct Fixture {
        reconciler: Reconciler,
        backends: Vec<Arc<FlakyProvider>>,
        queue: Arc<InMemoryQueue>,
    }

    fn fixture(count: usize, time_shifts: &[i64]) -> Fixture {
        let backends: Vec<Arc<FlakyProvider>> = (0..count)
            .map(|i| {
                Arc::new(FlakyProvider::new(
                    format!("backend-{}", i),
                    Arc::new(MemoryProvider::new()),
                ))
            })
            .collect();
        let queue = Arc::new(InMemoryQueue::new());
        let storage = FailoverStorage::with_time_shifts(
            name(),
            backends
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    (
                        b.clone() as Arc<dyn StorageProvider>,
                        time_shifts.get(i).copied().unwrap_or(0),
                    )
                })
                .collect(),
            queue.clone(),
        )
        .unwrap();

        let mut registry = FailoverRegistry::new();
        registry.register(Arc::new(storage)).unwrap();

        Fixture {
            reconciler: Reconciler::new(Arc::new(registry)),
            backends,
            queue,
        }
    }

    fn name() -> StorageName {
        StorageName::new("default").unwrap()
    }

    fn path(p: &str) -> StoragePath {
        StoragePath::parse(p).unwrap()
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    async fn put(backend: &FlakyProvider, p: &str, modified: i64) {
        backend
            .inner()
            .write(
                &path(p),
                Bytes::from_static(b"x"),
                &WriteOptions::default().with_modified(at(modified)),
            )
            .await
            .unwrap();
    }

    fn replicate(p: &str, source: usize, destination: usize) -> ReplicationMessage {
        ReplicationMessage::replicate_file(name(), path(p), source, destination)
    }

    fn delete(p: &str, destination: usize) -> ReplicationMessage {
        ReplicationMessage::delete_file(name(), path(p), destination)
    }

    fn options(extra_files: ExtraFilesStrategy) -> SyncOptions {
        SyncOptions {
            extra_files,
            ignore_modification_dates: false,
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("copy".parse::<ExtraFilesStrategy>().unwrap(), ExtraFilesStrategy::Copy);
        assert_eq!(ExtraFilesStrategy::default(), ExtraFilesStrategy::Ignore);

        let err = "merge".parse::<ExtraFilesStrategy>().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("ignore, copy, delete"));
    }

    #[tokio::test]
    async fn test_primary_files_are_replicated_where_missing() {
        let f = fixture(3, &[]);
        put(&f.backends[0], "/file1", 10).await;
        put(&f.backends[0], "/file2", 10).await;
        put(&f.backends[1], "/file1", 10).await;

        let report = f
            .reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();

        assert_eq!(
            f.queue.drain().unwrap(),
            vec![
                replicate("/file1", 0, 2),
                replicate("/file2", 0, 1),
                replicate("/file2", 0, 2),
            ]
        );
        assert_eq!(report.backends[1].replicated, 1);
        assert_eq!(report.backends[2].replicated, 2);
        assert_eq!(report.total_replicated(), 3);
        assert_eq!(report.backends[0].listing, ListingOutcome::Listed { files: 2 });
    }

    #[tokio::test]
    async fn test_extreme_time_shift_saturates() {
        let f = fixture(2, &[0, i64::MIN]);
        put(&f.backends[0], "/file", 20).await;
        put(&f.backends[1], "/file", 10).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert!(f.queue.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_newer_primary_file_is_replicated() {
        let f = fixture(2, &[]);
        put(&f.backends[0], "/file", 20).await;
        put(&f.backends[1], "/file", 10).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert_eq!(f.queue.drain().unwrap(), vec![replicate("/file", 0, 1)]);
    }

    #[tokio::test]
    async fn test_older_or_equal_primary_file_is_left_alone() {
        let f = fixture(3, &[]);
        put(&f.backends[0], "/file", 20).await;
        put(&f.backends[1], "/file", 30).await;
        put(&f.backends[2], "/file", 20).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert!(f.queue.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ignore_modification_dates() {
        let f = fixture(2, &[]);
        put(&f.backends[0], "/file", 20).await;
        put(&f.backends[1], "/file", 10).await;

        let options = SyncOptions {
            extra_files: ExtraFilesStrategy::Ignore,
            ignore_modification_dates: true,
        };
        f.reconciler.sync("default", &options).await.unwrap();
        assert!(f.queue.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_time_shift_corrects_skew() {
        // Backend 1 runs an hour ahead.
        let f = fixture(2, &[0, 3600]);
        put(&f.backends[0], "/file", 1000).await;
        put(&f.backends[1], "/file", 3900).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert_eq!(f.queue.drain().unwrap(), vec![replicate("/file", 0, 1)]);
    }

    #[tokio::test]
    async fn test_extra_files_delete() {
        let f = fixture(3, &[]);
        put(&f.backends[1], "/file1", 10).await;
        put(&f.backends[1], "/file3", 10).await;
        put(&f.backends[2], "/file2", 10).await;

        let report = f
            .reconciler
            .sync("default", &options(ExtraFilesStrategy::Delete))
            .await
            .unwrap();

        assert_eq!(
            f.queue.drain().unwrap(),
            vec![delete("/file1", 1), delete("/file2", 2)]
        );
        assert_eq!(report.backends[1].deleted, 1);
        assert_eq!(report.total_deleted(), 2);
    }

    #[tokio::test]
    async fn test_extra_files_copy() {
        let f = fixture(3, &[]);
        put(&f.backends[1], "/file1", 10).await;
        put(&f.backends[2], "/file2", 10).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Copy))
            .await
            .unwrap();

        assert_eq!(
            f.queue.drain().unwrap(),
            vec![
                replicate("/file1", 1, 0),
                replicate("/file1", 1, 2),
                replicate("/file2", 2, 0),
                replicate("/file2", 2, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_extra_files_ignore() {
        let f = fixture(3, &[]);
        put(&f.backends[1], "/file1", 10).await;
        put(&f.backends[2], "/file2", 10).await;

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert!(f.queue.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_listing_counts_as_empty() {
        let f = fixture(2, &[]);
        put(&f.backends[0], "/file", 10).await;
        put(&f.backends[1], "/file", 10).await;
        f.backends[1].fail(Operation::List);

        let report = f
            .reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();

        assert_eq!(report.backends[1].listing, ListingOutcome::Failed);
        assert_eq!(f.queue.drain().unwrap(), vec![replicate("/file", 0, 1)]);
    }

    #[tokio::test]
    async fn test_directories_are_skipped() {
        let f = fixture(2, &[]);
        f.backends[0].inner().create_dir(&path("/empty")).await.unwrap();

        f.reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();
        assert!(f.queue.drain().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let f = fixture(2, &[]);
        let reconciler = f.reconciler.with_listener(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        put(&f.backends[0], "/file", 10).await;
        f.backends[1].fail(Operation::List);

        reconciler
            .sync("default", &options(ExtraFilesStrategy::Ignore))
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0], SyncEvent::ListingStarted { backend: 0 });
        assert_eq!(events[1], SyncEvent::ListingSucceeded { backend: 0, files: 1 });
        assert_eq!(events[2], SyncEvent::ListingStarted { backend: 1 });
        assert!(matches!(events[3], SyncEvent::ListingFailed { backend: 1, .. }));
        assert_eq!(events[4], SyncEvent::SearchingStarted);
        assert_eq!(
            events[5],
            SyncEvent::BeforeDispatch {
                message: replicate("/file", 0, 1)
            }
        );
        assert_eq!(
            events[6],
            SyncEvent::Dispatched {
                message: replicate("/file", 0, 1),
                outcome: PushOutcome::Enqueued,
            }
        );
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn test_unknown_storage() {
        let f = fixture(2, &[]);
        let err = f
            .reconciler
            .sync("missing", &SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageNotFound { .. }));
    }
}
