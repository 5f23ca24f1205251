//! SQLite-backed message queue.
//!
//! Messages live in a single table. The table is created lazily the first
//! time a push finds it missing, so pointing the queue at an existing
//! database never touches anything but its own table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::message::{MessageKind, ReplicationMessage};
use crate::queue::{
    FindCriteria, FindResults, MessageQueue, PushOutcome, QueuePolicy, QueuedMessage,
};
use strata_common::{Error, Result, StorageName, StoragePath};

/// Table used when none is configured.
pub const DEFAULT_TABLE_NAME: &str = "strata_failover_messages";

/// Attempts made by `pop` when the database is busy.
const POP_RETRY_COUNT: u32 = 10;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLUMNS: &str =
    "id, storage, action, path, source, destination, retry_count, created_at, available_at";

/// Queue persisted in a SQLite database.
///
/// Several processes may consume the same database: a message is only
/// returned by the `pop` whose delete removed it.
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
    policy: QueuePolicy,
}

/// Row as stored, before validation.
struct StoredRow {
    id: i64,
    storage: String,
    action: String,
    path: String,
    source: Option<i64>,
    destination: i64,
    retry_count: i64,
    created_at: i64,
    available_at: i64,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            storage: row.get(1)?,
            action: row.get(2)?,
            path: row.get(3)?,
            source: row.get(4)?,
            destination: row.get(5)?,
            retry_count: row.get(6)?,
            created_at: row.get(7)?,
            available_at: row.get(8)?,
        })
    }

    fn into_queued(self) -> Result<QueuedMessage> {
        let kind: MessageKind = self.action.parse()?;
        let source = self.source.map(to_index).transpose()?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| Error::Queue(format!("Invalid retry count {}", self.retry_count)))?;

        let message = ReplicationMessage::from_parts(
            kind,
            StorageName::new(self.storage)?,
            StoragePath::parse(&self.path)?,
            source,
            to_index(self.destination)?,
            retry_count,
        )?;

        Ok(QueuedMessage {
            id: self.id,
            message,
            created_at: from_millis(self.created_at)?,
            available_at: from_millis(self.available_at)?,
        })
    }
}

impl SqliteQueue {
    /// Open (or create) a queue database.
    ///
    /// # Errors
    /// - Database cannot be opened
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sql_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::from(DEFAULT_TABLE_NAME),
            policy: QueuePolicy::default(),
        })
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Store messages in `table_name` instead of the default table.
    ///
    /// # Errors
    /// - Name is not a plain SQL identifier
    pub fn with_table_name(mut self, table_name: &str) -> Result<Self> {
        validate_table_name(table_name)?;
        self.table = Arc::from(table_name);
        Ok(self)
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the queue table and its indexes if they are missing.
    pub async fn setup(&self) -> Result<()> {
        self.with_connection(|conn, table| create_schema(conn, table).map_err(sql_error))
            .await
    }

    /// Run blocking database work off the async runtime.
    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| Error::Queue("Queue connection lock poisoned".to_string()))?;
            work(&mut conn, &table)
        })
        .await
        .map_err(|e| Error::Queue(format!("Queue task failed: {}", e)))?
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn push(&self, message: ReplicationMessage) -> Result<PushOutcome> {
        if !self.policy.admits(&message) {
            return Ok(PushOutcome::Discarded);
        }

        let now = Utc::now();
        let available_at = self.policy.backoff.available_at(now, message.retry_count());

        self.with_connection(move |conn, table| {
            let result = match insert(conn, table, &message, now, available_at) {
                Err(e) if is_missing_table(&e) => {
                    info!("Creating queue table {}", table);
                    create_schema(conn, table).map_err(sql_error)?;
                    insert(conn, table, &message, now, available_at)
                }
                other => other,
            };

            let outcome = result.map_err(sql_error)?;
            if outcome == PushOutcome::Duplicate {
                debug!("Skipping duplicate message: {}", message);
            }
            Ok(outcome)
        })
        .await
    }

    async fn pop(&self) -> Result<Option<QueuedMessage>> {
        let now = to_millis(Utc::now());

        let row = self
            .with_connection(move |conn, table| {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match take_next(conn, table, now) {
                        Ok(row) => return Ok(row),
                        Err(e) if is_missing_table(&e) => return Ok(None),
                        Err(e) if is_busy(&e) && attempt < POP_RETRY_COUNT => {
                            debug!("Queue busy on pop attempt {}: {}", attempt, e);
                        }
                        Err(e) => return Err(sql_error(e)),
                    }
                }
            })
            .await?;

        match row {
            Some(row) => {
                let id = row.id;
                row.into_queued().map(Some).map_err(|e| {
                    warn!("Dropped unreadable queue record {}: {}", id, e);
                    e
                })
            }
            None => Ok(None),
        }
    }

    async fn find_by(&self, criteria: &FindCriteria) -> Result<FindResults> {
        criteria.validate()?;

        let storage = criteria.storage.as_ref().map(|s| s.as_str().to_string());
        let limit = i64::try_from(criteria.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(criteria.offset()).unwrap_or(i64::MAX);

        let fetched = self
            .with_connection(move |conn, table| {
                match select_page(conn, table, storage.as_deref(), limit, offset) {
                    Ok(page) => Ok(Some(page)),
                    Err(e) if is_missing_table(&e) => Ok(None),
                    Err(e) => Err(sql_error(e)),
                }
            })
            .await?;

        let Some((total, rows)) = fetched else {
            return Ok(FindResults::empty(criteria));
        };

        Ok(FindResults {
            limit: criteria.limit,
            total,
            page: criteria.page,
            items: rows
                .into_iter()
                .map(StoredRow::into_queued)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

fn create_schema(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            storage TEXT NOT NULL,
            action TEXT NOT NULL,
            path TEXT NOT NULL,
            source INTEGER,
            destination INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            available_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_{table}_available_at ON {table}(available_at);
        CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table}(created_at);
        "#
    ))
}

fn insert(
    conn: &mut Connection,
    table: &str,
    message: &ReplicationMessage,
    created_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
) -> rusqlite::Result<PushOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let storage = message.storage().as_str();
    let action = message.kind().as_str();
    let path = message.path().to_string();
    let source = message.source().map(|s| s as i64);
    let destination = message.destination() as i64;

    let exists = tx
        .query_row(
            &format!(
                "SELECT 1 FROM {table} WHERE storage = ?1 AND action = ?2 AND path = ?3 \
                 AND source IS ?4 AND destination = ?5 LIMIT 1"
            ),
            params![storage, action, path, source, destination],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        return Ok(PushOutcome::Duplicate);
    }

    tx.execute(
        &format!(
            "INSERT INTO {table} \
             (storage, action, path, source, destination, retry_count, created_at, available_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            storage,
            action,
            path,
            source,
            destination,
            message.retry_count(),
            to_millis(created_at),
            to_millis(available_at),
        ],
    )?;
    tx.commit()?;

    Ok(PushOutcome::Enqueued)
}

fn take_next(conn: &mut Connection, table: &str, now: i64) -> rusqlite::Result<Option<StoredRow>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let row = tx
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM {table} WHERE available_at <= ?1 \
                 ORDER BY created_at ASC, available_at ASC, id ASC LIMIT 1"
            ),
            [now],
            StoredRow::from_row,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let deleted = tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [row.id])?;
    tx.commit()?;

    // Only the consumer that removed the row may process it.
    Ok(if deleted == 1 { Some(row) } else { None })
}

fn select_page(
    conn: &Connection,
    table: &str,
    storage: Option<&str>,
    limit: i64,
    offset: i64,
) -> rusqlite::Result<(usize, Vec<StoredRow>)> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE (?1 IS NULL OR storage = ?1)"),
        params![storage],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM {table} WHERE (?1 IS NULL OR storage = ?1) \
         ORDER BY available_at ASC, created_at ASC, id ASC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(params![storage, limit, offset], StoredRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((usize::try_from(total).unwrap_or(0), rows))
}

fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > 64 {
        return Err(Error::Configuration(format!(
            "Invalid queue table name \"{}\"",
            name
        )));
    }
    Ok(())
}

fn is_missing_table(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("no such table")
    )
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn sql_error(error: rusqlite::Error) -> Error {
    Error::Queue(error.to_string())
}

fn to_index(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Queue(format!("Invalid backend index {}", value)))
}

fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Queue(format!("Invalid timestamp {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn replicate(storage: &str, path: &str, source: usize, destination: usize) -> ReplicationMessage {
        ReplicationMessage::replicate_file(
            StorageName::new(storage).unwrap(),
            StoragePath::parse(path).unwrap(),
            source,
            destination,
        )
    }

    fn delete(path: &str, destination: usize) -> ReplicationMessage {
        ReplicationMessage::delete_file(
            StorageName::new("default").unwrap(),
            StoragePath::parse(path).unwrap(),
            destination,
        )
    }

    #[tokio::test]
    async fn test_missing_table_reads_as_empty() {
        let queue = SqliteQueue::in_memory().unwrap();

        assert!(queue.pop().await.unwrap().is_none());
        let page = queue.find_by(&FindCriteria::new()).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_push_creates_table_lazily() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("queue.db");
        let queue = SqliteQueue::open(&db_path).unwrap();

        assert_eq!(
            queue.push(replicate("default", "/a", 0, 1)).await.unwrap(),
            PushOutcome::Enqueued
        );

        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", DEFAULT_TABLE_NAME),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_lazy_schema_leaves_other_tables_alone() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("app.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY); INSERT INTO users VALUES (7);")
                .unwrap();
        }

        let queue = SqliteQueue::open(&db_path).unwrap();
        queue.push(delete("/a", 1)).await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let id: i64 = conn
            .query_row("SELECT id FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn test_duplicate_push_keeps_one_record() {
        let queue = SqliteQueue::in_memory().unwrap();
        let message = replicate("default", "/a", 0, 1);

        queue.push(message.clone()).await.unwrap();
        assert_eq!(queue.push(message.clone()).await.unwrap(), PushOutcome::Duplicate);
        assert_eq!(
            queue.push(message.with_incremented_retry()).await.unwrap(),
            PushOutcome::Duplicate
        );
        // Different source, different identity.
        assert_eq!(
            queue.push(replicate("default", "/a", 2, 1)).await.unwrap(),
            PushOutcome::Enqueued
        );

        let page = queue.find_by(&FindCriteria::new()).await.unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_delete_messages_deduplicate_without_source() {
        let queue = SqliteQueue::in_memory().unwrap();

        queue.push(delete("/a", 1)).await.unwrap();
        assert_eq!(queue.push(delete("/a", 1)).await.unwrap(), PushOutcome::Duplicate);
        assert_eq!(queue.push(delete("/a", 2)).await.unwrap(), PushOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_pop_removes_and_round_trips() {
        let queue = SqliteQueue::in_memory().unwrap();
        let message = replicate("default", "/dir/a.txt", 0, 2);
        queue.push(message.clone()).await.unwrap();
        queue.push(delete("/b", 1)).await.unwrap();

        let first = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.message, message);

        let second = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.message, delete("/b", 1));
        assert_ne!(first.id, second.id);

        assert!(queue.pop().await.unwrap().is_none());
        assert_eq!(queue.find_by(&FindCriteria::new()).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_retried_message_waits_for_backoff() {
        let queue = SqliteQueue::in_memory().unwrap();
        let retried = delete("/a", 1)
            .with_incremented_retry()
            .with_incremented_retry()
            .with_incremented_retry();

        queue.push(retried).await.unwrap();
        assert!(queue.pop().await.unwrap().is_none());

        let page = queue.find_by(&FindCriteria::new()).await.unwrap();
        let record = &page.items[0];
        assert_eq!(record.message.retry_count(), 3);
        assert_eq!(
            record.available_at - record.created_at,
            chrono::Duration::seconds(8)
        );
    }

    #[tokio::test]
    async fn test_concurrent_consumers_never_share_a_message() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("queue.db");
        let producer = SqliteQueue::open(&db_path).unwrap();
        for i in 0..20 {
            producer
                .push(delete(&format!("/f{}", i), 1))
                .await
                .unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = SqliteQueue::open(&db_path).unwrap();
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    while let Some(record) = queue.pop().await.unwrap() {
                        ids.push(record.id);
                    }
                    ids
                })
            })
            .collect();

        let mut ids = Vec::new();
        for consumer in consumers {
            ids.extend(consumer.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn test_find_by_filters_and_paginates() {
        let queue = SqliteQueue::in_memory().unwrap();
        for i in 0..5 {
            queue
                .push(replicate("default", &format!("/f{}", i), 0, 1))
                .await
                .unwrap();
        }
        queue.push(replicate("media", "/m", 0, 1)).await.unwrap();

        let criteria = FindCriteria::new()
            .with_storage(StorageName::new("default").unwrap())
            .with_limit(2)
            .with_page(2);
        let page = queue.find_by(&criteria).await.unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.first_item_number(), 3);
        let paths: Vec<String> = page
            .items
            .iter()
            .map(|r| r.message.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/f2", "/f3"]);

        let all = queue.find_by(&FindCriteria::new()).await.unwrap();
        assert_eq!(all.total, 6);
    }

    #[tokio::test]
    async fn test_custom_table_name() {
        let queue = SqliteQueue::in_memory()
            .unwrap()
            .with_table_name("replication_queue")
            .unwrap();
        queue.setup().await.unwrap();
        queue.push(delete("/a", 1)).await.unwrap();

        assert_eq!(queue.table_name(), "replication_queue");
        assert!(queue.pop().await.unwrap().is_some());
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("strata_failover_messages").is_ok());
        assert!(validate_table_name("_queue2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2queue").is_err());
        assert!(validate_table_name("queue; DROP TABLE users").is_err());
    }
}
