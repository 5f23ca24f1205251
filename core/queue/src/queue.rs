//! Queue trait and the types shared by its implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::backoff::Backoff;
use crate::message::ReplicationMessage;
use strata_common::{Error, Result, StorageName};

/// Default page size of [`FindCriteria`].
pub const DEFAULT_LIMIT: usize = 30;
/// Default page of [`FindCriteria`] (pages start at 1).
pub const DEFAULT_PAGE: usize = 1;

/// A message as stored in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: i64,
    pub message: ReplicationMessage,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

/// What `push` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The message was stored.
    Enqueued,
    /// A pending message with the same identity already exists.
    Duplicate,
    /// The message exceeded the retry ceiling and was dropped.
    Discarded,
}

/// Scheduling rules applied on push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuePolicy {
    pub backoff: Backoff,
    /// Messages retried more often than this are dropped. `None` keeps
    /// retrying forever.
    pub max_retry_count: Option<u32>,
}

impl QueuePolicy {
    pub fn with_max_retry_count(mut self, max_retry_count: Option<u32>) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    /// Whether `message` is still allowed in the queue. Logs dropped messages.
    pub fn admits(&self, message: &ReplicationMessage) -> bool {
        match self.max_retry_count {
            Some(max) if message.retry_count() > max => {
                warn!(
                    "Discarding message after {} retries: {}",
                    message.retry_count(),
                    message
                );
                false
            }
            _ => true,
        }
    }
}

/// Paginated listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCriteria {
    /// Only list messages of this storage.
    pub storage: Option<StorageName>,
    pub limit: usize,
    /// 1-based page number.
    pub page: usize,
}

impl FindCriteria {
    pub fn new() -> Self {
        Self {
            storage: None,
            limit: DEFAULT_LIMIT,
            page: DEFAULT_PAGE,
        }
    }

    pub fn with_storage(mut self, storage: StorageName) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    /// Number of items before the requested page.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    /// # Errors
    /// - Limit or page is zero
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::InvalidInput("Limit must be at least 1".to_string()));
        }
        if self.page == 0 {
            return Err(Error::InvalidInput("Page must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for FindCriteria {
    fn default() -> Self {
        Self::new()
    }
}

/// One page of queued messages.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResults {
    pub limit: usize,
    /// Number of messages matching the criteria, across all pages.
    pub total: usize,
    pub page: usize,
    pub items: Vec<QueuedMessage>,
}

impl FindResults {
    /// Empty page for `criteria`.
    pub fn empty(criteria: &FindCriteria) -> Self {
        Self {
            limit: criteria.limit,
            total: 0,
            page: criteria.page,
            items: Vec::new(),
        }
    }

    /// 1-based position of the first item of this page.
    pub fn first_item_number(&self) -> usize {
        self.page.saturating_sub(1) * self.limit + 1
    }

    /// 1-based position of the last item of this page.
    pub fn last_item_number(&self) -> usize {
        (self.first_item_number() + self.items.len()).saturating_sub(1)
    }

    pub fn total_pages(&self) -> usize {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(self.limit)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Durable store of pending replication messages.
///
/// Implementations must guarantee that a popped message is never handed out
/// twice, even to concurrent consumers.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Store a message unless a pending one with the same identity exists.
    async fn push(&self, message: ReplicationMessage) -> Result<PushOutcome>;

    /// Remove and return the oldest available message.
    async fn pop(&self) -> Result<Option<QueuedMessage>>;

    /// List pending messages without removing them.
    ///
    /// # Errors
    /// - Invalid criteria
    async fn find_by(&self, criteria: &FindCriteria) -> Result<FindResults>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::StoragePath;

    fn results(total: usize, page: usize, items: usize) -> FindResults {
        let message = ReplicationMessage::delete_file(
            StorageName::new("default").unwrap(),
            StoragePath::parse("/a").unwrap(),
            1,
        );
        let now = Utc::now();
        FindResults {
            limit: 10,
            total,
            page,
            items: (0..items)
                .map(|id| QueuedMessage {
                    id: id as i64,
                    message: message.clone(),
                    created_at: now,
                    available_at: now,
                })
                .collect(),
        }
    }

    #[test]
    fn test_criteria_defaults() {
        let criteria = FindCriteria::default();
        assert_eq!(criteria.limit, 30);
        assert_eq!(criteria.page, 1);
        assert_eq!(criteria.offset(), 0);
        assert_eq!(criteria.with_page(3).offset(), 60);
    }

    #[test]
    fn test_criteria_validation() {
        assert!(FindCriteria::new().validate().is_ok());
        assert!(FindCriteria::new().with_limit(0).validate().is_err());
        assert!(FindCriteria::new().with_page(0).validate().is_err());
    }

    #[test]
    fn test_page_numbers() {
        let page = results(25, 3, 5);
        assert_eq!(page.first_item_number(), 21);
        assert_eq!(page.last_item_number(), 25);
        assert_eq!(page.total_pages(), 3);

        let empty = results(0, 1, 0);
        assert_eq!(empty.total_pages(), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_policy_retry_ceiling() {
        let message = ReplicationMessage::delete_file(
            StorageName::new("default").unwrap(),
            StoragePath::parse("/a").unwrap(),
            1,
        );
        let retried = message.with_incremented_retry().with_incremented_retry();

        assert!(QueuePolicy::default().admits(&retried));
        let capped = QueuePolicy::default().with_max_retry_count(Some(1));
        assert!(capped.admits(&message));
        assert!(!capped.admits(&retried));
    }
}
