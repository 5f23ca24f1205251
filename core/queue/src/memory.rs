//! In-memory message queue.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::message::ReplicationMessage;
use crate::queue::{
    FindCriteria, FindResults, MessageQueue, PushOutcome, QueuePolicy, QueuedMessage,
};
use strata_common::{Error, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    records: Vec<QueuedMessage>,
}

/// Volatile queue with the same scheduling rules as the SQLite queue.
///
/// Suited to tests and to single-process setups where losing pending
/// replications on restart is acceptable.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    policy: QueuePolicy,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Remove every pending message, available or not, in insertion order.
    pub fn drain(&self) -> Result<Vec<ReplicationMessage>> {
        let mut state = self.lock()?;
        let mut records = std::mem::take(&mut state.records);
        records.sort_by_key(|record| record.id);
        Ok(records.into_iter().map(|record| record.message).collect())
    }

    /// Number of pending messages.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Queue("Queue lock poisoned".to_string()))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn push(&self, message: ReplicationMessage) -> Result<PushOutcome> {
        if !self.policy.admits(&message) {
            return Ok(PushOutcome::Discarded);
        }

        let mut state = self.lock()?;
        let identity = message.identity();
        if state
            .records
            .iter()
            .any(|record| record.message.identity() == identity)
        {
            debug!("Skipping duplicate message: {}", message);
            return Ok(PushOutcome::Duplicate);
        }

        let now = Utc::now();
        state.next_id += 1;
        let record = QueuedMessage {
            id: state.next_id,
            available_at: self.policy.backoff.available_at(now, message.retry_count()),
            created_at: now,
            message,
        };
        state.records.push(record);
        Ok(PushOutcome::Enqueued)
    }

    async fn pop(&self) -> Result<Option<QueuedMessage>> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let next = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.available_at <= now)
            .min_by_key(|(_, record)| (record.created_at, record.available_at, record.id))
            .map(|(index, _)| index);

        Ok(next.map(|index| state.records.remove(index)))
    }

    async fn find_by(&self, criteria: &FindCriteria) -> Result<FindResults> {
        criteria.validate()?;
        let state = self.lock()?;

        let mut matching: Vec<&QueuedMessage> = state
            .records
            .iter()
            .filter(|record| {
                criteria
                    .storage
                    .as_ref()
                    .map_or(true, |storage| record.message.storage() == storage)
            })
            .collect();
        matching.sort_by_key(|record| (record.available_at, record.created_at, record.id));

        Ok(FindResults {
            limit: criteria.limit,
            total: matching.len(),
            page: criteria.page,
            items: matching
                .into_iter()
                .skip(criteria.offset())
                .take(criteria.limit)
                .cloned()
                .collect(),
        })
    }
}
