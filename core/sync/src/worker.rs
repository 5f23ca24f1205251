//! Queue worker: pops replication messages and applies them.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strata_common::Result;
use strata_queue::{MessageQueue, QueuedMessage};

use crate::handlers::{HandlerOutcome, HandlerTable};

/// Delay between two polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A message the worker took from the queue, with what became of it.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub record: QueuedMessage,
    pub outcome: HandlerOutcome,
}

/// Consumes the replication queue.
///
/// Several workers, in one process or many, may share a queue: the queue
/// hands each message to exactly one of them.
pub struct QueueWorker {
    queue: Arc<dyn MessageQueue>,
    handlers: HandlerTable,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<dyn MessageQueue>, handlers: HandlerTable) -> Self {
        Self {
            queue,
            handlers,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the idle poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process the next available message, if any.
    ///
    /// # Errors
    /// - Queue failure
    /// - Configuration errors reported by the handler; the message is lost
    pub async fn process_one(&self) -> Result<Option<ProcessedMessage>> {
        let Some(record) = self.queue.pop().await? else {
            return Ok(None);
        };

        debug!("Processing: {}", record.message);
        match self.handlers.dispatch(&record.message).await {
            Ok(outcome) => Ok(Some(ProcessedMessage { record, outcome })),
            Err(e) => {
                error!("Unable to process message {}: {}", record.message, e);
                Err(e)
            }
        }
    }

    /// Process the next message, waiting for one to become available.
    pub async fn next(&self) -> Result<ProcessedMessage> {
        loop {
            if let Some(processed) = self.process_one().await? {
                return Ok(processed);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Process `limit` messages, or run until `stop` is cancelled when no
    /// limit is given.
    ///
    /// `stop` is only observed between messages: a message taken from the
    /// queue is always handled to completion. `on_processed` is called after
    /// each message. Returns the number of messages processed.
    pub async fn run<F>(
        &self,
        limit: Option<usize>,
        stop: &CancellationToken,
        mut on_processed: F,
    ) -> Result<usize>
    where
        F: FnMut(&ProcessedMessage) + Send,
    {
        info!("Queue worker started");
        let mut processed = 0;

        while limit.map_or(true, |limit| processed < limit) && !stop.is_cancelled() {
            match self.process_one().await? {
                Some(message) => {
                    on_processed(&message);
                    processed += 1;
                }
                None => {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!("Queue worker stopped after {} messages", processed);
        Ok(processed)
    }
}
