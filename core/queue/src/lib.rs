//! Durable replication queue for Strata.
//!
//! Failover storages record every correction they could not apply
//! synchronously as a [`ReplicationMessage`]. This crate defines those
//! messages and the queues that keep them until a worker applies them.
//!
//! # Guarantees
//! - Idempotent push: a pending message is stored at most once
//! - Single consumer: a popped message is removed before it is returned
//! - Backoff: retried messages become available after `min(600, 2^r)` seconds

pub mod backoff;
pub mod memory;
pub mod message;
pub mod queue;
pub mod sqlite;

pub use backoff::Backoff;
pub use memory::InMemoryQueue;
pub use message::{MessageIdentity, MessageKind, ReplicationMessage};
pub use queue::{
    FindCriteria, FindResults, MessageQueue, PushOutcome, QueuePolicy, QueuedMessage,
    DEFAULT_LIMIT, DEFAULT_PAGE,
};
pub use sqlite::{SqliteQueue, DEFAULT_TABLE_NAME};
