//! Broker contract for relayq.
//!
//! The broker is the only component that touches the durable store. This
//! crate defines the operations the engine needs (`Broker`), the reference
//! key layout drivers must follow (`keys`), the scheme registry used to
//! resolve drivers from a URL, and `MemoryBroker`, an in-process driver
//! implementing the layout with script-equivalent atomicity.

pub mod keys;

mod memory;
mod registry;

pub use memory::MemoryBroker;
pub use registry::BrokerRegistry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_core::Result;

/// A task handed back by [`Broker::consume`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub id: String,
    pub data: Vec<u8>,
}

/// Sizes of a queue's live list and delayed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub direct: usize,
    pub delayed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.direct + self.delayed
    }
}

/// Durable queue storage with the atomic primitives the engine needs.
///
/// All operations may fail with a transient I/O error; callers decide
/// whether to retry. `initialize` must be called before anything else.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connect, verify reachability, and load any server-side scripts.
    async fn initialize(&self) -> Result<()>;

    /// Liveness check against the store.
    async fn ping(&self) -> Result<()>;

    /// Store the task record and enqueue its id, atomically.
    ///
    /// A future `eta` puts the id on the delayed set scored by eta in
    /// unix-milliseconds; otherwise the id goes to the tail of the live
    /// list.
    async fn publish(
        &self,
        queue: &str,
        id: &str,
        data: &[u8],
        eta: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Dequeue up to one task id per queue, round-robin, blocking up to
    /// `timeout` when all live lists are empty.
    async fn consume(&self, queues: &[String], timeout: Duration) -> Result<Vec<Delivery>>;

    /// Fetch a task record. Absence is `Ok(None)`, not an error.
    async fn get(&self, queue: &str, id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the record and drop the id from the live list and delayed
    /// set. Idempotent.
    async fn delete(&self, queue: &str, id: &str) -> Result<()>;

    /// Overwrite the record with a TTL, keeping terminal results
    /// inspectable for a bounded window.
    async fn set(&self, queue: &str, id: &str, data: &[u8], ttl: Duration) -> Result<()>;

    /// Drop the live list and delayed set. Per-id records are untouched.
    async fn empty(&self, queue: &str) -> Result<()>;

    /// Sizes of the live list and delayed set.
    async fn count(&self, queue: &str) -> Result<QueueStats>;

    /// Ids currently on the live list.
    async fn list(&self, queue: &str) -> Result<Vec<String>>;

    /// Drop the id from the live list and delayed set, leaving the record
    /// in place so a canceled status stays visible.
    async fn cancel(&self, queue: &str, id: &str) -> Result<()>;

    /// Atomically move every delayed id with eta <= `now` onto the tail
    /// of the live list, returning the promoted ids.
    async fn promote_delayed(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<String>>;

    /// Release connections. Further operations fail.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Broker").finish_non_exhaustive()
    }
}
