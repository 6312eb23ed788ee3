use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relayq_broker::{Broker, QueueStats};
use relayq_core::{EffectiveOptions, Error, PublishOptions, QueueOptions, Result, Serializer, Task};

use crate::handler::Handler;
use crate::hooks::{Hook, HookSet};
use crate::middleware::Middleware;

/// A named task stream: the producer surface plus the handler wiring the
/// consumer runs.
///
/// Configuration is append-only before the engine runs and treated as
/// immutable afterwards.
pub struct Queue {
    name: String,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn Serializer>,
    defaults: RwLock<EffectiveOptions>,
    concurrency: RwLock<usize>,
    handler: RwLock<Option<Arc<dyn Handler>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    hooks: RwLock<HookSet>,
    shutdown: CancellationToken,
}

impl Queue {
    pub(crate) fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn Serializer>,
        defaults: EffectiveOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Queue {
            name: name.into(),
            broker,
            serializer,
            defaults: RwLock::new(defaults),
            concurrency: RwLock::new(1),
            handler: RwLock::new(None),
            middlewares: RwLock::new(Vec::new()),
            hooks: RwLock::new(HookSet::default()),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize a value and durably publish it as a task.
    ///
    /// On return the broker has accepted the task; it survives process
    /// death.
    pub async fn publish<T: Serialize>(&self, value: &T, opts: PublishOptions) -> Result<Task> {
        let payload = self.serializer.dumps(&serde_json::to_value(value)?)?;
        self.publish_payload(payload, opts).await
    }

    /// Publish a payload that is already serialized.
    pub async fn publish_bytes(
        &self,
        id: impl Into<String>,
        payload: Vec<u8>,
        opts: PublishOptions,
    ) -> Result<Task> {
        self.publish_payload(payload, opts.id(id)).await
    }

    async fn publish_payload(&self, payload: Vec<u8>, opts: PublishOptions) -> Result<Task> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let now = Utc::now();
        let eta = opts.resolve_eta(now)?;
        let effective = self.defaults.read().merge_publish(&opts);

        let mut task = Task::new(&self.name, payload);
        if let Some(id) = opts.id {
            task.id = id;
        }
        task.eta = eta;
        task.timeout = effective.timeout;
        task.max_retries = effective.max_retries;
        task.retry_intervals = effective.retry_intervals;
        task.ttl = effective.ttl;

        let record = task.to_record(self.serializer.as_ref())?;
        self.broker
            .publish(&self.name, &task.id, &record, eta)
            .await?;

        debug!(
            queue = %self.name,
            id = %task.id,
            delayed = task.eta.is_some(),
            "task published"
        );
        Ok(task)
    }

    /// Re-publish an updated record under the same id when scheduling a
    /// retry.
    pub(crate) async fn republish(&self, task: &Task) -> Result<()> {
        let record = task.to_record(self.serializer.as_ref())?;
        self.broker
            .publish(&self.name, &task.id, &record, task.eta)
            .await
    }

    /// Fetch a task record; absence is `Ok(None)`.
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        match self.broker.get(&self.name, id).await? {
            Some(bytes) => Ok(Some(Task::from_record(&bytes, self.serializer.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Best-effort cancel: drop the id from the live list and delayed
    /// set, and rewrite a still-present, non-terminal record as canceled.
    ///
    /// A task already handed to a worker may still execute.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.broker.cancel(&self.name, id).await?;
        if let Some(mut task) = self.get(id).await? {
            if !task.status.is_terminal() {
                task.mark_canceled();
                let record = task.to_record(self.serializer.as_ref())?;
                self.broker.set(&self.name, id, &record, task.ttl).await?;
                debug!(queue = %self.name, id = %id, "task canceled");
            }
        }
        Ok(())
    }

    /// Drop the live list and delayed set; per-id records are untouched.
    pub async fn empty(&self) -> Result<()> {
        self.broker.empty(&self.name).await
    }

    pub async fn count(&self) -> Result<QueueStats> {
        self.broker.count(&self.name).await
    }

    /// Hydrate the task records currently on the live list.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let ids = self.broker.list(&self.name).await?;
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Attach the handler and merge options into the queue defaults.
    ///
    /// The most recent subscription defines the handler.
    pub fn subscribe<H: Handler + 'static>(&self, handler: H, opts: QueueOptions) {
        let merged = self.defaults.read().merge_queue(&opts);
        *self.defaults.write() = merged;
        if let Some(concurrency) = opts.concurrency {
            *self.concurrency.write() = concurrency.max(1);
        }
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Append a middleware to the handler pipeline.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.middlewares.write().push(Arc::new(middleware));
    }

    pub fn on_start<H: Hook + 'static>(&self, hook: H) {
        self.hooks.write().on_start.push(Arc::new(hook));
    }

    pub fn on_complete<H: Hook + 'static>(&self, hook: H) {
        self.hooks.write().on_complete.push(Arc::new(hook));
    }

    pub fn on_success<H: Hook + 'static>(&self, hook: H) {
        self.hooks.write().on_success.push(Arc::new(hook));
    }

    pub fn on_failure<H: Hook + 'static>(&self, hook: H) {
        self.hooks.write().on_failure.push(Arc::new(hook));
    }

    // Consumer-side accessors.

    pub(crate) fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<Task> {
        Task::from_record(bytes, self.serializer.as_ref())
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn Handler>> {
        self.handler.read().clone()
    }

    pub(crate) fn middlewares(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.read().clone()
    }

    pub(crate) fn hooks(&self) -> HookSet {
        self.hooks.read().clone()
    }

    pub(crate) fn concurrency(&self) -> usize {
        *self.concurrency.read()
    }

    pub(crate) fn timeout(&self) -> std::time::Duration {
        self.defaults.read().timeout
    }

    pub(crate) fn ttl(&self) -> std::time::Duration {
        self.defaults.read().ttl
    }

    /// Persist a terminal record with its TTL so inspectors can read it.
    pub(crate) async fn store(&self, task: &Task) -> Result<()> {
        let record = task.to_record(self.serializer.as_ref())?;
        self.broker.set(&self.name, &task.id, &record, task.ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relayq_broker::MemoryBroker;
    use relayq_core::{Error, JsonSerializer, TaskStatus};
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new(
            "q",
            Arc::new(MemoryBroker::new()),
            Arc::new(JsonSerializer),
            EffectiveOptions::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_then_get_round_trip() {
        let queue = queue();
        let published = queue
            .publish(&json!({"data": "hello"}), PublishOptions::new())
            .await
            .unwrap();

        let fetched = queue.get(&published.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, published.id);
        assert_eq!(fetched.status, TaskStatus::Waiting);

        let serializer = JsonSerializer;
        use relayq_core::Serializer as _;
        let payload = serializer.loads(&fetched.payload).unwrap();
        assert_eq!(payload, json!({"data": "hello"}));
    }

    #[tokio::test]
    async fn test_publish_with_preassigned_id() {
        let queue = queue();
        let task = queue
            .publish(&json!(1), PublishOptions::new().id("my-id"))
            .await
            .unwrap();
        assert_eq!(task.id, "my-id");
        assert!(queue.get("my-id").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_publish_applies_option_layering() {
        let queue = queue();
        let task = queue
            .publish(
                &json!(1),
                PublishOptions::new()
                    .timeout(Duration::from_secs(5))
                    .max_retries(7),
            )
            .await
            .unwrap();

        assert_eq!(task.timeout, Duration::from_secs(5));
        assert_eq!(task.max_retries, 7);
        // Unset options keep queue-level defaults.
        assert_eq!(task.ttl, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_publish_rejected_after_shutdown() {
        let shutdown = CancellationToken::new();
        let queue = Queue::new(
            "q",
            Arc::new(MemoryBroker::new()),
            Arc::new(JsonSerializer),
            EffectiveOptions::default(),
            shutdown.clone(),
        );
        shutdown.cancel();

        let err = queue.publish(&json!(1), PublishOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn test_publish_rejects_conflicting_delay_options() {
        let queue = queue();
        let err = queue
            .publish(
                &json!(1),
                PublishOptions::new()
                    .eta(Utc::now())
                    .countdown(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_publish_bytes_skips_serialization() {
        let queue = queue();
        let payload = b"{\"raw\":true}".to_vec();
        let task = queue
            .publish_bytes("raw-1", payload.clone(), PublishOptions::new())
            .await
            .unwrap();

        assert_eq!(task.id, "raw-1");
        assert_eq!(task.payload, payload);
    }

    #[tokio::test]
    async fn test_countdown_lands_in_delayed_set() {
        let queue = queue();
        queue
            .publish(
                &json!(1),
                PublishOptions::new().countdown(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let stats = queue.count().await.unwrap();
        assert_eq!(stats.direct, 0);
        assert_eq!(stats.delayed, 1);
    }

    #[tokio::test]
    async fn test_cancel_writes_canceled_record() {
        let queue = queue();
        let task = queue
            .publish(
                &json!(1),
                PublishOptions::new().countdown(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        queue.cancel(&task.id).await.unwrap();

        let stats = queue.count().await.unwrap();
        assert_eq!(stats.total(), 0);

        let record = queue.get(&task.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Canceled);
        assert!(record.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_missing_task_is_ok() {
        let queue = queue();
        queue.cancel("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_then_count_zero() {
        let queue = queue();
        queue.publish(&json!(1), PublishOptions::new()).await.unwrap();
        queue
            .publish(
                &json!(2),
                PublishOptions::new().countdown(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        queue.empty().await.unwrap();
        let stats = queue.count().await.unwrap();
        assert_eq!(stats.direct, 0);
        assert_eq!(stats.delayed, 0);
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn test_list_hydrates_records() {
        let queue = queue();
        let a = queue.publish(&json!(1), PublishOptions::new()).await.unwrap();
        let b = queue.publish(&json!(2), PublishOptions::new()).await.unwrap();

        let tasks = queue.list().await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str()]);
    }

    #[tokio::test]
    async fn test_latest_subscription_wins() {
        use crate::handler::HandlerFn;
        use crate::request::Request;

        let queue = queue();
        queue.subscribe(
            HandlerFn(|_req: Request| async move { Ok(None) }),
            QueueOptions::new().concurrency(2),
        );
        queue.subscribe(
            HandlerFn(|_req: Request| async move { Ok(Some(b"v2".to_vec())) }),
            QueueOptions::new().concurrency(8),
        );

        assert_eq!(queue.concurrency(), 8);
        assert!(queue.handler().is_some());
    }
}
