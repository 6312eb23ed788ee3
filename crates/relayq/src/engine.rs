use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayq_broker::{Broker, BrokerRegistry};
use relayq_core::{JsonSerializer, PublishOptions, Result, Serializer, Task};

use crate::config::EngineConfig;
use crate::consumer::Consumer;
use crate::queue::Queue;

/// Builder for [`Engine`], for swapping the serializer or adding broker
/// drivers.
pub struct EngineBuilder {
    config: EngineConfig,
    serializer: Arc<dyn Serializer>,
    registry: BrokerRegistry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            serializer: Arc::new(JsonSerializer),
            registry: BrokerRegistry::new(),
        }
    }

    /// Replace the payload/record codec.
    pub fn serializer<S: Serializer + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Register an additional broker driver under a URL scheme.
    pub fn register_broker<F>(mut self, scheme: &str, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn Broker>> + Send + Sync + 'static,
    {
        self.registry.register(scheme, factory);
        self
    }

    /// Validate the configuration, resolve the broker driver, and connect.
    pub async fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let broker = self.registry.connect(&self.config.broker_url)?;
        broker.initialize().await?;

        let (finished_tx, _) = watch::channel(false);
        Ok(Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                broker,
                serializer: self.serializer,
                queues: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                finished: finished_tx,
            }),
        })
    }
}

struct EngineInner {
    config: EngineConfig,
    broker: Arc<dyn Broker>,
    serializer: Arc<dyn Serializer>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    shutdown: CancellationToken,
    finished: watch::Sender<bool>,
}

/// Process-level owner of the broker and all queues.
///
/// Cheap to clone; clones share the same broker and queue registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Connect with the default serializer and built-in broker drivers.
    pub async fn new(config: EngineConfig) -> Result<Engine> {
        EngineBuilder::new(config).build().await
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// The queue with this name, created with engine defaults on first
    /// use.
    pub fn queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.inner.queues.read().get(name) {
            return Arc::clone(queue);
        }
        let mut queues = self.inner.queues.write();
        Arc::clone(queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Queue::new(
                name,
                Arc::clone(&self.inner.broker),
                Arc::clone(&self.inner.serializer),
                self.inner.config.defaults(),
                self.inner.shutdown.clone(),
            ))
        }))
    }

    /// Shortcut for `queue(name).publish(value, opts)`.
    pub async fn publish<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        opts: PublishOptions,
    ) -> Result<Task> {
        self.queue(name).publish(value, opts).await
    }

    /// Token cancelled when the engine begins shutting down. Callers may
    /// also cancel it to stop the engine from outside.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Start every subscribed queue's consumer and the delayed-task
    /// promoter, then block until [`stop`] is called or the shutdown
    /// token is cancelled.
    ///
    /// [`stop`]: Engine::stop
    pub async fn run(&self) -> Result<()> {
        self.inner.broker.ping().await?;

        let shutdown = self.inner.shutdown.clone();
        let subscribed: Vec<Arc<Queue>> = {
            let queues = self.inner.queues.read();
            queues
                .values()
                .filter(|queue| queue.handler().is_some())
                .cloned()
                .collect()
        };

        let consumers: Vec<_> = subscribed
            .iter()
            .map(|queue| {
                Consumer::start(
                    Arc::clone(queue),
                    Arc::clone(&self.inner.broker),
                    self.inner.config.poll_timeout(),
                    self.inner.config.error_backoff(),
                    shutdown.clone(),
                )
            })
            .collect();

        let promoter = tokio::spawn(promoter_loop(
            Arc::clone(&self.inner),
            self.inner.config.promote_interval(),
            shutdown.clone(),
        ));

        info!(queues = consumers.len(), "engine started");
        shutdown.cancelled().await;
        info!("engine draining");

        let drain = async {
            for consumer in consumers {
                consumer.join().await;
            }
            let _ = promoter.await;
        };
        if tokio::time::timeout(self.drain_deadline(), drain)
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded, abandoning in-flight work");
        }

        self.inner.broker.close().await?;
        let _ = self.inner.finished.send(true);
        info!("engine stopped");
        Ok(())
    }

    /// Signal shutdown and wait for [`run`] to finish draining.
    ///
    /// Consumers stop pulling new tasks; in-flight handlers may finish up
    /// to their timeout.
    ///
    /// [`run`]: Engine::run
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let mut finished = self.inner.finished.subscribe();
        let deadline = self.drain_deadline() + Duration::from_secs(1);
        let _ = tokio::time::timeout(deadline, async move {
            while !*finished.borrow_and_update() {
                if finished.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }

    /// Release the broker connection. For producer-only processes that
    /// never call [`run`].
    ///
    /// [`run`]: Engine::run
    pub async fn close(&self) -> Result<()> {
        self.inner.broker.close().await
    }

    /// Largest queue timeout plus the configured grace period.
    fn drain_deadline(&self) -> Duration {
        let queues = self.inner.queues.read();
        let largest = queues
            .values()
            .map(|queue| queue.timeout())
            .max()
            .unwrap_or(Duration::ZERO);
        largest + self.inner.config.shutdown_grace()
    }
}

/// Moves due delayed tasks onto the live lists on a fixed tick.
async fn promoter_loop(
    engine: Arc<EngineInner>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let names: Vec<String> = engine.queues.read().keys().cloned().collect();
                for name in names {
                    match engine.broker.promote_delayed(&name, Utc::now()).await {
                        Ok(ids) if !ids.is_empty() => {
                            debug!(queue = %name, promoted = ids.len(), "promoted delayed tasks");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(queue = %name, error = %e, "cannot promote delayed tasks");
                        }
                    }
                }
            }
        }
    }
    debug!("promoter stopped");
}
