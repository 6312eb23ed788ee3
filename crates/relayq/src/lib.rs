//! relayq: a distributed background task queue.
//!
//! Producers publish named tasks with arbitrary payloads; worker
//! processes consume them and run user handlers with bounded concurrency,
//! retries with per-attempt backoff, delayed execution, per-task
//! timeouts, and queue inspection. Durability lives behind the [`Broker`]
//! trait; the `memory://` driver is built in and remote-store drivers
//! plug in through [`EngineBuilder::register_broker`].
//!
//! ```rust,no_run
//! use relayq::{Engine, EngineConfig, HandlerFn, PublishOptions, QueueOptions, Request};
//!
//! #[tokio::main]
//! async fn main() -> relayq::Result<()> {
//!     let engine = Engine::new(EngineConfig::default()).await?;
//!
//!     let queue = engine.queue("emails");
//!     queue.subscribe(
//!         HandlerFn(|req: Request| async move {
//!             let payload: serde_json::Value = req.payload()?;
//!             println!("sending {payload}");
//!             Ok(None)
//!         }),
//!         QueueOptions::new().concurrency(4),
//!     );
//!
//!     engine
//!         .publish(
//!             "emails",
//!             &serde_json::json!({"to": "user@example.com"}),
//!             PublishOptions::new(),
//!         )
//!         .await?;
//!
//!     engine.run().await
//! }
//! ```

mod config;
mod consumer;
mod engine;
mod handler;
mod hooks;
mod middleware;
mod queue;
mod request;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use handler::{Handler, HandlerFn, HandlerOutput};
pub use hooks::{Hook, HookFn};
pub use middleware::{LoggingMiddleware, Middleware, Next};
pub use queue::Queue;
pub use request::{Context, Request};

pub use relayq_broker::{Broker, BrokerRegistry, Delivery, MemoryBroker, QueueStats};
pub use relayq_core::{
    Error, JsonSerializer, PublishOptions, QueueOptions, Result, Serializer, Task, TaskStatus,
};
