//! Publish a handful of tasks and process them with a small worker pool.
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use relayq::{Engine, EngineConfig, HandlerFn, LoggingMiddleware, PublishOptions, QueueOptions, Request};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> relayq::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let engine = Engine::new(EngineConfig {
        poll_timeout_ms: 100,
        promote_interval_ms: 100,
        ..EngineConfig::default()
    })
    .await?;

    let queue = engine.queue("emails");
    queue.use_middleware(LoggingMiddleware);
    queue.subscribe(
        HandlerFn(|req: Request| async move {
            let payload: serde_json::Value = req.payload()?;
            tracing::info!(%payload, "sending email");
            Ok(None)
        }),
        QueueOptions::new().concurrency(4),
    );

    for i in 0..5 {
        engine
            .publish(
                "emails",
                &json!({"to": format!("user{}@example.com", i)}),
                PublishOptions::new(),
            )
            .await?;
    }

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.stop().await;
    run.await.expect("engine task panicked")
}
