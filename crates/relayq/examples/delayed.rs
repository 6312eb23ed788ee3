//! Delayed execution: a countdown task sits in the delayed set until the
//! promoter moves it onto the live list.
//!
//! Run with: cargo run --example delayed

use std::time::Duration;

use relayq::{Engine, EngineConfig, HandlerFn, PublishOptions, QueueOptions, Request};
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

    let queue = engine.queue("reminders");
    queue.subscribe(
        HandlerFn(|req: Request| async move {
            let payload: serde_json::Value = req.payload()?;
            tracing::info!(%payload, "reminder fired");
            Ok(None)
        }),
        QueueOptions::new(),
    );

    let task = queue
        .publish(
            &json!({"note": "stand up"}),
            PublishOptions::new().countdown(Duration::from_millis(500)),
        )
        .await?;

    let stats = queue.count().await?;
    tracing::info!(id = %task.id, direct = stats.direct, delayed = stats.delayed, "published");

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.stop().await;
    run.await.expect("engine task panicked")
}
