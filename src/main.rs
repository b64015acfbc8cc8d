//! Rabbit Fanout - Main Entry Point
//!
//! Publishes a demo batch through the producer pool, then consumes the queue
//! with the consumer pool until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rabbit_fanout::bootstrap::{self, Session};
use rabbit_fanout::shutdown::{self, ShutdownHandle};
use rabbit_fanout::{BrokerConfig, ConsumerPool, DispatchBatch, Message, ProducerPool};

/// Pause between publishing and consuming so the broker settles the batch.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Rabbit Fanout v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("FANOUT_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let config = BrokerConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let session = bootstrap::connect(&config)
        .await
        .context("Failed to connect or open channel")?;

    let result = run(&config, &session).await;
    session.close().await;
    result
}

async fn run(config: &BrokerConfig, session: &Session) -> Result<()> {
    bootstrap::declare_queue(session.channel.as_ref(), &config.queue_params()).await?;

    let messages = (1..=4)
        .map(|i| Message::new(format!("Hello World! {i}")))
        .collect();
    let summary = ProducerPool::new(Arc::clone(&session.gateway), config.publish_target())
        .with_publish_timeout(config.publish_timeout())
        .dispatch(DispatchBatch::new(messages, config.senders))
        .await
        .context("Failed to send messages")?;
    info!(
        dispatch_id = %summary.dispatch_id,
        published = summary.published,
        "Messages sent"
    );

    tokio::time::sleep(SETTLE_DELAY).await;

    let handle = ShutdownHandle::new();
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        shutdown::os_signal().await;
        signal_handle.trigger();
    });

    let report = ConsumerPool::new(
        Arc::clone(&session.channel),
        config.queue_name.clone(),
        config.consumers,
    )
    .run(handle)
    .await
    .context("Failed to receive messages")?;

    info!(
        received = report.received(),
        acked = report.acked(),
        "Shutting down"
    );
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "rabbit_fanout=info".into()),
    );

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
