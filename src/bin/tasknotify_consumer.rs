//! tasknotify-consumer: log consumer process
//!
//! Binds `log_consumer_queue` to the `log_exchange` topic exchange and logs
//! every envelope published by the task service.
//!
//! ## Configuration
//! - RABBITMQ_HOST / RABBITMQ_PORT: broker address
//! - TASKNOTIFY__CONSUMER__PREFETCH: optional in-flight delivery limit
//! - TASKNOTIFY_LOG: log filter (default "info")
//!
//! Exits non-zero when the broker cannot be reached at startup or the
//! subscription ends unexpectedly, so the supervisor restarts it.

use tokio::sync::watch;
use tracing::{error, info};

use tasknotify::config::Config;
use tasknotify::consumer::{BrokerConsumer, LoggingHandler};
use tasknotify::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        broker = %config.broker.display_addr(),
        queue = %config.consumer.queue,
        "Starting tasknotify-consumer"
    );

    let consumer = BrokerConsumer::connect(&config).await.map_err(|e| {
        error!("Failed to connect to broker: {}", e);
        e
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let stats = consumer.run(LoggingHandler, shutdown_rx).await?;
    info!(processed = stats.processed, "tasknotify-consumer stopped");
    Ok(())
}
