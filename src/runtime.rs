//! Producer-side process lifecycle.
//!
//! Connects the broker producer (fatal on failure), builds the log sink
//! client and the fan-out, and kicks off the warm-up without waiting for it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::BusError;
use crate::notify::{EventFanOut, NotificationChannel};
use crate::producer::BrokerProducer;
use crate::sink::SinkError;
use crate::warmup::{spawn_warmup, WarmupReport};

/// How long `shutdown` waits for detached fan-outs before closing the broker.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Startup failures. The process should exit on any of these.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Broker unavailable: {0}")]
    Broker(#[from] BusError),

    #[error("Log sink misconfigured: {0}")]
    Sink(#[from] SinkError),
}

/// Running notification subsystem of a producing service.
pub struct NotifierRuntime {
    producer: Arc<BrokerProducer>,
    fan_out: Arc<EventFanOut>,
    warmup: JoinHandle<WarmupReport>,
}

impl NotifierRuntime {
    /// Connect to the broker and start the warm-up.
    #[cfg(feature = "amqp")]
    pub async fn start(config: &crate::config::Config) -> Result<Self, StartupError> {
        let producer = BrokerProducer::connect(config).await?;
        let sink = crate::sink::LogSinkClient::new(&config.log_sink, &config.service.source)?;

        Ok(Self::from_parts(
            Arc::new(producer),
            Arc::new(sink),
            &config.service.source,
        ))
    }

    /// Assemble from an already started producer and a sink channel.
    ///
    /// Must be called inside a Tokio runtime; the warm-up is spawned onto it.
    pub fn from_parts(
        producer: Arc<BrokerProducer>,
        sink: Arc<dyn NotificationChannel>,
        source: &str,
    ) -> Self {
        let broker: Arc<dyn NotificationChannel> = producer.clone();
        let fan_out = Arc::new(EventFanOut::new(broker.clone(), sink.clone()).with_source(source));
        let warmup = spawn_warmup(broker, sink, source);

        info!(source = %source, "Notifier runtime started");

        Self {
            producer,
            fan_out,
            warmup,
        }
    }

    /// Fan-out shared by request handlers.
    pub fn fan_out(&self) -> Arc<EventFanOut> {
        Arc::clone(&self.fan_out)
    }

    pub fn producer(&self) -> &Arc<BrokerProducer> {
        &self.producer
    }

    pub fn warmup_finished(&self) -> bool {
        self.warmup.is_finished()
    }

    /// Stop an unfinished warm-up, let detached fan-outs finish for up to
    /// [`DEFAULT_SHUTDOWN_GRACE`], then close the producer channel and connection.
    pub async fn shutdown(self) {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await;
    }

    /// Like [`shutdown`](Self::shutdown) with an explicit grace period.
    ///
    /// Fan-outs still running when the grace ends lose their broker publish.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        if !self.warmup.is_finished() {
            self.warmup.abort();
        }
        if tokio::time::timeout(grace, self.fan_out.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.fan_out.in_flight(),
                grace = ?grace,
                "Closing broker with event fan-outs still in flight"
            );
        }
        self.producer.shutdown().await;
        info!("Notifier runtime stopped");
    }
}
