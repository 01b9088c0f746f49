//! Broker producer.
//!
//! Owns the single broker connection/channel of the producing process.
//! The connection is established eagerly at construction; failure there is
//! fatal for the process. Publishing is best-effort: every failure is logged
//! and swallowed, nothing is retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bus::{BrokerChannel, Result, Topology};
use crate::envelope::EventEnvelope;
use crate::notify::{DispatchOutcome, NotificationChannel};
use crate::utils::truncate_for_log;

/// Publishes envelopes to the topic exchange under the fixed routing key.
///
/// Shared behind `Arc` by every request handler. Only [`BrokerProducer::shutdown`]
/// closes the underlying channel.
pub struct BrokerProducer {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    routing_key: String,
    source: String,
    closed: AtomicBool,
}

impl BrokerProducer {
    /// Connect to RabbitMQ and declare the exchange.
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &crate::config::Config) -> Result<Self> {
        let channel = crate::bus::AmqpChannel::connect(&config.broker).await?;
        Self::start(Arc::new(channel), &config.topology(), &config.service.source).await
    }

    /// Take ownership of an open channel and declare the exchange on it.
    pub async fn start(
        channel: Arc<dyn BrokerChannel>,
        topology: &Topology,
        source: impl Into<String>,
    ) -> Result<Self> {
        channel.declare_exchange(&topology.exchange_spec()).await?;

        info!(
            exchange = %topology.exchange,
            routing_key = %topology.routing_key,
            "Broker producer ready"
        );

        Ok(Self {
            channel,
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
            source: source.into(),
            closed: AtomicBool::new(false),
        })
    }

    /// Build an envelope and publish it.
    pub async fn publish<P>(&self, event_type: &str, payload: &P) -> DispatchOutcome
    where
        P: Serialize + ?Sized,
    {
        match EventEnvelope::from_serializable(self.source.as_str(), event_type, payload) {
            Ok(envelope) => self.publish_envelope(&envelope).await,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "Failed to build envelope for broker");
                DispatchOutcome::Failed
            }
        }
    }

    /// Publish an already built envelope.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        let body = match envelope.to_json_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(
                    event_type = %envelope.event_type(),
                    error = %e,
                    "Failed to serialize envelope for broker"
                );
                return DispatchOutcome::Failed;
            }
        };

        match self
            .channel
            .publish(&self.exchange, &self.routing_key, &body)
            .await
        {
            Ok(()) => {
                info!(
                    event_type = %envelope.event_type(),
                    event_id = %envelope.event_id(),
                    "Published message to RabbitMQ"
                );
                DispatchOutcome::Delivered
            }
            Err(e) => {
                error!(
                    event_type = %envelope.event_type(),
                    error = %e,
                    body = %truncate_for_log(&body),
                    "Failed to publish message to RabbitMQ"
                );
                DispatchOutcome::Failed
            }
        }
    }

    /// Close the channel, then the connection.
    ///
    /// Always completes; close failures are logged. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.channel.close_channel().await {
            warn!(error = %e, "Error closing RabbitMQ channel");
        }
        if let Err(e) = self.channel.close_connection().await {
            warn!(error = %e, "Error closing RabbitMQ connection");
        }

        info!("Broker producer closed");
    }
}

#[async_trait]
impl NotificationChannel for BrokerProducer {
    fn name(&self) -> &str {
        "broker"
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        self.publish_envelope(envelope).await
    }
}
