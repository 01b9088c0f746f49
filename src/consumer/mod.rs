//! Broker consumer.
//!
//! Binds the durable consumer queue to the topic exchange and processes
//! envelopes with manual acknowledgment:
//! - well-formed envelope, handler succeeds: ack
//! - `event_type` or `payload` missing: warn and ack (discarded)
//! - invalid body, handler error or handler panic: error log, no ack (broker
//!   redelivers)
//!
//! The receive loop checks the shutdown signal between deliveries only, so a
//! message already handed to the handler always finishes processing.

mod handler;

pub use handler::{
    parse_delivery, DeliveryContext, EnvelopeHandler, InboundEnvelope, LoggingHandler, Parsed,
    ProcessingError,
};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::bus::{BrokerChannel, BusError, DeliveryStream, InboundDelivery, Result, Topology};
use crate::config::ConsumerConfig;
use crate::utils::truncate_for_log;

/// Lifecycle of a consumer.
///
/// `Disconnected` and `Connecting` are only observable through a sender the
/// caller passes to [`BrokerConsumer::connect_with_state`] or
/// [`BrokerConsumer::start_with_state`]; a failed start leaves it at
/// `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    TopologyReady,
    Consuming,
    Draining,
    Closed,
}

/// Counters for one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Handled and acknowledged.
    pub processed: u64,
    /// Missing a required field; acknowledged without handling.
    pub discarded: u64,
    /// Left unacknowledged.
    pub failed: u64,
    /// Acknowledgments the broker did not accept.
    pub ack_failures: u64,
}

enum Settlement {
    Ack,
    Leave,
}

/// Long-running subscriber on the consumer queue.
pub struct BrokerConsumer {
    channel: Arc<dyn BrokerChannel>,
    topology: Topology,
    consumer_tag: String,
    prefetch: Option<u16>,
    state: watch::Sender<ConsumerState>,
}

impl BrokerConsumer {
    /// Connect to RabbitMQ and declare the consumer topology.
    ///
    /// Errors once the bounded connection retry is exhausted; callers treat
    /// that as fatal.
    #[cfg(feature = "amqp")]
    pub async fn connect(config: &crate::config::Config) -> Result<Self> {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self::connect_with_state(config, state).await
    }

    /// Like [`connect`](Self::connect), publishing every state to `state`.
    #[cfg(feature = "amqp")]
    pub async fn connect_with_state(
        config: &crate::config::Config,
        state: watch::Sender<ConsumerState>,
    ) -> Result<Self> {
        state.send_replace(ConsumerState::Connecting);
        let channel = crate::bus::AmqpChannel::connect(&config.broker).await?;
        Self::start_with_state(Arc::new(channel), config.topology(), &config.consumer, state).await
    }

    /// Declare exchange, queue and binding on an open channel.
    pub async fn start(
        channel: Arc<dyn BrokerChannel>,
        topology: Topology,
        config: &ConsumerConfig,
    ) -> Result<Self> {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        Self::start_with_state(channel, topology, config, state).await
    }

    /// Like [`start`](Self::start), publishing every state to `state`.
    pub async fn start_with_state(
        channel: Arc<dyn BrokerChannel>,
        topology: Topology,
        config: &ConsumerConfig,
        state: watch::Sender<ConsumerState>,
    ) -> Result<Self> {
        state.send_replace(ConsumerState::Connecting);

        channel.declare_exchange(&topology.exchange_spec()).await?;
        channel.declare_queue(&topology.queue_spec()).await?;
        channel
            .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
            .await?;

        state.send_replace(ConsumerState::TopologyReady);
        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            routing_key = %topology.routing_key,
            "Consumer topology declared"
        );

        Ok(Self {
            channel,
            topology,
            consumer_tag: config.consumer_tag.clone(),
            prefetch: config.prefetch,
            state,
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Consume until `shutdown` turns true (or its sender is dropped).
    ///
    /// Always drains and closes the channel before returning. Returns an error
    /// if the subscription could not be started or the delivery stream ended
    /// on its own.
    pub async fn run<H>(
        &self,
        handler: H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats>
    where
        H: EnvelopeHandler,
    {
        let mut deliveries = match self.subscribe().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(error = %e, "Failed to start consuming");
                self.drain().await;
                return Err(e);
            }
        };

        self.state.send_replace(ConsumerState::Consuming);
        info!(
            queue = %self.topology.queue,
            consumer_tag = %self.consumer_tag,
            "Consuming messages"
        );

        let mut stats = ConsumerStats::default();
        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break None,
                next = deliveries.recv() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(&handler, delivery, &mut stats).await,
                Some(Err(e)) => break Some(e),
                None => break Some(BusError::Consume("delivery stream ended".to_string())),
            }
        };

        match &failure {
            None => info!("Shutdown requested, draining consumer"),
            Some(e) => error!(error = %e, "Consumer stream failed"),
        }

        if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
            warn!(error = %e, "Error cancelling consumer");
        }
        drop(deliveries);
        self.drain().await;

        info!(
            processed = stats.processed,
            discarded = stats.discarded,
            failed = stats.failed,
            ack_failures = stats.ack_failures,
            "Consumer stopped"
        );

        match failure {
            None => Ok(stats),
            Some(e) => Err(e),
        }
    }

    async fn subscribe(&self) -> Result<Box<dyn DeliveryStream>> {
        if let Some(count) = self.prefetch {
            self.channel.set_prefetch(count).await?;
        }
        self.channel
            .consume(&self.topology.queue, &self.consumer_tag)
            .await
    }

    async fn process<H>(&self, handler: &H, delivery: InboundDelivery, stats: &mut ConsumerStats)
    where
        H: EnvelopeHandler,
    {
        let span = info_span!(
            "consumer.process",
            messaging.system = "rabbitmq",
            messaging.destination = %delivery.routing_key,
            messaging.message_id = delivery.delivery_tag
        );

        async move {
            let settlement = match parse_delivery(&delivery.body) {
                Ok(Parsed::Envelope(envelope)) => {
                    let context = DeliveryContext {
                        delivery_tag: delivery.delivery_tag,
                        routing_key: delivery.routing_key.clone(),
                        redelivered: delivery.redelivered,
                    };
                    let outcome = AssertUnwindSafe(handler.handle(&envelope, &context))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(ProcessingError::Panicked(panic_message(panic.as_ref())))
                        });
                    match outcome {
                        Ok(()) => {
                            stats.processed += 1;
                            Settlement::Ack
                        }
                        Err(e) => {
                            error!(
                                event_type = %envelope.event_type,
                                error = %e,
                                "Error processing message"
                            );
                            stats.failed += 1;
                            Settlement::Leave
                        }
                    }
                }
                Ok(Parsed::MissingField(field)) => {
                    warn!(
                        missing = field,
                        body = %truncate_for_log(&delivery.body),
                        "Received malformed message, discarding"
                    );
                    stats.discarded += 1;
                    Settlement::Ack
                }
                Err(e) => {
                    error!(
                        error = %e,
                        body = %truncate_for_log(&delivery.body),
                        "Error processing message"
                    );
                    stats.failed += 1;
                    Settlement::Leave
                }
            };

            match settlement {
                Settlement::Ack => {
                    if let Err(e) = delivery.ack().await {
                        error!(error = %e, "Failed to acknowledge message");
                        stats.ack_failures += 1;
                    }
                }
                // Unacked deliveries are redelivered by the broker.
                Settlement::Leave => drop(delivery),
            }
        }
        .instrument(span)
        .await
    }

    /// Close the channel, then the connection. Never fails.
    async fn drain(&self) {
        self.state.send_replace(ConsumerState::Draining);

        if let Err(e) = self.channel.close_channel().await {
            warn!(error = %e, "Error closing RabbitMQ channel");
        }
        if let Err(e) = self.channel.close_connection().await {
            warn!(error = %e, "Error closing RabbitMQ connection");
        }

        self.state.send_replace(ConsumerState::Closed);
    }
}

/// Resolves once shutdown is signalled or the signal sender is gone.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
