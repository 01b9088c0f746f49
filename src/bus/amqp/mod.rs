//! AMQP (RabbitMQ) broker channel.
//!
//! Holds exactly one connection and one channel for the lifetime of the
//! owning producer or consumer. lapin channels are internally synchronized,
//! so concurrent publishes from many request handlers share the channel
//! without extra locking.

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BusError, DeliveryAcker, DeliveryStream, ExchangeSpec, InboundDelivery,
    QueueSpec, Result,
};
use crate::config::BrokerConfig;
use crate::utils::retry::connection_backoff;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// One RabbitMQ connection plus one channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    addr: String,
}

impl AmqpChannel {
    /// Connect and open a channel, once.
    pub async fn open(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.amqp_url(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                BusError::Connection(format!(
                    "Failed to connect to {}: {}",
                    config.display_addr(),
                    e
                ))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        info!(addr = %config.display_addr(), "Connected to AMQP");

        Ok(Self {
            connection,
            channel,
            addr: config.display_addr(),
        })
    }

    /// Connect with bounded exponential backoff.
    ///
    /// Makes `config.connect_attempts` attempts in total; the last error is
    /// returned when all of them fail.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        (|| Self::open(config))
            .retry(connection_backoff(config.connect_attempts))
            .notify(|e: &BusError, delay| {
                warn!(
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    addr = %config.display_addr(),
                    "AMQP connection failed, retrying after backoff"
                );
            })
            .await
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare exchange: {}", e)))?;

        debug!(exchange = %exchange.name, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare queue: {}", e)))?;

        debug!(queue = %queue.name, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BusError::Consume(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close_channel(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Close(format!("Failed to close channel: {}", e)))?;

        debug!(addr = %self.addr, "AMQP channel closed");
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Close(format!("Failed to close connection: {}", e)))?;

        debug!(addr = %self.addr, "AMQP connection closed");
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn recv(&mut self) -> Option<Result<InboundDelivery>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|d| {
                    InboundDelivery::new(
                        d.delivery_tag,
                        d.routing_key.as_str(),
                        d.redelivered,
                        d.data,
                        Box::new(AmqpAcker(d.acker)),
                    )
                })
                .map_err(|e| BusError::Consume(format!("Delivery error: {}", e))),
        )
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Ack(format!("Failed to ack message: {}", e)))
    }
}
