//! Broker transport for envelope delivery.
//!
//! This module contains:
//! - `BrokerChannel` trait: the one connection/channel pair a producer or
//!   consumer owns for its whole lifetime
//! - `DeliveryStream` / `InboundDelivery`: manual-ack message delivery
//! - Topology types (exchange, queue, binding) with the fixed names used by
//!   the task service and the log consumer
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpChannel;
pub use memory::{MemoryBroker, MemoryChannel};

/// Topic exchange every envelope is published to.
pub const EXCHANGE_NAME: &str = "log_exchange";
/// Routing key carried by every published envelope.
pub const ROUTING_KEY: &str = "log.event";
/// Queue owned by the log consumer group.
pub const QUEUE_NAME: &str = "log_consumer_queue";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("Close failed: {0}")]
    Close(String),
}

// ============================================================================
// Topology
// ============================================================================

/// A durable topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
}

/// A queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Exchange, routing key and queue shared by producer and consumer.
///
/// Either side may declare first; declarations with identical parameters are
/// no-ops on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: EXCHANGE_NAME.to_string(),
            routing_key: ROUTING_KEY.to_string(),
            queue: QUEUE_NAME.to_string(),
        }
    }
}

impl Topology {
    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.clone(),
            durable: true,
        }
    }

    /// Durable, shared, long-lived consumer queue.
    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A single broker connection and channel.
///
/// One instance is shared (behind `Arc`) by every caller of the owning
/// component; implementations must allow concurrent `publish` calls. Only the
/// owner's shutdown routine calls the `close_*` methods.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange (create-if-absent).
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Declare a queue (create-if-absent).
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange under a routing key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a persistent JSON message.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Limit unacknowledged deliveries in flight for this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start a manual-ack subscription on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>>;

    /// Stop the broker from pushing further deliveries to a subscription.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;

    async fn close_connection(&self) -> Result<()>;
}

/// Source of deliveries for one subscription.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the subscription has ended.
    async fn recv(&mut self) -> Option<Result<InboundDelivery>>;
}

/// Settles exactly one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Acknowledge this delivery only (never `multiple`).
    async fn ack(&self) -> Result<()>;
}

/// A message handed to the consumer, not yet acknowledged.
///
/// Dropping a delivery without calling [`InboundDelivery::ack`] leaves it
/// unacknowledged; the broker's redelivery policy decides what happens next.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl InboundDelivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            redelivered,
            body,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Topic pattern match: `*` matches one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
