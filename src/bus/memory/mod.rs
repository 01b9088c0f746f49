//! In-memory broker for tests and local runs.
//!
//! Models the parts of RabbitMQ the notification path relies on: idempotent
//! declaration of durable exchanges and queues, topic routing, manual
//! acknowledgment and redelivery of unacknowledged messages. A delivery that
//! is dropped unsettled goes back to the head of its queue immediately
//! (RabbitMQ waits for the channel to close before redelivering).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{
    topic_matches, BrokerChannel, BusError, DeliveryAcker, DeliveryStream, ExchangeSpec,
    InboundDelivery, QueueSpec, Result,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    acked: usize,
    deliveries: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            acked: 0,
            deliveries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    cancelled: HashSet<String>,
    next_tag: u64,
    fail_on_publish: bool,
    publish_delay: Option<Duration>,
    channel_closes: usize,
    connection_closes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    available: Notify,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel on this broker.
    pub fn channel(&self) -> Arc<MemoryChannel> {
        Arc::new(MemoryChannel {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Make every publish fail as if the connection were broken.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.lock().fail_on_publish = fail;
    }

    /// Delay every publish, simulating an unresponsive broker.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.lock().publish_delay = delay;
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Messages waiting for delivery on a queue.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    pub fn ack_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked)
    }

    /// Total deliveries, redeliveries included.
    pub fn delivery_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.deliveries)
    }

    /// Bodies of the messages currently waiting on a queue.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.ready.iter().map(|m| m.body.clone()).collect())
    }

    pub fn channel_closes(&self) -> usize {
        self.lock().channel_closes
    }

    pub fn connection_closes(&self) -> usize {
        self.lock().connection_closes
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the state half-updated
        // in a way later readers care about.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.lock().queues.get(queue).map(f).unwrap_or_default()
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut state = self.lock();

        if state.fail_on_publish {
            return Err(BusError::Publish("connection reset by peer".to_string()));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Publish(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        drop(state);

        self.inner.available.notify_waiters();
        Ok(())
    }

    fn settle(&self, queue: &str, tag: u64) -> Result<()> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Ack(format!("NOT_FOUND - no queue '{}'", queue)))?;

        match q.unacked.remove(&tag) {
            Some(_) => {
                q.acked += 1;
                Ok(())
            }
            None => Err(BusError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                tag
            ))),
        }
    }

    fn requeue(&self, queue: &str, tag: u64) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            if let Some(mut message) = q.unacked.remove(&tag) {
                message.redelivered = true;
                q.ready.push_front(message);
            }
        }
        drop(state);

        self.inner.available.notify_waiters();
    }
}

/// Channel handle onto a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Connection("channel is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Topology(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let delay = self.broker.lock().publish_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.broker.route(exchange, routing_key, body)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn DeliveryStream>> {
        self.ensure_open()?;
        let mut state = self.broker.lock();

        if !state.queues.contains_key(queue) {
            return Err(BusError::Consume(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        state.cancelled.remove(consumer_tag);

        Ok(Box::new(MemoryDeliveryStream {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        }))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker
            .lock()
            .cancelled
            .insert(consumer_tag.to_string());
        self.broker.inner.available.notify_waiters();
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BusError::Close("channel already closed".to_string()));
        }
        self.broker.lock().channel_closes += 1;
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.broker.lock().connection_closes += 1;
        Ok(())
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn recv(&mut self) -> Option<Result<InboundDelivery>> {
        loop {
            // Give other tasks a turn when messages are always ready.
            tokio::task::yield_now().await;

            let notified = self.broker.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.lock();
                if state.cancelled.contains(&self.consumer_tag) {
                    return None;
                }

                state.next_tag += 1;
                let tag = state.next_tag;
                let queue = state.queues.get_mut(&self.queue)?;

                if let Some(message) = queue.ready.pop_front() {
                    queue.deliveries += 1;
                    queue.unacked.insert(tag, message.clone());

                    let acker = MemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                        settled: AtomicBool::new(false),
                    };
                    return Some(Ok(InboundDelivery::new(
                        tag,
                        message.routing_key,
                        message.redelivered,
                        message.body,
                        Box::new(acker),
                    )));
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    settled: AtomicBool,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.queue, self.tag)?;
        self.settled.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::Acquire) {
            self.broker.requeue(&self.queue, self.tag);
        }
    }
}
