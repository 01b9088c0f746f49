//! Event fan-out to the notification channels.
//!
//! Called by the CRUD layer after a mutation has been committed. One envelope
//! is built per mutation and handed to the broker producer and the HTTP log
//! sink. Each dispatch runs on its own task: a failure, stall or panic in one
//! channel never reaches the other channel or the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use crate::envelope::{EventEnvelope, DEFAULT_SOURCE};

/// How a single best-effort dispatch ended.
///
/// Purely informational: failures have already been logged by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the downstream (broker accepted the publish, or 2xx).
    Delivered,
    /// The downstream answered with a non-success status.
    Rejected { status: u16 },
    /// Serialization, transport or timeout failure.
    Failed,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered)
    }
}

/// A best-effort downstream for envelopes.
///
/// Implementations catch and log every failure; `dispatch` never panics on
/// transport errors and never returns them to the caller.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Deliver one envelope.
    async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome;
}

/// Per-channel outcome of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub broker: DispatchOutcome,
    pub sink: DispatchOutcome,
}

impl FanOutReport {
    fn failed() -> Self {
        Self {
            broker: DispatchOutcome::Failed,
            sink: DispatchOutcome::Failed,
        }
    }
}

/// Dispatches every mutation event to the broker and to the log sink.
pub struct EventFanOut {
    broker: Arc<dyn NotificationChannel>,
    sink: Arc<dyn NotificationChannel>,
    source: String,
    /// Detached fan-outs started by `spawn_notify` and not yet finished.
    in_flight: AtomicUsize,
    idle: Notify,
}

impl EventFanOut {
    pub fn new(broker: Arc<dyn NotificationChannel>, sink: Arc<dyn NotificationChannel>) -> Self {
        Self {
            broker,
            sink,
            source: DEFAULT_SOURCE.to_string(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Set the `source` stamped on envelopes.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build an envelope and dispatch it to both channels.
    ///
    /// Never fails and never panics; the report only describes what happened.
    pub async fn notify<P>(&self, event_type: &str, payload: &P) -> FanOutReport
    where
        P: Serialize + ?Sized,
    {
        match EventEnvelope::from_serializable(self.source.as_str(), event_type, payload) {
            Ok(envelope) => self.notify_envelope(Arc::new(envelope)).await,
            Err(e) => {
                error!(
                    event_type = %event_type,
                    error = %e,
                    "Failed to build event envelope, notification dropped"
                );
                FanOutReport::failed()
            }
        }
    }

    /// Dispatch an already built envelope to both channels concurrently.
    pub async fn notify_envelope(&self, envelope: Arc<EventEnvelope>) -> FanOutReport {
        let broker = spawn_dispatch(Arc::clone(&self.broker), Arc::clone(&envelope));
        let sink = spawn_dispatch(Arc::clone(&self.sink), Arc::clone(&envelope));

        let (broker, sink) = tokio::join!(broker, sink);
        let report = FanOutReport {
            broker: settle(self.broker.name(), &envelope, broker),
            sink: settle(self.sink.name(), &envelope, sink),
        };

        debug!(
            event_type = %envelope.event_type(),
            event_id = %envelope.event_id(),
            broker = ?report.broker,
            sink = ?report.sink,
            "Event fan-out complete"
        );
        report
    }

    /// Fan out on a detached task; the caller does not wait for delivery.
    ///
    /// The task counts as in flight until it ends, see [`wait_idle`](Self::wait_idle).
    pub fn spawn_notify(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> JoinHandle<FanOutReport> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(self));
        let event_type = event_type.into();
        tokio::spawn(async move { guard.0.notify(&event_type, &payload).await })
    }

    /// Number of detached fan-outs still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no detached fan-out is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Marks one detached fan-out; released when its task ends, panics or is aborted.
struct InFlight(Arc<EventFanOut>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

fn spawn_dispatch(
    channel: Arc<dyn NotificationChannel>,
    envelope: Arc<EventEnvelope>,
) -> JoinHandle<DispatchOutcome> {
    tokio::spawn(async move { channel.dispatch(&envelope).await })
}

fn settle(
    channel: &str,
    envelope: &EventEnvelope,
    joined: Result<DispatchOutcome, JoinError>,
) -> DispatchOutcome {
    joined.unwrap_or_else(|e| {
        error!(
            channel = %channel,
            event_type = %envelope.event_type(),
            error = %e,
            "Notification channel task aborted"
        );
        DispatchOutcome::Failed
    })
}
