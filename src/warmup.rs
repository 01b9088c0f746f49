//! Start-up warm-up of the notification channels.
//!
//! Pushes one synthetic `Warmup` envelope through each channel on a detached
//! task so the first real request does not pay for cold connections. The
//! startup path never awaits it; failures are logged and not retried.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::envelope::{event_types, EventEnvelope};
use crate::notify::{DispatchOutcome, NotificationChannel};

/// Outcome of the warm-up per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupReport {
    pub broker: DispatchOutcome,
    pub sink: DispatchOutcome,
}

/// Spawn the warm-up; returns immediately.
pub fn spawn_warmup(
    broker: Arc<dyn NotificationChannel>,
    sink: Arc<dyn NotificationChannel>,
    source: impl Into<String>,
) -> JoinHandle<WarmupReport> {
    let source = source.into();
    info!("Starting warm-up for external services");
    tokio::spawn(async move { warm_up(broker.as_ref(), sink.as_ref(), &source).await })
}

/// Warm both channels concurrently.
pub async fn warm_up(
    broker: &dyn NotificationChannel,
    sink: &dyn NotificationChannel,
    source: &str,
) -> WarmupReport {
    let (broker, sink) = tokio::join!(warm_channel(broker, source), warm_channel(sink, source));
    WarmupReport { broker, sink }
}

async fn warm_channel(channel: &dyn NotificationChannel, source: &str) -> DispatchOutcome {
    let envelope =
        match EventEnvelope::from_source(source, event_types::WARMUP, json!({"message": "warmup"})) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %channel.name(), error = %e, "Warm-up envelope rejected");
                return DispatchOutcome::Failed;
            }
        };

    let outcome = channel.dispatch(&envelope).await;
    if outcome.is_delivered() {
        info!(channel = %channel.name(), "Warmed up successfully");
    } else {
        warn!(
            channel = %channel.name(),
            outcome = ?outcome,
            "Warm-up failed, the next real notification will try again"
        );
    }
    outcome
}
