//! Event envelope.
//!
//! The record carried by both notification channels: the HTTP log sink body
//! and the broker message body share this exact JSON shape.
//!
//! ```json
//! {
//!   "event_id": "7c1d0c1e-...",
//!   "event_type": "TaskCreated",
//!   "occurred_at": "2026-10-17T09:30:00.123456Z",
//!   "source": "TaskAPI",
//!   "payload": { "Id": "...", "Title": "..." }
//! }
//! ```

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Source name stamped on envelopes when none is configured.
pub const DEFAULT_SOURCE: &str = "TaskAPI";

/// Well-known event types.
///
/// The set is open: consumers match on the string, so any non-empty tag is
/// accepted by the envelope constructor.
pub mod event_types {
    pub const TASK_CREATED: &str = "TaskCreated";
    pub const TASK_UPDATED: &str = "TaskUpdated";
    pub const TASK_DELETED: &str = "TaskDeleted";
    pub const WARMUP: &str = "Warmup";
}

/// Errors raised while building an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event_type must not be empty")]
    EmptyEventType,

    #[error("source must not be empty")]
    EmptySource,

    #[error("payload is not serializable: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Immutable notification record.
///
/// Fields are private; `event_id`, `occurred_at` and `source` are assigned by
/// the constructor and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    source: String,
    payload: Value,
}

impl EventEnvelope {
    /// Build an envelope stamped with [`DEFAULT_SOURCE`].
    pub fn new(event_type: impl Into<String>, payload: Value) -> Result<Self, EnvelopeError> {
        Self::from_source(DEFAULT_SOURCE, event_type, payload)
    }

    /// Build an envelope for an explicit producing service.
    pub fn from_source(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<Self, EnvelopeError> {
        let event_type = event_type.into();
        let source = source.into();

        if event_type.trim().is_empty() {
            return Err(EnvelopeError::EmptyEventType);
        }
        if source.trim().is_empty() {
            return Err(EnvelopeError::EmptySource);
        }

        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: monotonic_now(),
            source,
            payload,
        })
    }

    /// Build an envelope from any serializable payload.
    pub fn from_serializable<P>(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: &P,
    ) -> Result<Self, EnvelopeError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        Self::from_source(source, event_type, payload)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Serialize to the JSON wire body.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Last timestamp handed out, in microseconds since the epoch.
static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current UTC time, never earlier than any value previously returned in
/// this process (wall clock steps backwards are flattened).
fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_STAMP_MICROS.fetch_max(now, Ordering::AcqRel);
    let stamp = previous.max(now);
    Utc.timestamp_micros(stamp)
        .single()
        .unwrap_or_else(Utc::now)
}
