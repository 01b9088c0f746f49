//! Inbound envelope parsing and the per-message handler seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

/// Field names accepted for each envelope attribute, wire name first.
const EVENT_ID_KEYS: &[&str] = &["event_id", "EventId"];
const EVENT_TYPE_KEYS: &[&str] = &["event_type", "EventType"];
const OCCURRED_AT_KEYS: &[&str] = &["occurred_at", "OccurredAt"];
const SOURCE_KEYS: &[&str] = &["source", "Source"];
const PAYLOAD_KEYS: &[&str] = &["payload", "Payload"];

/// Errors raised while processing a delivery. The delivery is left unacked.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message body is not a JSON object")]
    NotAnObject,

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Envelope as seen by the consumer.
///
/// Only `event_type` and `payload` are required; the other attributes are
/// carried when the producer sent them.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub event_id: Option<String>,
    pub event_type: String,
    pub occurred_at: Option<String>,
    pub source: Option<String>,
    pub payload: Value,
}

/// Broker metadata of the delivery being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
}

/// Result of parsing a well-formed JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Envelope(InboundEnvelope),
    /// A required attribute is absent; the message is discarded.
    MissingField(&'static str),
}

/// Parse a delivery body.
///
/// Invalid JSON and non-object bodies are errors. A present key with a `null`
/// value still counts as present.
pub fn parse_delivery(body: &[u8]) -> Result<Parsed, ProcessingError> {
    let value: Value = serde_json::from_slice(body)?;
    let Value::Object(fields) = value else {
        return Err(ProcessingError::NotAnObject);
    };

    let Some(event_type) = lookup(&fields, EVENT_TYPE_KEYS) else {
        return Ok(Parsed::MissingField("event_type"));
    };
    let Some(payload) = lookup(&fields, PAYLOAD_KEYS) else {
        return Ok(Parsed::MissingField("payload"));
    };

    Ok(Parsed::Envelope(InboundEnvelope {
        event_id: lookup(&fields, EVENT_ID_KEYS).map(text),
        event_type: text(event_type),
        occurred_at: lookup(&fields, OCCURRED_AT_KEYS).map(text),
        source: lookup(&fields, SOURCE_KEYS).map(text),
        payload: payload.clone(),
    }))
}

fn lookup<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Local processing of one well-formed envelope.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` leaves it
/// unacknowledged for the broker to redeliver.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        context: &DeliveryContext,
    ) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<H: EnvelopeHandler + ?Sized> EnvelopeHandler for Arc<H> {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        context: &DeliveryContext,
    ) -> Result<(), ProcessingError> {
        (**self).handle(envelope, context).await
    }
}

/// Logs every envelope with its payload pretty-printed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EnvelopeHandler for LoggingHandler {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        context: &DeliveryContext,
    ) -> Result<(), ProcessingError> {
        let payload = serde_json::to_string_pretty(&envelope.payload)
            .map_err(|e| ProcessingError::Handler(e.to_string()))?;

        info!(
            event_type = %envelope.event_type,
            source = envelope.source.as_deref().unwrap_or("-"),
            redelivered = context.redelivered,
            "Received event\n{}",
            payload
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Parsed {
        parse_delivery(&serde_json::to_vec(&value).unwrap()).unwrap()
    }

    #[test]
    fn test_parses_wire_envelope() {
        let parsed = parse(json!({
            "event_id": "5f0c",
            "event_type": "TaskCreated",
            "occurred_at": "2026-01-01T00:00:00Z",
            "source": "TaskAPI",
            "payload": {"Id": "1"}
        }));

        assert_eq!(
            parsed,
            Parsed::Envelope(InboundEnvelope {
                event_id: Some("5f0c".to_string()),
                event_type: "TaskCreated".to_string(),
                occurred_at: Some("2026-01-01T00:00:00Z".to_string()),
                source: Some("TaskAPI".to_string()),
                payload: json!({"Id": "1"}),
            })
        );
    }

    #[test]
    fn test_accepts_pascal_case_fields() {
        let Parsed::Envelope(envelope) =
            parse(json!({"EventType": "TaskDeleted", "Payload": {"TaskId": "9"}}))
        else {
            panic!("expected envelope");
        };

        assert_eq!(envelope.event_type, "TaskDeleted");
        assert_eq!(envelope.payload["TaskId"], "9");
        assert_eq!(envelope.source, None);
    }

    #[test]
    fn test_missing_fields_are_reported() {
        assert_eq!(
            parse(json!({"payload": {}})),
            Parsed::MissingField("event_type")
        );
        assert_eq!(
            parse(json!({"event_type": "TaskCreated"})),
            Parsed::MissingField("payload")
        );
    }

    #[test]
    fn test_null_payload_counts_as_present() {
        let Parsed::Envelope(envelope) = parse(json!({"event_type": "Warmup", "payload": null}))
        else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn test_invalid_bodies_are_errors() {
        assert!(matches!(
            parse_delivery(b"{not json"),
            Err(ProcessingError::Malformed(_))
        ));
        assert!(matches!(
            parse_delivery(b"[1, 2]"),
            Err(ProcessingError::NotAnObject)
        ));
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_any_payload() {
        let envelope = InboundEnvelope {
            event_id: None,
            event_type: "Warmup".to_string(),
            occurred_at: None,
            source: None,
            payload: json!({"message": "warmup"}),
        };
        let context = DeliveryContext {
            delivery_tag: 1,
            routing_key: "log.event".to_string(),
            redelivered: false,
        };

        assert!(LoggingHandler.handle(&envelope, &context).await.is_ok());
    }
}
