//! HTTP log sink client.
//!
//! POSTs each envelope as JSON to `<base>/api/logs` with a bounded timeout.
//! Best-effort: non-2xx answers are logged as warnings, transport failures as
//! errors, and nothing is retried or buffered.

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::LogSinkConfig;
use crate::envelope::EventEnvelope;
use crate::notify::{DispatchOutcome, NotificationChannel};
use crate::utils::truncate_for_log;

/// Path of the log ingestion endpoint, relative to the base address.
pub const LOGS_PATH: &str = "/api/logs";

/// Errors that can occur when talking to the log service.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Client for the remote HTTP log service.
pub struct LogSinkClient {
    client: Client,
    endpoint: Url,
    source: String,
}

impl LogSinkClient {
    /// Create a client for the configured base address.
    pub fn new(config: &LogSinkConfig, source: impl Into<String>) -> Result<Self, SinkError> {
        let endpoint = Self::endpoint_for(&config.base_url)?;

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(SinkError::Http)?;

        Ok(Self {
            client,
            endpoint,
            source: source.into(),
        })
    }

    /// Full ingestion URL for a base address.
    fn endpoint_for(base_url: &str) -> Result<Url, SinkError> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(SinkError::Config("log sink base_url not configured".to_string()));
        }

        Url::parse(&format!("{}{}", base, LOGS_PATH))
            .map_err(|e| SinkError::Config(format!("invalid log sink base_url '{}': {}", base, e)))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Build an envelope and send it.
    pub async fn send<P>(&self, event_type: &str, payload: &P) -> DispatchOutcome
    where
        P: Serialize + ?Sized,
    {
        match EventEnvelope::from_serializable(self.source.as_str(), event_type, payload) {
            Ok(envelope) => self.send_envelope(&envelope).await,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "Failed to build envelope for log sink");
                DispatchOutcome::Failed
            }
        }
    }

    /// Send an already built envelope.
    pub async fn send_envelope(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        let body = match envelope.to_json_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(
                    event_type = %envelope.event_type(),
                    error = %e,
                    "Failed to serialize envelope for log sink"
                );
                return DispatchOutcome::Failed;
            }
        };

        match self.post(&body).await {
            Ok(status) if status.is_success() => {
                if status != StatusCode::ACCEPTED {
                    debug!(
                        endpoint = %self.endpoint,
                        status = %status,
                        "Log service answered with an unexpected success status"
                    );
                }
                debug!(
                    event_type = %envelope.event_type(),
                    event_id = %envelope.event_id(),
                    "Sent log event"
                );
                DispatchOutcome::Delivered
            }
            Ok(status) => {
                warn!(
                    endpoint = %self.endpoint,
                    event_type = %envelope.event_type(),
                    status = %status,
                    "Failed to send log event"
                );
                DispatchOutcome::Rejected {
                    status: status.as_u16(),
                }
            }
            Err(e) => {
                error!(
                    endpoint = %self.endpoint,
                    event_type = %envelope.event_type(),
                    timed_out = matches!(&e, SinkError::Http(err) if err.is_timeout()),
                    error = %e,
                    body = %truncate_for_log(&body),
                    "Error sending log event to log service"
                );
                DispatchOutcome::Failed
            }
        }
    }

    async fn post(&self, body: &[u8]) -> Result<StatusCode, SinkError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        Ok(response.status())
    }
}

#[async_trait]
impl NotificationChannel for LogSinkClient {
    fn name(&self) -> &str {
        "log-sink"
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome {
        self.send_envelope(envelope).await
    }
}
