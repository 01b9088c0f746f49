//! Producing service and HTTP log sink configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::envelope::DEFAULT_SOURCE;

/// Identity of the producing service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Value stamped into every envelope's `source` field.
    pub source: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
        }
    }
}

/// HTTP log service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Base address of the log service; envelopes go to `<base>/api/logs`.
    pub base_url: String,
    /// Whole-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            timeout_ms: 3_000,
        }
    }
}

impl LogSinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the base address.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the request timeout, saturating at `u64::MAX` milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
