//! Shared utilities for integration tests.
//!
//! Provides a stand-in for the HTTP log service and an in-memory broker with
//! the consumer topology declared.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;

use tasknotify::bus::{BrokerChannel, MemoryBroker, Topology};
use tasknotify::config::LogSinkConfig;
use tasknotify::sink::LogSinkClient;

#[derive(Clone)]
struct CaptureState {
    received: Arc<Mutex<Vec<Value>>>,
    status: StatusCode,
    delay: Duration,
}

/// HTTP log service double listening on an ephemeral local port.
pub struct LogCapture {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
}

impl LogCapture {
    /// Accept every POST with 202.
    pub async fn start() -> Self {
        Self::start_with(StatusCode::ACCEPTED, Duration::ZERO).await
    }

    pub async fn start_with(status: StatusCode, delay: Duration) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let state = CaptureState {
            received: Arc::clone(&received),
            status,
            delay,
        };

        let app = Router::new()
            .route("/api/logs", post(ingest))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind capture server");
        let addr = listener.local_addr().expect("Failed to read local address");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Capture server failed");
        });

        Self { addr, received }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Sink client pointed at this server.
    pub fn client(&self, timeout: Duration) -> LogSinkClient {
        let config = LogSinkConfig::default()
            .with_base_url(self.base_url())
            .with_timeout(timeout);
        LogSinkClient::new(&config, "TaskAPI").expect("Failed to build sink client")
    }

    /// Wait until at least `count` bodies arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        eventually(|| self.received().len() >= count).await;
        self.received()
    }
}

async fn ingest(State(state): State<CaptureState>, Json(body): Json<Value>) -> StatusCode {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    state.received.lock().unwrap().push(body);
    state.status
}

/// In-memory broker with exchange, queue and binding declared.
pub async fn bound_broker() -> (MemoryBroker, Topology) {
    let broker = MemoryBroker::new();
    let topology = Topology::default();
    let channel = broker.channel();

    channel
        .declare_exchange(&topology.exchange_spec())
        .await
        .expect("Failed to declare exchange");
    channel
        .declare_queue(&topology.queue_spec())
        .await
        .expect("Failed to declare queue");
    channel
        .bind_queue(&topology.queue, &topology.exchange, &topology.routing_key)
        .await
        .expect("Failed to bind queue");

    (broker, topology)
}

/// Poll until `condition` holds, failing after 5 seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached within 5s");
}
