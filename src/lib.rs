//! tasknotify - failure-isolated event notification for a task service.
//!
//! Every committed task mutation is announced twice: published to a RabbitMQ
//! topic exchange and POSTed to a remote HTTP log service. Neither channel can
//! block, fail or corrupt the mutation that triggered it. A separate consumer
//! process drains the broker queue with manual acknowledgment.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod notify;
pub mod producer;
pub mod runtime;
pub mod sink;
pub mod tasks;
pub mod utils;
pub mod warmup;
