//! Task tracking collaborator.
//!
//! The CRUD side of the service: a task model, a repository seam with an
//! in-memory implementation, and [`TaskService`], which notifies both
//! channels after each committed mutation.

mod repository;
mod service;

pub use repository::{InMemoryTaskRepository, TaskRepository};
pub use service::TaskService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors from task storage.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Progress of a task. Serialized by name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    New,
    InProgress,
    Done,
}

/// A stored task, as exposed to callers and carried in event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

/// Replacement values for an existing task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
}
