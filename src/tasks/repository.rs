//! Task storage.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CreateTask, Task, TaskError, TaskStatus, UpdateTask};

/// Task persistence. Implementations stamp `CreatedAt`/`UpdatedAt`.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, request: CreateTask) -> Result<Task, TaskError>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskError>;

    /// All tasks, oldest first, optionally filtered by status.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError>;

    /// Replace a task's fields. `None` if the task does not exist.
    async fn update(&self, id: Uuid, request: UpdateTask) -> Result<Option<Task>, TaskError>;

    /// `false` if the task does not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, TaskError>;
}

/// Process-local repository.
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, request: CreateTask) -> Result<Task, TaskError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            title: request.title,
            description: request.description,
            status: request.status,
            created_at: now,
            updated_at: now,
        };

        self.tasks.write().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update(&self, id: Uuid, request: UpdateTask) -> Result<Option<Task>, TaskError> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };

        task.title = request.title;
        task.description = request.description;
        task.status = request.status;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, TaskError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(title: &str, status: TaskStatus) -> CreateTask {
        CreateTask {
            title: title.to_string(),
            description: None,
            status,
        }
    }

    #[tokio::test]
    async fn test_insert_stamps_timestamps() {
        let repo = InMemoryTaskRepository::new();
        let task = repo.insert(create("a", TaskStatus::New)).await.unwrap();

        assert_eq!(task.created_at, task.updated_at);
        assert_eq!(repo.get(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_update_restamps_and_keeps_created_at() {
        let repo = InMemoryTaskRepository::new();
        let task = repo.insert(create("a", TaskStatus::New)).await.unwrap();

        let updated = repo
            .update(
                task.id,
                UpdateTask {
                    title: "b".to_string(),
                    description: Some("details".to_string()),
                    status: TaskStatus::Done,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.created_at, task.created_at);
        assert!(updated.updated_at >= task.updated_at);
        assert_eq!(updated.title, "b");
        assert_eq!(updated.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let repo = InMemoryTaskRepository::new();
        let id = Uuid::new_v4();

        assert_eq!(repo.get(id).await.unwrap(), None);
        assert_eq!(repo.update(id, UpdateTask::default()).await.unwrap(), None);
        assert!(!repo.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let repo = InMemoryTaskRepository::new();
        repo.insert(create("a", TaskStatus::New)).await.unwrap();
        repo.insert(create("b", TaskStatus::Done)).await.unwrap();
        repo.insert(create("c", TaskStatus::Done)).await.unwrap();

        assert_eq!(repo.list(None).await.unwrap().len(), 3);
        let done = repo.list(Some(TaskStatus::Done)).await.unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|t| t.status == TaskStatus::Done));
    }
}
