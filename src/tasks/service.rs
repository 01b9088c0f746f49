//! Task operations with post-commit notification.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use super::{CreateTask, Task, TaskError, TaskRepository, TaskStatus, UpdateTask};
use crate::envelope::event_types;
use crate::notify::EventFanOut;

/// CRUD entry point used by request handlers.
///
/// Every successful mutation is announced on a detached fan-out task; the
/// caller gets its result without waiting for either channel.
pub struct TaskService {
    repository: Arc<dyn TaskRepository>,
    notifier: Arc<EventFanOut>,
}

impl TaskService {
    pub fn new(repository: Arc<dyn TaskRepository>, notifier: Arc<EventFanOut>) -> Self {
        Self {
            repository,
            notifier,
        }
    }

    pub async fn create(&self, request: CreateTask) -> Result<Task, TaskError> {
        let task = self.repository.insert(request).await?;
        self.announce(event_types::TASK_CREATED, &task);
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, TaskError> {
        self.repository.get(id).await
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
        self.repository.list(status).await
    }

    /// `None` if the task does not exist; nothing is announced then.
    pub async fn update(&self, id: Uuid, request: UpdateTask) -> Result<Option<Task>, TaskError> {
        let updated = self.repository.update(id, request).await?;
        if let Some(task) = &updated {
            self.announce(event_types::TASK_UPDATED, task);
        }
        Ok(updated)
    }

    /// `false` if the task does not exist; nothing is announced then.
    pub async fn delete(&self, id: Uuid) -> Result<bool, TaskError> {
        let deleted = self.repository.delete(id).await?;
        if deleted {
            self.announce(event_types::TASK_DELETED, &json!({ "TaskId": id }));
        }
        Ok(deleted)
    }

    fn announce<P: Serialize + ?Sized>(&self, event_type: &str, payload: &P) {
        match serde_json::to_value(payload) {
            Ok(payload) => {
                self.notifier.spawn_notify(event_type, payload);
            }
            Err(e) => {
                error!(event_type = %event_type, error = %e, "Failed to serialize event payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use crate::notify::{DispatchOutcome, NotificationChannel};
    use crate::tasks::InMemoryTaskRepository;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CapturingChannel {
        outcome: Option<DispatchOutcome>,
        delay: Option<Duration>,
        seen: Mutex<Vec<EventEnvelope>>,
    }

    impl CapturingChannel {
        fn seen(&self) -> Vec<EventEnvelope> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for CapturingChannel {
        fn name(&self) -> &str {
            "capture"
        }

        async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchOutcome {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(envelope.clone());
            self.outcome.unwrap_or(DispatchOutcome::Delivered)
        }
    }

    struct FailingRepository;

    #[async_trait]
    impl TaskRepository for FailingRepository {
        async fn insert(&self, _request: CreateTask) -> Result<Task, TaskError> {
            Err(TaskError::Storage("disk full".to_string()))
        }

        async fn get(&self, _id: Uuid) -> Result<Option<Task>, TaskError> {
            Ok(None)
        }

        async fn list(&self, _status: Option<TaskStatus>) -> Result<Vec<Task>, TaskError> {
            Ok(Vec::new())
        }

        async fn update(&self, _id: Uuid, _request: UpdateTask) -> Result<Option<Task>, TaskError> {
            Err(TaskError::Storage("disk full".to_string()))
        }

        async fn delete(&self, _id: Uuid) -> Result<bool, TaskError> {
            Err(TaskError::Storage("disk full".to_string()))
        }
    }

    fn service_with(
        repository: Arc<dyn TaskRepository>,
        broker: &Arc<CapturingChannel>,
        sink: &Arc<CapturingChannel>,
    ) -> TaskService {
        let fan_out = EventFanOut::new(broker.clone(), sink.clone());
        TaskService::new(repository, Arc::new(fan_out))
    }

    fn channels() -> (Arc<CapturingChannel>, Arc<CapturingChannel>) {
        (
            Arc::new(CapturingChannel::default()),
            Arc::new(CapturingChannel::default()),
        )
    }

    fn request(title: &str) -> CreateTask {
        CreateTask {
            title: title.to_string(),
            ..Default::default()
        }
    }

    async fn wait_for_events(channel: &CapturingChannel, count: usize) -> Vec<EventEnvelope> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let seen = channel.seen();
                if seen.len() >= count {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events not delivered in time")
    }

    #[tokio::test]
    async fn test_create_announces_task_on_both_channels() {
        let (broker, sink) = channels();
        let service = service_with(Arc::new(InMemoryTaskRepository::new()), &broker, &sink);

        let task = service.create(request("write tests")).await.unwrap();

        let at_broker = wait_for_events(&broker, 1).await;
        let at_sink = wait_for_events(&sink, 1).await;
        assert_eq!(at_broker[0], at_sink[0]);
        assert_eq!(at_broker[0].event_type(), "TaskCreated");
        assert_eq!(at_broker[0].payload(), &serde_json::to_value(&task).unwrap());
        assert_eq!(at_broker[0].payload()["Title"], "write tests");
    }

    #[tokio::test]
    async fn test_update_and_delete_announce() {
        let (broker, sink) = channels();
        let service = service_with(Arc::new(InMemoryTaskRepository::new()), &broker, &sink);
        let task = service.create(request("a")).await.unwrap();
        wait_for_events(&broker, 1).await;

        service
            .update(
                task.id,
                UpdateTask {
                    title: "b".to_string(),
                    description: None,
                    status: TaskStatus::Done,
                },
            )
            .await
            .unwrap();
        let events = wait_for_events(&broker, 2).await;
        assert_eq!(events[1].event_type(), "TaskUpdated");
        assert_eq!(events[1].payload()["Status"], "Done");

        assert!(service.delete(task.id).await.unwrap());
        let events = wait_for_events(&sink, 3).await;
        assert_eq!(events[2].event_type(), "TaskDeleted");
        assert_eq!(events[2].payload(), &json!({"TaskId": task.id.to_string()}));
    }

    #[tokio::test]
    async fn test_unknown_ids_announce_nothing() {
        let (broker, sink) = channels();
        let service = service_with(Arc::new(InMemoryTaskRepository::new()), &broker, &sink);
        let id = Uuid::new_v4();

        assert_eq!(service.update(id, UpdateTask::default()).await.unwrap(), None);
        assert!(!service.delete(id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.seen().is_empty());
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutation_announces_nothing() {
        let (broker, sink) = channels();
        let service = service_with(Arc::new(FailingRepository), &broker, &sink);

        assert!(service.create(request("a")).await.is_err());
        assert!(service.delete(Uuid::new_v4()).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.seen().is_empty());
        assert!(sink.seen().is_empty());
    }

    #[tokio::test]
    async fn test_channel_failures_do_not_affect_result() {
        let broker = Arc::new(CapturingChannel {
            outcome: Some(DispatchOutcome::Failed),
            ..Default::default()
        });
        let sink = Arc::new(CapturingChannel {
            outcome: Some(DispatchOutcome::Rejected { status: 500 }),
            ..Default::default()
        });
        let repository = Arc::new(InMemoryTaskRepository::new());
        let service = service_with(repository.clone(), &broker, &sink);

        let task = service.create(request("a")).await.unwrap();

        assert_eq!(repository.get(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_slow_channels_do_not_delay_caller() {
        let broker = Arc::new(CapturingChannel {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let sink = Arc::new(CapturingChannel {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let service = service_with(Arc::new(InMemoryTaskRepository::new()), &broker, &sink);
        let started = Instant::now();

        service.create(request("a")).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
