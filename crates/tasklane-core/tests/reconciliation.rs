use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tasklane_core::{ApplyOptions, CacheStore, MutationClient, Reconciler, RemoteError, TaskApi};
use tasklane_types::{
    CreateTaskRequest, Label, ProtocolError, Task, TaskEvent, UpdateTaskRequest,
};

/// Service double that records every confirmed mutation as the push event
/// the server would broadcast for it.
#[derive(Default)]
struct EchoingApi {
    tasks: Mutex<Vec<Task>>,
    outbox: Mutex<Vec<TaskEvent>>,
}

impl EchoingApi {
    fn drain(&self) -> Vec<TaskEvent> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

#[async_trait]
impl TaskApi for EchoingApi {
    async fn list_tasks(&self) -> Result<Vec<Task>, RemoteError> {
        Ok(self.tasks.lock().clone())
    }

    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, RemoteError> {
        let label = Label::parse(request.label).map_err(|err| RemoteError::Status {
            status: 400,
            code: None,
            message: err.to_string(),
        })?;
        let task = Task::new("owner-1", label, request.image);
        self.tasks.lock().insert(0, task.clone());
        self.outbox.lock().push(TaskEvent::Created { task: task.clone() });
        Ok(task)
    }

    async fn update_task(
        &self,
        task_id: &str,
        request: UpdateTaskRequest,
    ) -> Result<Task, RemoteError> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                code: None,
                message: "not found".to_string(),
            })?;
        task.done = request.done;
        let task = task.clone();
        self.outbox.lock().push(TaskEvent::Updated { task: task.clone() });
        Ok(task)
    }

    async fn delete_task(&self, task_id: &str) -> Result<Task, RemoteError> {
        let mut tasks = self.tasks.lock();
        let index = tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                code: None,
                message: "not found".to_string(),
            })?;
        let task = tasks.remove(index);
        self.outbox.lock().push(TaskEvent::Deleted {
            task_id: task.id.clone(),
        });
        Ok(task)
    }
}

fn task(id: &str, label: &str) -> Task {
    Task {
        id: id.to_string(),
        label: label.to_string(),
        done: false,
        image: None,
        owner_id: "owner-1".to_string(),
    }
}

#[tokio::test]
async fn own_mutation_and_its_echo_leave_one_record() {
    let api = Arc::new(EchoingApi::default());
    let cache = CacheStore::new();
    let client = MutationClient::new(api.clone(), cache.clone());
    client.refresh().await.expect("initial load");
    let mut reconciler = Reconciler::new(cache.clone());

    let created = client.create("buy milk", None).await.expect("create");
    for event in api.drain() {
        reconciler.apply(event);
    }

    let tasks = cache.read().expect("loaded");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0], created);
    assert_eq!(tasks[0].label, "buy milk");
    assert!(!tasks[0].done);

    client.set_done(&created.id, true).await.expect("update");
    client.delete(&created.id).await.expect("delete");
    for event in api.drain() {
        reconciler.apply(event);
    }
    assert_eq!(cache.read(), Some(Vec::new()));
}

#[test]
fn update_and_delete_commute_to_absence() {
    let updated = TaskEvent::Updated {
        task: Task {
            done: true,
            ..task("x", "x")
        },
    };
    let deleted = TaskEvent::Deleted {
        task_id: "x".to_string(),
    };

    for order in [
        vec![updated.clone(), deleted.clone()],
        vec![deleted.clone(), updated.clone()],
    ] {
        let cache = CacheStore::new();
        cache.load(vec![task("x", "x"), task("y", "y")], ApplyOptions::suppressed());
        let mut reconciler = Reconciler::new(cache.clone());
        for event in order {
            reconciler.apply(event);
        }
        assert_eq!(cache.read(), Some(vec![task("y", "y")]));
    }
}

#[test]
fn foreign_session_events_merge_in_delivery_order() {
    let cache = CacheStore::new();
    cache.load(vec![task("a", "a")], ApplyOptions::suppressed());
    let mut reconciler = Reconciler::new(cache.clone());

    let messages = [
        json!({"type": "taskCreated", "task": {"id": "b", "label": "b", "done": false, "ownerId": "owner-1"}}),
        json!({"type": "taskUpdated", "task": {"id": "a", "label": "a", "done": true, "ownerId": "owner-1"}}),
        json!({"type": "taskCreated", "task": {"id": "c", "label": "c", "done": false, "ownerId": "owner-1"}}),
    ];
    for message in messages {
        reconciler
            .handle_message(&message.to_string())
            .expect("known event");
    }

    let tasks = cache.read().expect("loaded");
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "b", "a"]);
    assert!(tasks[2].done);
    assert_eq!(cache.revalidation_requests(), 0);
}

#[test]
fn unknown_event_stops_reconciliation() {
    let cache = CacheStore::new();
    cache.load(vec![task("a", "a")], ApplyOptions::suppressed());
    let mut reconciler = Reconciler::new(cache.clone());

    let err = reconciler
        .handle_message(r#"{"type":"taskMoved","taskId":"a"}"#)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownEventType { .. }));
    assert_eq!(cache.read(), Some(vec![task("a", "a")]));
}
