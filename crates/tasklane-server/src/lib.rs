use std::collections::HashMap;
use std::sync::Arc;

use tasklane_core::EventBus;
use tasklane_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tasklane_store::{Database, Provisioner, TaskRepository};
use tasklane_types::{TaskEvent, UserDto};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::Level;

pub mod auth;
pub mod health;
mod http;

pub use auth::{AuthedUser, IdentityVerifier, StaticTokenVerifier};
pub use health::{DatabaseProbe, HealthProbe, ObjectStoreProbe};
pub use http::{app_router, serve, serve_with_shutdown};

/// A task event tagged with the owner whose sessions should receive it.
#[derive(Debug, Clone)]
pub struct TaskBroadcast {
    pub owner_id: String,
    pub event: TaskEvent,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tasks: TaskRepository,
    pub provisioner: Provisioner,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub event_bus: EventBus<TaskBroadcast>,
    pub db_probe: Arc<dyn HealthProbe>,
    pub object_store_probe: Arc<dyn HealthProbe>,
    pub provisioned: Arc<RwLock<HashMap<String, UserDto>>>,
    write_order: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl AppState {
    pub fn new(
        db: Database,
        provisioner: Provisioner,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            tasks: TaskRepository::new(db.clone()),
            db_probe: Arc::new(DatabaseProbe::new(db.clone())),
            object_store_probe: Arc::new(ObjectStoreProbe::new(None)),
            db,
            provisioner,
            verifier,
            event_bus: EventBus::new(),
            provisioned: Arc::new(RwLock::new(HashMap::new())),
            write_order: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_bus = EventBus::with_capacity(capacity);
        self
    }

    pub fn with_object_store_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.object_store_probe = probe;
        self
    }

    pub fn with_db_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.db_probe = probe;
        self
    }

    /// Held from a write's commit until its event is published, so one
    /// owner's events go out in commit order.
    pub(crate) async fn lock_writes(&self, owner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.write_order.lock().await;
            locks.entry(owner_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn publish(&self, owner_id: &str, event: TaskEvent) {
        let task_id = event.task_id().to_string();
        let event_type = event.event_type();
        let reached = self.event_bus.publish(TaskBroadcast {
            owner_id: owner_id.to_string(),
            event,
        });
        let detail = format!("{event_type} reached {reached} subscriber(s)");
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "task.published",
                component: "server.publish",
                user_id: Some(owner_id),
                task_id: Some(&task_id),
                detail: Some(&detail),
                ..Default::default()
            },
        );
    }
}
