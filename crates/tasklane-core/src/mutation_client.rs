use std::sync::Arc;

use async_trait::async_trait;
use tasklane_types::{CreateTaskRequest, Label, Task, TaskImage, UpdateTaskRequest};

use crate::cache_store::{ApplyOptions, CacheStore};
use crate::error::{ClientError, RemoteError};
use crate::merge::{prepend_dedup, remove_by_id, replace_by_id};

/// Request/response surface of the task service.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>, RemoteError>;
    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, RemoteError>;
    async fn update_task(&self, task_id: &str, request: UpdateTaskRequest)
        -> Result<Task, RemoteError>;
    async fn delete_task(&self, task_id: &str) -> Result<Task, RemoteError>;
}

/// Issues mutations and folds each confirmed result into the cache.
///
/// Failed calls never touch the cache and are never retried. Successful
/// results are applied with revalidation so a background bulk read follows.
#[derive(Clone)]
pub struct MutationClient {
    api: Arc<dyn TaskApi>,
    cache: CacheStore,
}

impl MutationClient {
    pub fn new(api: Arc<dyn TaskApi>, cache: CacheStore) -> Self {
        Self { api, cache }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub async fn list(&self) -> Result<Vec<Task>, RemoteError> {
        self.api.list_tasks().await
    }

    /// Bulk read that replaces the whole cache. Used for the initial load and
    /// for resync after a reconnect.
    pub async fn refresh(&self) -> Result<Vec<Task>, RemoteError> {
        let tasks = self.api.list_tasks().await?;
        self.cache.load(tasks.clone(), ApplyOptions::suppressed());
        Ok(tasks)
    }

    pub async fn create(
        &self,
        label: impl Into<String>,
        image: Option<TaskImage>,
    ) -> Result<Task, ClientError> {
        let label = Label::parse(label)?;
        let task = self
            .api
            .create_task(CreateTaskRequest {
                label: label.into_inner(),
                image,
            })
            .await?;
        let created = task.clone();
        self.cache.apply(
            move |tasks| prepend_dedup(tasks, created),
            ApplyOptions::revalidate(),
        );
        Ok(task)
    }

    pub async fn set_done(&self, task_id: &str, done: bool) -> Result<Task, ClientError> {
        let task = self
            .api
            .update_task(task_id, UpdateTaskRequest { done })
            .await?;
        self.cache
            .apply(|tasks| replace_by_id(tasks, &task), ApplyOptions::revalidate());
        Ok(task)
    }

    pub async fn toggle_done(&self, task: &Task) -> Result<Task, ClientError> {
        self.set_done(&task.id, !task.done).await
    }

    pub async fn delete(&self, task_id: &str) -> Result<Task, ClientError> {
        let task = self.api.delete_task(task_id).await?;
        self.cache
            .apply(|tasks| remove_by_id(tasks, &task.id), ApplyOptions::revalidate());
        Ok(task)
    }
}
