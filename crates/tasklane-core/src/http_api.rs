use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tasklane_types::{
    CreateTaskRequest, ErrorEnvelope, HealthReport, Task, UpdateTaskRequest, UserDto,
};

use crate::error::RemoteError;
use crate::mutation_client::TaskApi;

/// `TaskApi` over the service's REST endpoints.
#[derive(Clone)]
pub struct HttpTaskApi {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpTaskApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// WebSocket endpoint derived from the base url (`http` → `ws`).
    pub fn push_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ws")
    }

    pub async fn me(&self) -> Result<UserDto, RemoteError> {
        let resp = self.authed(self.client.get(self.url("/me"))).send().await?;
        decode(resp).await
    }

    pub async fn health(&self) -> Result<HealthReport, RemoteError> {
        let resp = self.client.get(self.url("/health")).send().await?;
        decode(resp).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(RemoteError::from);
    }
    let body = resp.text().await.unwrap_or_default();
    let (message, code) = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => (envelope.error, envelope.code),
        Err(_) if body.trim().is_empty() => (
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
            None,
        ),
        Err(_) => (body, None),
    };
    Err(RemoteError::Status {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn list_tasks(&self) -> Result<Vec<Task>, RemoteError> {
        let resp = self.authed(self.client.get(self.url("/tasks"))).send().await?;
        decode(resp).await
    }

    async fn create_task(&self, request: CreateTaskRequest) -> Result<Task, RemoteError> {
        let resp = self
            .authed(self.client.post(self.url("/tasks")))
            .json(&request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn update_task(
        &self,
        task_id: &str,
        request: UpdateTaskRequest,
    ) -> Result<Task, RemoteError> {
        let resp = self
            .authed(self.client.patch(self.url(&format!("/tasks/{task_id}"))))
            .json(&request)
            .send()
            .await?;
        decode(resp).await
    }

    async fn delete_task(&self, task_id: &str) -> Result<Task, RemoteError> {
        let resp = self
            .authed(self.client.delete(self.url(&format!("/tasks/{task_id}"))))
            .send()
            .await?;
        decode(resp).await
    }
}
