use std::future::Future;
use std::time::Duration;

use tasklane_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tasklane_types::ProtocolError;
use tokio::task::JoinHandle;
use tracing::Level;
use uuid::Uuid;

use crate::error::PushError;
use crate::mutation_client::MutationClient;
use crate::push_channel::PushChannel;
use crate::reconciler::Reconciler;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub push_url: String,
    pub token: Option<String>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(push_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            push_url: push_url.into(),
            token,
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
        }
    }
}

/// Keeps one push connection alive and the cache converged with the server.
///
/// Every (re)connect runs a full bulk read and starts a fresh `Reconciler`.
/// Transport failures reconnect with capped exponential backoff; protocol
/// violations end the session with an error.
pub struct ClientSession {
    id: String,
    client: MutationClient,
    config: SessionConfig,
}

impl ClientSession {
    pub fn new(client: MutationClient, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &MutationClient {
        &self.client
    }

    /// Runs until `shutdown` resolves or a protocol violation occurs.
    pub async fn run<S>(&self, shutdown: S) -> Result<(), ProtocolError>
    where
        S: Future<Output = ()>,
    {
        let worker = RevalidationWorker::spawn(self.client.clone());
        tokio::pin!(shutdown);
        let mut backoff = self.config.reconnect_initial;
        let result = loop {
            let mut connected = false;
            let outcome = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                outcome = self.follow_once(&mut connected) => outcome,
            };
            if connected {
                backoff = self.config.reconnect_initial;
            }
            match outcome {
                Ok(()) => {
                    self.emit(Level::INFO, "push.closed", None);
                }
                Err(PushError::Protocol(err)) => {
                    let detail = err.to_string();
                    self.emit(Level::ERROR, "push.protocol_error", Some(&detail));
                    break Err(err);
                }
                Err(PushError::Transport(detail)) => {
                    self.emit(Level::WARN, "push.transport_error", Some(&detail));
                }
            }
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.reconnect_max);
        };
        worker.stop();
        result
    }

    async fn follow_once(&self, connected: &mut bool) -> Result<(), PushError> {
        let mut channel =
            PushChannel::connect(&self.config.push_url, self.config.token.as_deref()).await?;
        *connected = true;
        // Events are not replayed across connections; resync before following.
        self.client
            .refresh()
            .await
            .map_err(|err| PushError::Transport(format!("resync failed: {err}")))?;
        self.emit(Level::INFO, "push.connected", None);

        let mut reconciler = Reconciler::new(self.client.cache().clone());
        while let Some(raw) = channel.next_message().await? {
            reconciler.handle_message(&raw)?;
        }
        Ok(())
    }

    fn emit(&self, level: Level, event: &str, detail: Option<&str>) {
        emit_event(
            level,
            ProcessKind::Client,
            ObservabilityEvent {
                event,
                component: "client.session",
                session_id: Some(self.id.as_str()),
                detail,
                ..Default::default()
            },
        );
    }
}

/// Serves revalidation requests with bulk reads. A read that raced a newer
/// local write is dropped; the write's own request triggers another read.
struct RevalidationWorker {
    handle: JoinHandle<()>,
}

impl RevalidationWorker {
    fn spawn(client: MutationClient) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                client.cache().revalidation_requested().await;
                let started = client.cache().version();
                match client.list().await {
                    Ok(tasks) => {
                        if !client.cache().load_if_version(started, tasks) {
                            tracing::debug!("discarding stale revalidation result");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "revalidation read failed");
                    }
                }
            }
        });
        Self { handle }
    }

    fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for RevalidationWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::CacheStore;
    use crate::mutation_client::fake::FakeTaskApi;
    use std::sync::Arc;
    use tasklane_types::{Label, Task};

    #[tokio::test]
    async fn revalidation_worker_loads_server_state() {
        let api = Arc::new(FakeTaskApi::default());
        let server_task = Task::new("u1", Label::parse("from server").expect("label"), None);
        api.tasks.lock().push(server_task.clone());
        let cache = CacheStore::new();
        let client = MutationClient::new(api.clone(), cache.clone());

        let worker = RevalidationWorker::spawn(client);
        let mut changes = cache.subscribe();
        cache.request_revalidation();
        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .expect("revalidation finishes")
            .expect("sender alive");
        assert_eq!(cache.read(), Some(vec![server_task]));
        worker.stop();
    }

    #[tokio::test]
    async fn unreachable_server_retries_until_shutdown() {
        let api = Arc::new(FakeTaskApi::default());
        let client = MutationClient::new(api, CacheStore::new());
        let mut config = SessionConfig::new("ws://127.0.0.1:9/ws", None);
        config.reconnect_initial = Duration::from_millis(5);
        config.reconnect_max = Duration::from_millis(20);
        let session = ClientSession::new(client, config);

        let result = session
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(result.is_ok());
        assert!(!session.client().cache().is_initialized());
    }
}
