use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tasklane_core::{
    CacheStore, ClientSession, HttpTaskApi, MutationClient, SessionConfig, TaskApi, TokenGrant,
};
use tasklane_server::{serve_with_shutdown, AppState, StaticTokenVerifier};
use tasklane_store::{Database, IsolationLevel, Provisioner};
use tasklane_types::{CreateTaskRequest, Task, TaskEvent, UpdateTaskRequest};
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const TOKEN: &str = "alice-token";

struct TestServer {
    base_url: String,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|state| state).await
    }

    async fn start_with(configure: impl FnOnce(AppState) -> AppState) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let db = Database::open(dir.path().join("tasks.db")).expect("open");
        let provisioner =
            Provisioner::new(db.clone(), IsolationLevel::Serializable).expect("provisioner");
        let verifier = Arc::new(StaticTokenVerifier::new(vec![TokenGrant {
            token: TOKEN.to_string(),
            sub: "alice".to_string(),
            email: "alice@example.com".to_string(),
            sign_in_name: "alice".to_string(),
        }]));
        let state = configure(AppState::new(db, provisioner, verifier));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve_with_shutdown(listener, state.clone(), async move {
            let _ = rx.await;
        }));
        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown: Some(tx),
            handle,
            _dir: dir,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

struct ConnectedClient {
    client: MutationClient,
    stop: Option<oneshot::Sender<()>>,
    session: JoinHandle<Result<(), tasklane_types::ProtocolError>>,
}

impl ConnectedClient {
    async fn connect(base_url: &str) -> Self {
        let api = HttpTaskApi::new(base_url, Some(TOKEN.to_string()));
        let push_url = api.push_url();
        let client = MutationClient::new(Arc::new(api), CacheStore::new());
        let session = ClientSession::new(
            client.clone(),
            SessionConfig::new(push_url, Some(TOKEN.to_string())),
        );
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            session
                .run(async move {
                    let _ = rx.await;
                })
                .await
        });
        let connected = Self {
            client,
            stop: Some(tx),
            session: handle,
        };
        // The session resyncs right after the push channel is up.
        connected.wait_for(|tasks| tasks.is_some()).await;
        connected
    }

    async fn wait_for(&self, done: impl Fn(Option<&[Task]>) -> bool) {
        let cache = self.client.cache();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let tasks = cache.read();
                if done(tasks.as_deref()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cache converged in time");
    }

    async fn close(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let result = self.session.await.expect("session task");
        assert!(result.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_round_trips_and_fans_out_without_duplicates() {
    let server = TestServer::start().await;
    let writer = ConnectedClient::connect(&server.base_url).await;
    let watcher = ConnectedClient::connect(&server.base_url).await;

    let created = writer
        .client
        .create("buy milk", None)
        .await
        .expect("create");

    let id = created.id.clone();
    watcher
        .wait_for(|tasks| tasks.is_some_and(|t| t.iter().any(|task| task.id == id)))
        .await;

    // Give the writer's own echo and revalidation time to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let tasks = writer.client.cache().read().expect("loaded");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].label, "buy milk");
    assert!(!tasks[0].done);

    watcher
        .client
        .set_done(&created.id, true)
        .await
        .expect("update");
    writer
        .wait_for(|tasks| tasks.is_some_and(|t| t.len() == 1 && t[0].done))
        .await;

    writer.client.delete(&created.id).await.expect("delete");
    watcher
        .wait_for(|tasks| tasks.is_some_and(|t| t.is_empty()))
        .await;

    writer.close().await;
    watcher.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn watcher_converges_under_concurrent_updates() {
    let server = TestServer::start().await;
    let watcher = ConnectedClient::connect(&server.base_url).await;
    let api = Arc::new(HttpTaskApi::new(&server.base_url, Some(TOKEN.to_string())));
    let created = api
        .create_task(CreateTaskRequest {
            label: "flip".to_string(),
            image: None,
        })
        .await
        .expect("create");

    for round in 0..20 {
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let api = api.clone();
                let id = created.id.clone();
                tokio::spawn(async move {
                    api.update_task(&id, UpdateTaskRequest { done: (round + i) % 2 == 0 })
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.expect("writer").expect("update");
        }
        let truth = api.list_tasks().await.expect("list")[0].done;
        watcher
            .wait_for(|tasks| tasks.is_some_and(|t| t.len() == 1 && t[0].done == truth))
            .await;
    }

    // Nothing stale may land after the last round settled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let truth = api.list_tasks().await.expect("list");
    assert_eq!(watcher.client.cache().read(), Some(truth));

    watcher.close().await;
    server.stop().await;
}

#[tokio::test]
async fn lagging_subscriber_is_closed_with_try_again() {
    let server = TestServer::start_with(|state| state.with_event_buffer(1)).await;
    let url = format!("{}/ws?token={TOKEN}", server.base_url.replacen("http", "ws", 1));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");

    // The server-side stream only runs when this task yields, so these all
    // land in its one-slot buffer before it reads any.
    for n in 0..4 {
        server.state.publish(
            "alice",
            TaskEvent::Deleted {
                task_id: format!("t{n}"),
            },
        );
    }

    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("closed in time")
    .expect("close frame");
    assert_eq!(frame.code, CloseCode::Again);
    assert_eq!(frame.reason, "lagged");

    server.stop().await;
}

#[tokio::test]
async fn health_and_identity_over_http() {
    let server = TestServer::start().await;
    let api = HttpTaskApi::new(&server.base_url, Some(TOKEN.to_string()));

    let report = api.health().await.expect("health");
    assert_eq!(
        serde_json::to_value(report).expect("json"),
        serde_json::json!({"server": "ok", "db": "ok", "s3": "ok"})
    );
    let me = api.me().await.expect("me");
    assert_eq!(me.id, "alice");
    assert_eq!(api.me().await.expect("me again"), me);

    let anonymous = HttpTaskApi::new(&server.base_url, None);
    let err = tasklane_core::TaskApi::list_tasks(&anonymous)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(401));

    server.stop().await;
}
