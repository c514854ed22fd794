use std::future::Future;
use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tasklane_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use tasklane_store::{ProvisionError, StoreError};
use tasklane_types::{
    CreateTaskRequest, ErrorEnvelope, HealthReport, HealthStatus, Label, Task, TaskEvent,
    UpdateTaskRequest, UserDto,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tracing::Level;

use crate::auth::AuthedUser;
use crate::{AppState, TaskBroadcast};

type ApiError = (StatusCode, Json<ErrorEnvelope>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (status, Json(ErrorEnvelope::new(error, code)))
}

fn store_error(err: StoreError) -> ApiError {
    tracing::error!(error = %err, "task store failure");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
        "STORE_ERROR",
    )
}

fn task_not_found(task_id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        format!("task {task_id} not found"),
        "TASK_NOT_FOUND",
    )
}

/// Runs a blocking store call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(store_error),
        Err(err) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "INTERNAL_ERROR",
        )),
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tasklane server listening");
    serve_with_shutdown(listener, state, async {
        if tokio::signal::ctrl_c().await.is_err() {
            futures::future::pending::<()>().await;
        }
    })
    .await
}

pub async fn serve_with_shutdown<S>(
    listener: TcpListener,
    state: AppState,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app = app_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/me", get(me))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", patch(update_task).delete(delete_task))
        .route("/ws", get(push_ws))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS || request.uri().path() == "/health" {
        return next.run(request).await;
    }

    // Browsers cannot set headers on a WebSocket handshake, so the query
    // string is accepted as a fallback.
    let provided = extract_request_token(request.headers()).or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.token)
            .filter(|token| !token.trim().is_empty())
    });
    let identity = match provided {
        Some(token) => {
            let identity = state.verifier.verify(&token).await;
            if identity.is_none() {
                tracing::warn!(token = %redact_text(&token), "rejected unknown token");
            }
            identity
        }
        None => None,
    };
    let Some(identity) = identity else {
        return api_error(
            StatusCode::UNAUTHORIZED,
            "Unauthorized: missing or invalid token",
            "AUTH_REQUIRED",
        )
        .into_response();
    };

    let user = match provisioned_user(&state, &identity).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    request.extensions_mut().insert(AuthedUser { identity, user });
    next.run(request).await
}

async fn provisioned_user(
    state: &AppState,
    identity: &tasklane_types::Identity,
) -> Result<UserDto, ApiError> {
    if let Some(user) = state.provisioned.read().await.get(&identity.sub) {
        return Ok(user.clone());
    }

    let provisioner = state.provisioner.clone();
    let claims = identity.clone();
    let result = tokio::task::spawn_blocking(move || provisioner.provision_with_retry(&claims))
        .await
        .map_err(|err| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                "INTERNAL_ERROR",
            )
        })?;

    match result {
        Ok(user) => {
            emit_event(
                Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "user.provisioned",
                    component: "server.auth",
                    user_id: Some(&user.id),
                    status: Some("ok"),
                    ..Default::default()
                },
            );
            state
                .provisioned
                .write()
                .await
                .insert(identity.sub.clone(), user.clone());
            Ok(user)
        }
        Err(err @ ProvisionError::Conflict { .. }) => {
            let detail = err.to_string();
            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "user.provision_conflict",
                    component: "server.auth",
                    user_id: Some(&identity.sub),
                    error_code: Some("PROVISIONING_CONFLICT"),
                    detail: Some(&detail),
                    ..Default::default()
                },
            );
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                detail,
                "PROVISIONING_CONFLICT",
            ))
        }
        Err(err) => {
            tracing::error!(error = %err, "user provisioning failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                "PROVISIONING_FAILED",
            ))
        }
    }
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-tasklane-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthReport>, ApiError> {
    if let Err(msg) = state.db_probe.check().await {
        tracing::error!(error = %msg, "database health check failed");
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("DB {msg}"),
            "HEALTH_CHECK_FAILED",
        ));
    }
    if let Err(msg) = state.object_store_probe.check().await {
        tracing::error!(error = %msg, "object store health check failed");
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("S3 {msg}"),
            "HEALTH_CHECK_FAILED",
        ));
    }
    Ok(Json(HealthReport {
        server: HealthStatus::Ok,
        db: HealthStatus::Ok,
        s3: HealthStatus::Ok,
    }))
}

async fn me(Extension(authed): Extension<AuthedUser>) -> Json<UserDto> {
    Json(authed.user)
}

async fn list_tasks(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.tasks.clone();
    let owner_id = authed.user.id;
    let listed = blocking(move || tasks.list(&owner_id)).await?;
    Ok(Json(listed))
}

async fn create_task(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(input): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let label = Label::parse(input.label)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string(), "VALIDATION_ERROR"))?;
    let task = Task::new(authed.id(), label, input.image);

    let tasks = state.tasks.clone();
    let created = commit_then_publish(
        &state,
        authed.id(),
        move || tasks.insert(&task).map(|()| Some(task)),
        |task| TaskEvent::Created { task: task.clone() },
    )
    .await?
    .ok_or_else(|| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "task was not stored",
            "INTERNAL_ERROR",
        )
    })?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_task(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Path(id): Path<String>,
    Json(input): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let tasks = state.tasks.clone();
    let owner_id = authed.user.id.clone();
    let task_id = id.clone();
    let updated = commit_then_publish(
        &state,
        authed.id(),
        move || tasks.set_done(&owner_id, &task_id, input.done),
        |task| TaskEvent::Updated { task: task.clone() },
    )
    .await?
    .ok_or_else(|| task_not_found(&id))?;
    Ok(Json(updated))
}

async fn delete_task(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let tasks = state.tasks.clone();
    let owner_id = authed.user.id.clone();
    let task_id = id.clone();
    let deleted = commit_then_publish(
        &state,
        authed.id(),
        move || tasks.delete(&owner_id, &task_id),
        |task| TaskEvent::Deleted {
            task_id: task.id.clone(),
        },
    )
    .await?
    .ok_or_else(|| task_not_found(&id))?;
    Ok(Json(deleted))
}

/// Commits `write` and publishes its event while holding the owner's write
/// lock, so events leave in commit order. Runs detached: a dropped request
/// still publishes what it committed.
async fn commit_then_publish<T, W, E>(
    state: &AppState,
    owner_id: &str,
    write: W,
    to_event: E,
) -> Result<Option<T>, ApiError>
where
    T: Send + 'static,
    W: FnOnce() -> Result<Option<T>, StoreError> + Send + 'static,
    E: FnOnce(&T) -> TaskEvent + Send + 'static,
{
    let state = state.clone();
    let owner_id = owner_id.to_string();
    let job = tokio::spawn(async move {
        let _order = state.lock_writes(&owner_id).await;
        let committed = blocking(write).await?;
        if let Some(row) = &committed {
            state.publish(&owner_id, to_event(row));
        }
        Ok::<_, ApiError>(committed)
    });
    match job.await {
        Ok(result) => result,
        Err(err) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
            "INTERNAL_ERROR",
        )),
    }
}

async fn push_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
) -> impl IntoResponse {
    // Subscribe before the handshake completes so nothing published after the
    // client sees the upgrade is missed.
    let rx = state.event_bus.subscribe();
    ws.on_upgrade(move |socket| push_stream(socket, rx, authed.user.id))
}

async fn push_stream(
    mut socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<TaskBroadcast>,
    owner_id: String,
) {
    emit_push_event(Level::INFO, "push.opened", &owner_id, None);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(TaskBroadcast { owner_id: target, event }) => {
                    if target != owner_id {
                        continue;
                    }
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::error!(error = %err, "failed to encode push event");
                            continue;
                        }
                    };
                    if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // The client resyncs on reconnect; a gap must not go unnoticed.
                    let detail = format!("subscriber lagged by {skipped} events");
                    emit_push_event(Level::WARN, "push.lagged", &owner_id, Some(&detail));
                    let _ = socket
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: close_code::AGAIN,
                            reason: "lagged".into(),
                        })))
                        .await;
                    break;
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    emit_push_event(Level::INFO, "push.closed", &owner_id, None);
}

fn emit_push_event(level: Level, event: &str, owner_id: &str, detail: Option<&str>) {
    emit_event(
        level,
        ProcessKind::Server,
        ObservabilityEvent {
            event,
            component: "server.push",
            user_id: Some(owner_id),
            detail,
            ..Default::default()
        },
    );
}
