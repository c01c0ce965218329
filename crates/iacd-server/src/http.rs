use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use iacd_core::{DispatchError, LogStoreError, StoreError};
use iacd_types::{NewTask, TaskEvent, Template};

use crate::live_log::task_log_sse;
use crate::AppState;

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: &str) -> ApiError {
    (status, Json(json!({ "error": message, "code": code })))
}

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::TaskNotFound(_) | StoreError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidTransition { .. } | StoreError::RevisionConflict { .. } => {
            StatusCode::CONFLICT
        }
        StoreError::Persist(_) | StoreError::Load(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let code = match &err {
        StoreError::TaskNotFound(_) => "TASK_NOT_FOUND",
        StoreError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
        StoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
        StoreError::RevisionConflict { .. } => "REVISION_CONFLICT",
        StoreError::Persist(_) | StoreError::Load(_) => "STORE_FAILED",
    };
    api_error(status, code, &err.to_string())
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let recovered = state.recover_running_tasks().await;
    tracing::info!(recovered, "listening on {addr}");
    let shutdown = state.shutdown.clone();
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        })
        .await;
    shutdown.cancel();
    result?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/event", get(events))
        .route("/template/{guid}", put(put_template).get(get_template))
        .route("/task", post(create_task))
        .route("/task/log/sse", get(task_log_sse))
        .route("/task/{guid}", get(get_task))
        .route("/task/{guid}/sync", post(start_sync).delete(cancel_sync))
        .route("/task/{guid}/log", get(get_task_log))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let polls = state.polls.list().await;
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "activePolls": polls.len(),
        "droppedNotifications": state.notifier.dropped(),
    }))
}

async fn put_template(
    State(state): State<AppState>,
    Path(guid): Path<String>,
    Json(mut template): Json<Template>,
) -> Result<Json<Template>, ApiError> {
    let guid = guid.trim().to_string();
    if guid.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_TEMPLATE_ID",
            "Template id must not be empty",
        ));
    }
    template.guid = guid;
    let stored = state.store.put_template(template).await.map_err(store_error)?;
    Ok(Json(stored))
}

async fn get_template(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Template>, ApiError> {
    state.store.get_template(&guid).await.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "TEMPLATE_NOT_FOUND",
            "Template not found",
        )
    })
}

#[derive(Debug, Deserialize)]
struct CreateTaskInput {
    #[serde(rename = "templateId")]
    template_id: String,
    #[serde(flatten)]
    task: NewTask,
}

async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTaskInput>,
) -> Result<Response, ApiError> {
    let template = state
        .store
        .get_template(&input.template_id)
        .await
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "TEMPLATE_NOT_FOUND",
                "Template not found",
            )
        })?;
    let task = state
        .store
        .create_task(&template.guid, input.task)
        .await
        .map_err(store_error)?;

    match state.dispatcher.dispatch(&task, &template).await {
        Ok(running) => {
            if let Err(existing) = state.spawn_poll(&running.guid).await {
                tracing::warn!(task_id = %running.guid, poll_id = %existing.poll_id, "poll already active");
            }
            Ok((StatusCode::CREATED, Json(running)).into_response())
        }
        Err(DispatchError::Submission { task, reason }) => Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": reason,
                "code": "TASK_SUBMISSION_FAILED",
                "task": task,
            })),
        )
            .into_response()),
        Err(DispatchError::InvalidState { guid, status }) => Err(api_error(
            StatusCode::CONFLICT,
            "TASK_NOT_PENDING",
            &format!("Task {guid} is {status}"),
        )),
        Err(DispatchError::Persist {
            guid,
            handle,
            source,
        }) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": source.to_string(),
                "code": "TASK_DISPATCH_NOT_STORED",
                "taskId": guid,
                "containerId": handle,
            })),
        )
            .into_response()),
        Err(DispatchError::Store(err)) => Err(store_error(err)),
    }
}

async fn get_task(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_task(&guid)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", "Task not found"))?;
    let poll = state.polls.get(&guid).await;
    let mut payload = serde_json::to_value(&task).unwrap_or_else(|_| json!({}));
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("activePoll".to_string(), json!(poll));
    }
    Ok(Json(payload))
}

async fn start_sync(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Response, ApiError> {
    let task = state
        .store
        .get_task(&guid)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", "Task not found"))?;
    if task.exited() {
        return Err(api_error(
            StatusCode::CONFLICT,
            "TASK_FINISHED",
            &format!("Task already finished with status {}", task.status),
        ));
    }
    if !task.started() {
        return Err(api_error(
            StatusCode::CONFLICT,
            "TASK_NOT_STARTED",
            "Task has not been started",
        ));
    }
    match state.spawn_poll(&guid).await {
        Ok(poll) => Ok((StatusCode::ACCEPTED, Json(json!(poll))).into_response()),
        Err(existing) => Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Task is already being polled",
                "code": "POLL_ALREADY_ACTIVE",
                "activePoll": existing,
                "retryAfterMs": 1000,
            })),
        )
            .into_response()),
    }
}

async fn cancel_sync(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let poll = state.polls.cancel(&guid).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NO_ACTIVE_POLL",
            "Task has no active poll",
        )
    })?;
    Ok(Json(json!({ "cancelled": true, "activePoll": poll })))
}

async fn get_task_log(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Response, ApiError> {
    let task = state
        .store
        .get_task(&guid)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", "Task not found"))?;
    let log_file = task
        .backend_info
        .require_log_file()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "LOG_NOT_FOUND", "Task has no log"))?;
    match state.logs.read(log_file).await {
        Ok(bytes) => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            bytes,
        )
            .into_response()),
        Err(LogStoreError::NotFound(_)) => Err(api_error(
            StatusCode::NOT_FOUND,
            "LOG_NOT_FOUND",
            "Task has no log",
        )),
        Err(err) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "LOG_READ_FAILED",
            &err.to_string(),
        )),
    }
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(event_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn event_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let rx = state.event_bus.subscribe();
    let hello = TaskEvent::new("server.connected", json!({}));
    let initial = tokio_stream::once(Ok::<_, Infallible>(
        Event::default().data(serde_json::to_string(&hello).unwrap_or_default()),
    ));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if let Some(task_id) = filter.task_id.as_deref() {
                if event.task_guid() != Some(task_id) {
                    return None;
                }
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}
