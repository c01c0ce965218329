//! Live task log over Server-Sent Events.
//!
//! Running tasks are followed through the runner's log-follow socket. A pump
//! task copies each frame into an in-memory pipe and the SSE stream reads
//! lines back out of it, so a client that disconnects only has to drop the
//! stream: the drop guard cancels the pump, which closes the runner socket.
//! Tasks that already exited are replayed from the log store.
//!
//! Runner frames go into the pipe unchanged and come out one line at a time:
//! every line is its own `message` event, so a frame carrying several lines
//! yields several consecutive ids.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use iacd_core::LogStoreError;
use iacd_runner::{LogFollowQuery, LogFollowStream, RunnerError};
use iacd_types::{task_guid_from_log_path, Task};

use crate::http::api_error;
use crate::AppState;

const PIPE_CAPACITY: usize = 64 * 1024;
const PENDING_BACKOFF_START: Duration = Duration::from_secs(1);
const PENDING_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub(crate) struct LiveLogQuery {
    #[serde(rename = "logPath")]
    log_path: Option<String>,
    #[serde(rename = "taskId")]
    task_id: Option<String>,
}

impl LiveLogQuery {
    fn task_guid(&self) -> Result<String, &'static str> {
        if let Some(task_id) = self.task_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            return Ok(task_id.to_string());
        }
        let log_path = self
            .log_path
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or("either logPath or taskId is required")?;
        task_guid_from_log_path(log_path)
            .map(str::to_string)
            .ok_or("logPath must look like logs/<template>/<task>")
    }
}

pub(crate) async fn task_log_sse(
    State(state): State<AppState>,
    Query(query): Query<LiveLogQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<Value>)> {
    let guid = query
        .task_guid()
        .map_err(|message| api_error(StatusCode::BAD_REQUEST, "INVALID_LOG_PATH", message))?;
    let task = state.store.get_task(&guid).await.ok_or_else(|| {
        api_error(StatusCode::NOT_FOUND, "TASK_NOT_FOUND", "Task not found")
    })?;
    debug!(task_id = %task.guid, status = %task.status, "live log requested");
    Ok(Sse::new(log_event_stream(state, task))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

fn message_event(id: u64, line: &str) -> Event {
    Event::default()
        .id(id.to_string())
        .event("message")
        .data(line.replace('\r', ""))
}

fn end_event() -> Event {
    Event::default().event("end").data("")
}

fn error_event(message: &str) -> Event {
    Event::default().event("error").data(message.replace('\r', ""))
}

fn log_event_stream(state: AppState, task: Task) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let Some(task) = wait_for_start(&state, task).await else {
            yield Ok(error_event("task no longer exists"));
            return;
        };

        if task.exited() {
            match stored_log(&state, &task).await {
                Ok(text) => {
                    for (id, line) in text.lines().enumerate() {
                        yield Ok(message_event(id as u64, line));
                    }
                    yield Ok(end_event());
                }
                Err(err) => {
                    warn!(task_id = %task.guid, "stored log unavailable: {err}");
                    yield Ok(error_event(&err.to_string()));
                }
            }
            return;
        }

        let follow = match open_follow(&state, &task).await {
            Ok(follow) => follow,
            Err(err) => {
                warn!(task_id = %task.guid, "cannot follow runner log: {err}");
                yield Ok(error_event(&err.to_string()));
                return;
            }
        };

        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let _pump_guard = cancel.clone().drop_guard();
        let pump = tokio::spawn(pump_log(follow, writer, cancel));

        let mut lines = BufReader::new(reader).lines();
        let mut id = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    yield Ok(message_event(id, &line));
                    id += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    yield Ok(error_event(&err.to_string()));
                    return;
                }
            }
        }

        match pump.await {
            Ok(Ok(())) => {
                yield Ok(end_event());
            }
            Ok(Err(err)) => {
                warn!(task_id = %task.guid, "runner log stream failed: {err}");
                yield Ok(error_event(&err.to_string()));
            }
            Err(err) => {
                yield Ok(error_event(&err.to_string()));
            }
        }
    }
}

/// Re-reads the task with a growing delay until it leaves `pending`.
async fn wait_for_start(state: &AppState, mut task: Task) -> Option<Task> {
    let mut delay = PENDING_BACKOFF_START;
    while !task.started() {
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(PENDING_BACKOFF_MAX);
        task = state.store.get_task(&task.guid).await?;
    }
    Some(task)
}

/// Log of a finished task. A task that never produced output has none.
async fn stored_log(state: &AppState, task: &Task) -> Result<String, LogStoreError> {
    let Ok(log_file) = task.backend_info.require_log_file() else {
        return Ok(String::new());
    };
    match state.logs.read(log_file).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(LogStoreError::NotFound(_)) => Ok(String::new()),
        Err(err) => Err(err),
    }
}

async fn open_follow(state: &AppState, task: &Task) -> Result<LogFollowStream, String> {
    let backend_url = task
        .backend_info
        .require_backend_url()
        .map_err(|err| err.to_string())?;
    let query = LogFollowQuery {
        task_id: task.guid.clone(),
        template_id: task.template_guid.clone(),
        container_id: task.backend_info.container_id.clone(),
    };
    state
        .runner
        .open_log_follow(backend_url, &query)
        .await
        .map_err(|err| err.to_string())
}

/// Copies runner frames into `writer` until the runner stops, fails, or
/// `cancel` fires. Dropping the writer is the end-of-log signal.
async fn pump_log(
    mut follow: LogFollowStream,
    mut writer: DuplexStream,
    cancel: CancellationToken,
) -> Result<(), RunnerError> {
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = follow.next_line() => next,
        };
        match next {
            None => break Ok(()),
            Some(Err(err)) => break Err(err),
            Some(Ok(mut line)) => {
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break Ok(());
                }
            }
        }
    };
    drop(writer);
    follow.close().await;
    result
}
