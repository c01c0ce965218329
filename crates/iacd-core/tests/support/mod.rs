#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use iacd_core::{
    EventBus, NotificationSink, Notifier, PollerConfig, StatusPoller, TaskStore, TracingSink,
};
use iacd_core::{FileLogStore, LogStorage};
use iacd_runner::{RunnerClient, RunnerConfig};
use iacd_types::{task_log_path, NewTask, Task, TaskSource, TaskStatus, TaskType, Template};

#[derive(Debug, Clone)]
pub enum RunReply {
    Accept(String),
    Reject { code: String, err: String },
    HttpError(u16),
}

/// What the fake does with one status connection.
#[derive(Debug, Clone)]
pub enum StatusScript {
    /// Send the frames, then end the connection as described.
    Frames(Vec<Value>, AfterFrames),
    /// Accept the upgrade and drop the socket without a close frame.
    Reset,
}

#[derive(Debug, Clone, Copy)]
pub enum AfterFrames {
    CloseNormal,
    CloseError,
    /// Keep the socket open until the client closes it.
    Hold,
}

#[derive(Default)]
struct FakeState {
    run_reply: Mutex<Option<RunReply>>,
    submissions: Mutex<Vec<Value>>,
    scripts: Mutex<VecDeque<StatusScript>>,
    last_script: Mutex<Option<StatusScript>>,
    status_queries: Mutex<Vec<HashMap<String, String>>>,
    status_connects: AtomicUsize,
}

pub struct FakeRunner {
    pub base_url: String,
    state: Arc<FakeState>,
}

impl FakeRunner {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/task/run", post(run_task))
            .route("/task/status", get(task_status))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake runner");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn reply_with(&self, reply: RunReply) {
        *self.state.run_reply.lock().expect("lock") = Some(reply);
    }

    /// Queues scripts for successive status connections. The last one repeats.
    pub fn script(&self, scripts: Vec<StatusScript>) {
        let mut queue = self.state.scripts.lock().expect("lock");
        queue.clear();
        queue.extend(scripts);
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.state.submissions.lock().expect("lock").clone()
    }

    pub fn status_queries(&self) -> Vec<HashMap<String, String>> {
        self.state.status_queries.lock().expect("lock").clone()
    }

    pub fn status_connects(&self) -> usize {
        self.state.status_connects.load(Ordering::SeqCst)
    }
}

async fn run_task(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    state.submissions.lock().expect("lock").push(body);
    let reply = state
        .run_reply
        .lock()
        .expect("lock")
        .clone()
        .unwrap_or(RunReply::Accept("c-default".into()));
    match reply {
        RunReply::Accept(id) => Json(json!({ "id": id })).into_response(),
        RunReply::Reject { code, err } => Json(json!({ "code": code, "err": err })).into_response(),
        RunReply::HttpError(status) => (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "runner failure",
        )
            .into_response(),
    }
}

async fn task_status(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    state.status_connects.fetch_add(1, Ordering::SeqCst);
    state.status_queries.lock().expect("lock").push(query);
    let script = {
        let next = state.scripts.lock().expect("lock").pop_front();
        let mut last = state.last_script.lock().expect("lock");
        match next {
            Some(script) => {
                *last = Some(script.clone());
                script
            }
            None => last
                .clone()
                .unwrap_or(StatusScript::Frames(Vec::new(), AfterFrames::CloseNormal)),
        }
    };
    ws.on_upgrade(move |socket| play(socket, script))
}

async fn play(mut socket: WebSocket, script: StatusScript) {
    let (frames, after) = match script {
        StatusScript::Reset => return,
        StatusScript::Frames(frames, after) => (frames, after),
    };
    for frame in frames {
        if socket
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }
    match after {
        AfterFrames::CloseNormal => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "".into(),
                })))
                .await;
        }
        AfterFrames::CloseError => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "runner failure".into(),
                })))
                .await;
        }
        AfterFrames::Hold => while let Some(Ok(_)) = socket.recv().await {},
    }
}

pub fn status_frame(status: &str, code: i64, lines: &[&str]) -> Value {
    json!({
        "status": status,
        "statusCode": code,
        "log_content": lines,
        "log_content_lines": lines.len(),
    })
}

pub fn runner_client(base_url: &str) -> RunnerClient {
    RunnerClient::new(RunnerConfig {
        url: base_url.to_string(),
        request_timeout_secs: 5,
        ..RunnerConfig::default()
    })
    .expect("runner client")
}

pub fn fast_poller_config() -> PollerConfig {
    PollerConfig {
        max_retries: 2,
        retry_step_ms: 10,
        retry_cap_ms: 20,
        deadline_grace_ms: 300,
    }
}

pub fn notifier() -> Notifier {
    let sink: Arc<dyn NotificationSink> = Arc::new(TracingSink);
    Notifier::start(vec![sink], 16, 1)
}

pub struct PollerFixture {
    pub store: Arc<TaskStore>,
    pub logs: Arc<dyn LogStorage>,
    pub poller: StatusPoller,
    pub events: EventBus,
    _dir: tempfile::TempDir,
}

impl PollerFixture {
    pub async fn new(runner: &FakeRunner, config: PollerConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs: Arc<dyn LogStorage> = Arc::new(FileLogStore::new(dir.path().join("logs")));
        Self::with_logs(runner, config, logs, dir).await
    }

    pub async fn with_logs(
        runner: &FakeRunner,
        config: PollerConfig,
        logs: Arc<dyn LogStorage>,
        dir: tempfile::TempDir,
    ) -> Self {
        let store = Arc::new(TaskStore::in_memory());
        store
            .put_template(Template::new(
                "tpl-1",
                "org-1",
                "https://git.example.com/infra.git",
            ))
            .await
            .expect("template");
        let events = EventBus::new();
        let poller = StatusPoller::new(
            store.clone(),
            logs.clone(),
            runner_client(&runner.base_url),
            events.clone(),
            notifier(),
            config,
        );
        Self {
            store,
            logs,
            poller,
            events,
            _dir: dir,
        }
    }

    /// Stores a task that the runner has already accepted.
    pub async fn running_task(&self, base_url: &str, timeout_secs: u64) -> Task {
        self.running_task_from(base_url, timeout_secs, TaskSource::Manual)
            .await
    }

    pub async fn running_task_from(
        &self,
        base_url: &str,
        timeout_secs: u64,
        source: TaskSource,
    ) -> Task {
        let mut task = self
            .store
            .create_task(
                "tpl-1",
                NewTask {
                    task_type: TaskType::Plan,
                    source,
                    transaction_id: Some("tx-1".into()),
                    commit_id: None,
                },
            )
            .await
            .expect("task");
        task.status = TaskStatus::Running;
        task.timeout_secs = timeout_secs;
        task.start_at = Some(chrono::Utc::now());
        task.backend_info.backend_url = Some(base_url.to_string());
        task.backend_info.container_id = Some("c-1".into());
        task.backend_info.log_file = Some(task_log_path(&task.template_guid, &task.guid));
        self.store.update_task(task).await.expect("running task")
    }

    pub async fn stored_log(&self, task: &Task) -> String {
        let path = task.backend_info.log_file.as_deref().expect("log file");
        String::from_utf8(self.logs.read(path).await.expect("log")).expect("utf8")
    }
}
