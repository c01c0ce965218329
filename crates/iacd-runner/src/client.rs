use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::{LogFollowQuery, RunTaskRequest, RunTaskResponse, RunnerError, StatusQuery};
use crate::ws::{runner_url, websocket_url, LogFollowStream, StatusStream};

pub const DEFAULT_RUNNER_URL: &str = "http://127.0.0.1:19030";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Base url handed to new tasks as `backend_url`.
    pub url: String,
    pub run_path: String,
    pub status_path: String,
    pub log_follow_path: String,
    pub request_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RUNNER_URL.to_string(),
            run_path: "/task/run".to_string(),
            status_path: "/task/status".to_string(),
            log_follow_path: "/task/log/follow".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Thin adapter over the runner's HTTP and WebSocket endpoints. Cheap to
/// clone.
#[derive(Clone)]
pub struct RunnerClient {
    http: Client,
    config: Arc<RunnerConfig>,
}

impl RunnerClient {
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Submits a job and returns the runner-assigned handle.
    pub async fn submit(
        &self,
        base_url: &str,
        request: &RunTaskRequest,
    ) -> Result<String, RunnerError> {
        let url = runner_url(base_url, &self.config.run_path, &[])?;
        info!(task_id = %request.task_id, "runner: submitting task to {url}");
        let resp = self.http.post(url).json(request).send().await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(RunnerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(task_id = %request.task_id, "runner: response {body}");
        let parsed: RunTaskResponse = serde_json::from_str(&body)?;
        parsed.into_handle()
    }

    pub async fn open_status_stream(
        &self,
        base_url: &str,
        query: &StatusQuery,
    ) -> Result<StatusStream, RunnerError> {
        let url = websocket_url(base_url, &self.config.status_path, &query.params())?;
        debug!(task_id = %query.task_id, "runner: connecting status stream {url}");
        let (socket, _) =
            tokio::time::timeout(self.connect_timeout(), tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| RunnerError::ConnectTimeout(url.to_string()))??;
        Ok(StatusStream::new(socket))
    }

    pub async fn open_log_follow(
        &self,
        base_url: &str,
        query: &LogFollowQuery,
    ) -> Result<LogFollowStream, RunnerError> {
        let url = websocket_url(base_url, &self.config.log_follow_path, &query.params())?;
        debug!(task_id = %query.task_id, "runner: connecting log follow {url}");
        let (socket, _) =
            tokio::time::timeout(self.connect_timeout(), tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| RunnerError::ConnectTimeout(url.to_string()))??;
        Ok(LogFollowStream::new(socket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StateStore;
    use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocketUpgrade};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    async fn spawn_runner(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client() -> RunnerClient {
        RunnerClient::new(RunnerConfig {
            request_timeout_secs: 5,
            ..RunnerConfig::default()
        })
        .expect("client")
    }

    fn request() -> RunTaskRequest {
        RunTaskRequest {
            repo: "https://git.example.com/infra.git".into(),
            repo_branch: "master".into(),
            repo_commit: None,
            template_uuid: "tpl-1".into(),
            task_id: "run-1".into(),
            state_store: StateStore {
                save_state: false,
                backend: "consul".into(),
                scheme: "http".into(),
                state_key: "org/tpl-1/run-1.tfstate".into(),
                state_backend_address: "127.0.0.1:8500".into(),
                lock: true,
            },
            env: BTreeMap::new(),
            varfile: None,
            mode: "plan".into(),
            extra: Value::Null,
            playbook: None,
            workdir: String::new(),
        }
    }

    #[tokio::test]
    async fn submit_returns_runner_handle() {
        let app = Router::new().route(
            "/task/run",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["task_id"], "run-1");
                assert_eq!(body["mode"], "plan");
                Json(json!({"id": "c123"}))
            }),
        );
        let base = spawn_runner(app).await;
        let handle = client().submit(&base, &request()).await.expect("submit");
        assert_eq!(handle, "c123");
    }

    #[tokio::test]
    async fn submit_surfaces_non_success_status() {
        let app = Router::new().route(
            "/task/run",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response() }),
        );
        let base = spawn_runner(app).await;
        match client().submit(&base, &request()).await {
            Err(RunnerError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_stream_yields_messages_until_normal_close() {
        let app = Router::new().route(
            "/task/status",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    let frame = json!({"status": "running", "statusCode": 0, "log_content": ["a"]});
                    let _ = socket.send(WsMessage::Text(frame.to_string().into())).await;
                    let _ = socket
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: axum::extract::ws::close_code::NORMAL,
                            reason: "".into(),
                        })))
                        .await;
                })
            }),
        );
        let base = spawn_runner(app).await;
        let query = StatusQuery {
            template_uuid: "tpl-1".into(),
            task_id: "run-1".into(),
            container_id: "c1".into(),
            offset: 0,
        };
        let stream = client()
            .open_status_stream(&base, &query)
            .await
            .expect("connect");
        let (mut reader, closer) = stream.split();
        let first = reader.next_message().await.expect("frame").expect("message");
        assert_eq!(first.log_content, vec!["a".to_string()]);
        assert!(reader.next_message().await.is_none());
        closer.close().await;
    }

    #[tokio::test]
    async fn log_follow_reports_abnormal_close() {
        let app = Router::new().route(
            "/task/log/follow",
            get(|ws: WebSocketUpgrade| async move {
                ws.on_upgrade(|mut socket| async move {
                    let _ = socket.send(WsMessage::Text("line 1".into())).await;
                    let _ = socket
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: axum::extract::ws::close_code::ERROR,
                            reason: "container gone".into(),
                        })))
                        .await;
                })
            }),
        );
        let base = spawn_runner(app).await;
        let query = LogFollowQuery {
            task_id: "run-1".into(),
            template_id: "tpl-1".into(),
            container_id: None,
        };
        let mut stream = client()
            .open_log_follow(&base, &query)
            .await
            .expect("connect");
        assert_eq!(stream.next_line().await.expect("frame").expect("line"), "line 1");
        assert!(matches!(
            stream.next_line().await,
            Some(Err(RunnerError::AbnormalClose { code: 1011, .. }))
        ));
        stream.close().await;
    }

    #[tokio::test]
    async fn connecting_to_plain_http_route_fails() {
        let app = Router::new().route("/task/status", get(|| async { "not a websocket" }));
        let base = spawn_runner(app).await;
        let query = StatusQuery {
            template_uuid: "tpl-1".into(),
            task_id: "run-1".into(),
            container_id: "c1".into(),
            offset: 0,
        };
        assert!(matches!(
            client().open_status_stream(&base, &query).await,
            Err(RunnerError::WebSocket(_))
        ));
    }
}
