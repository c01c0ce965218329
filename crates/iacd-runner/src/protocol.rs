use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Container state reported once the job has finished.
pub const STATUS_EXITED: &str = "exited";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateStore {
    pub save_state: bool,
    pub backend: String,
    pub scheme: String,
    pub state_key: String,
    pub state_backend_address: String,
    pub lock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTaskRequest {
    pub repo: String,
    pub repo_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_commit: Option<String>,
    pub template_uuid: String,
    pub task_id: String,
    pub state_store: StateStore,
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub varfile: Option<String>,
    pub mode: String,
    #[serde(default)]
    pub extra: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,
    #[serde(default)]
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RunTaskResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, alias = "error")]
    pub err: String,
}

impl RunTaskResponse {
    /// The runner-assigned job handle, or the reason the submission was rejected.
    pub fn into_handle(self) -> Result<String, RunnerError> {
        if !self.err.trim().is_empty() {
            return Err(RunnerError::Rejected {
                code: self.code,
                message: self.err,
            });
        }
        let id = self.id.trim();
        if id.is_empty() {
            return Err(RunnerError::Rejected {
                code: self.code,
                message: "runner response carries no job id".to_string(),
            });
        }
        Ok(id.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RunnerStatusMessage {
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "statusCode")]
    pub status_code: i64,
    #[serde(default)]
    pub log_content: Vec<String>,
    #[serde(default)]
    pub log_content_lines: u64,
}

impl RunnerStatusMessage {
    pub fn is_exited(&self) -> bool {
        self.status == STATUS_EXITED
    }

    pub fn has_log(&self) -> bool {
        !self.log_content.is_empty()
    }

    pub fn line_count(&self) -> u64 {
        self.log_content.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    pub template_uuid: String,
    pub task_id: String,
    pub container_id: String,
    pub offset: u64,
}

impl StatusQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("templateUuid", self.template_uuid.clone()),
            ("taskId", self.task_id.clone()),
            ("containerId", self.container_id.clone()),
            ("offset", self.offset.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFollowQuery {
    pub task_id: String,
    pub template_id: String,
    pub container_id: Option<String>,
}

impl LogFollowQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("taskId", self.task_id.clone()),
            ("templateId", self.template_id.clone()),
        ];
        if let Some(container_id) = &self.container_id {
            params.push(("containerId", container_id.clone()));
        }
        params
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid runner url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("runner request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("runner returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("runner rejected the task ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket closed with code {code}: {reason}")]
    AbnormalClose { code: u16, reason: String },
    #[error("undecodable runner frame: {0}")]
    Decode(#[from] serde_json::Error),
}
