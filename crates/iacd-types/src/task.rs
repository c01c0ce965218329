use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Whether a task in `self` may be moved to `next`.
    ///
    /// Re-applying the current status is allowed so that a poller resumed
    /// after a crash can write the same state again.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Running | TaskStatus::Failed),
            TaskStatus::Running => next.is_terminal(),
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Timeout => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Apply,
    Destroy,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Plan => "plan",
            TaskType::Apply => "apply",
            TaskType::Destroy => "destroy",
        }
    }
}

/// Where a task run was triggered from. `Workflow` runs belong to an external
/// pipeline that expects a completion event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    Manual,
    Api,
    Workflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task backend info is missing `{0}`")]
pub struct MissingBackendKey(pub &'static str);

/// Runner-side coordinates of a task run.
///
/// Unknown keys written by newer versions are kept in `extra` and written back
/// untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default)]
    pub log_offset: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackendInfo {
    pub fn require_backend_url(&self) -> Result<&str, MissingBackendKey> {
        non_empty(self.backend_url.as_deref()).ok_or(MissingBackendKey("backend_url"))
    }

    pub fn require_container_id(&self) -> Result<&str, MissingBackendKey> {
        non_empty(self.container_id.as_deref()).ok_or(MissingBackendKey("container_id"))
    }

    pub fn require_log_file(&self) -> Result<&str, MissingBackendKey> {
        non_empty(self.log_file.as_deref()).ok_or(MissingBackendKey("log_file"))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub guid: String,
    pub template_guid: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub backend_info: BackendInfo,
    #[serde(default)]
    pub rev: u64,
}

impl Task {
    pub fn new(id: u64, template: &crate::Template, input: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id,
            guid: new_task_guid(),
            template_guid: template.guid.clone(),
            task_type: input.task_type,
            status: TaskStatus::Pending,
            status_detail: None,
            source: input.source,
            transaction_id: input.transaction_id,
            commit_id: input.commit_id,
            timeout_secs: template.timeout_secs,
            start_at: None,
            end_at: None,
            created_at: now,
            updated_at: now,
            backend_info: BackendInfo::default(),
            rev: 1,
        }
    }

    pub fn started(&self) -> bool {
        self.status != TaskStatus::Pending
    }

    pub fn exited(&self) -> bool {
        self.status.is_terminal()
    }

    /// `start_at + timeout`, or `None` while the task has not been started.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let start = self.start_at?;
        let secs = i64::try_from(self.timeout_secs).ok()?;
        start.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub commit_id: Option<String>,
}

pub fn new_task_guid() -> String {
    format!("run-{}", Uuid::new_v4().simple())
}

/// Deterministic log key for a task run.
pub fn task_log_path(template_guid: &str, task_guid: &str) -> String {
    format!("logs/{template_guid}/{task_guid}")
}

/// Extracts the task guid from a `logs/<template>/<task>` path.
pub fn task_guid_from_log_path(log_path: &str) -> Option<&str> {
    let parts = log_path.trim_matches('/').split('/').collect::<Vec<_>>();
    if parts.len() < 3 {
        return None;
    }
    parts.last().copied().filter(|p| !p.is_empty())
}
