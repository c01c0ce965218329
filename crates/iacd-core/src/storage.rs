use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use iacd_types::{NewTask, Task, TaskStatus, Template};

const STORE_FILE: &str = "tasks.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("template `{0}` not found")]
    TemplateNotFound(String),
    #[error("task `{guid}` cannot move from {from} to {to}")]
    InvalidTransition {
        guid: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task `{guid}` was modified concurrently (expected rev {expected}, found {current})")]
    RevisionConflict {
        guid: String,
        expected: u64,
        current: u64,
    },
    #[error("failed to persist task store: {0}")]
    Persist(String),
    #[error("failed to load task store: {0}")]
    Load(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    templates: HashMap<String, Template>,
    #[serde(default)]
    tasks: HashMap<String, Task>,
}

/// Task and template records, kept in memory and mirrored to
/// `<base>/tasks.json` when opened on disk.
pub struct TaskStore {
    file: Option<PathBuf>,
    state: RwLock<StoreSnapshot>,
}

impl TaskStore {
    pub async fn open(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .map_err(|err| StoreError::Load(format!("{}: {err}", base.display())))?;
        let file = base.join(STORE_FILE);
        let snapshot = if file.exists() {
            let raw = fs::read_to_string(&file)
                .await
                .map_err(|err| StoreError::Load(format!("{}: {err}", file.display())))?;
            serde_json::from_str::<StoreSnapshot>(&raw)
                .map_err(|err| StoreError::Load(format!("{}: {err}", file.display())))?
        } else {
            StoreSnapshot::default()
        };
        tracing::debug!(
            tasks = snapshot.tasks.len(),
            templates = snapshot.templates.len(),
            "task store loaded from {}",
            file.display()
        );
        Ok(Self {
            file: Some(file),
            state: RwLock::new(snapshot),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file: None,
            state: RwLock::new(StoreSnapshot::default()),
        }
    }

    pub async fn put_template(&self, template: Template) -> Result<Template, StoreError> {
        let mut guard = self.state.write().await;
        let previous = guard
            .templates
            .insert(template.guid.clone(), template.clone());
        let snapshot = guard.clone();
        drop(guard);

        if let Err(err) = self.persist(&snapshot).await {
            let mut rollback = self.state.write().await;
            match previous {
                Some(previous) => {
                    rollback.templates.insert(template.guid.clone(), previous);
                }
                None => {
                    rollback.templates.remove(&template.guid);
                }
            }
            return Err(err);
        }
        Ok(template)
    }

    pub async fn get_template(&self, guid: &str) -> Option<Template> {
        self.state.read().await.templates.get(guid).cloned()
    }

    /// Creates a `pending` task for an existing template.
    pub async fn create_task(
        &self,
        template_guid: &str,
        input: NewTask,
    ) -> Result<Task, StoreError> {
        let mut guard = self.state.write().await;
        let template = guard
            .templates
            .get(template_guid)
            .cloned()
            .ok_or_else(|| StoreError::TemplateNotFound(template_guid.to_string()))?;
        let previous_id = guard.next_id;
        guard.next_id = previous_id.saturating_add(1);
        let task = Task::new(guard.next_id, &template, input);
        guard.tasks.insert(task.guid.clone(), task.clone());
        let snapshot = guard.clone();
        drop(guard);

        if let Err(err) = self.persist(&snapshot).await {
            let mut rollback = self.state.write().await;
            rollback.tasks.remove(&task.guid);
            rollback.next_id = previous_id;
            return Err(err);
        }
        Ok(task)
    }

    pub async fn get_task(&self, guid: &str) -> Option<Task> {
        self.state.read().await.tasks.get(guid).cloned()
    }

    pub async fn list_tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks = self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|task| task.status == status)
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    /// Writes `task` if its `rev` still matches the stored record and its
    /// status is reachable from the stored one. Returns the stored record with
    /// the bumped revision.
    pub async fn update_task(&self, mut task: Task) -> Result<Task, StoreError> {
        let mut guard = self.state.write().await;
        let current = guard
            .tasks
            .get(&task.guid)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(task.guid.clone()))?;
        if current.rev != task.rev {
            return Err(StoreError::RevisionConflict {
                guid: task.guid,
                expected: task.rev,
                current: current.rev,
            });
        }
        if !current.status.can_transition_to(task.status) {
            return Err(StoreError::InvalidTransition {
                guid: task.guid,
                from: current.status,
                to: task.status,
            });
        }
        task.rev = current.rev.saturating_add(1);
        task.updated_at = Utc::now();
        guard.tasks.insert(task.guid.clone(), task.clone());
        let snapshot = guard.clone();
        drop(guard);

        if let Err(err) = self.persist(&snapshot).await {
            self.state
                .write()
                .await
                .tasks
                .insert(current.guid.clone(), current);
            return Err(err);
        }
        Ok(task)
    }

    async fn persist(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let payload = serde_json::to_string_pretty(snapshot)
            .map_err(|err| StoreError::Persist(err.to_string()))?;
        let tmp = file.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .await
            .map_err(|err| StoreError::Persist(format!("{}: {err}", tmp.display())))?;
        fs::rename(&tmp, file)
            .await
            .map_err(|err| StoreError::Persist(format!("{}: {err}", file.display())))
    }
}
