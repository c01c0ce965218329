use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use uuid::Uuid;

use iacd_core::{
    ConfigStore, Dispatcher, EventBus, FileLogStore, LogStorage, Notifier, StatusPoller,
    SyncOutcome, TaskStore,
};
use iacd_observability::{emit_event, ObservabilityEvent, ProcessKind};
use iacd_runner::RunnerClient;
use iacd_types::TaskStatus;

pub mod http;
mod live_log;

pub use http::{app_router, serve};

/// A status poll currently running for one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePoll {
    pub task_id: String,
    pub poll_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl ActivePoll {
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// At most one active poll per task.
#[derive(Clone, Default)]
pub struct PollRegistry {
    active: Arc<RwLock<HashMap<String, ActivePoll>>>,
}

impl PollRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, task_id: &str) -> Option<ActivePoll> {
        self.active.read().await.get(task_id).cloned()
    }

    /// Registers a poll for `task_id`, or returns the one already active.
    pub async fn acquire(
        &self,
        task_id: &str,
        parent: &CancellationToken,
    ) -> Result<ActivePoll, ActivePoll> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(task_id).cloned() {
            return Err(existing);
        }
        let poll = ActivePoll {
            task_id: task_id.to_string(),
            poll_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            cancel: parent.child_token(),
        };
        guard.insert(task_id.to_string(), poll.clone());
        Ok(poll)
    }

    pub async fn finish_if_match(&self, task_id: &str, poll_id: &str) -> Option<ActivePoll> {
        let mut guard = self.active.write().await;
        if guard.get(task_id).is_some_and(|poll| poll.poll_id == poll_id) {
            return guard.remove(task_id);
        }
        None
    }

    /// Fires the cancellation token of the active poll, if any.
    pub async fn cancel(&self, task_id: &str) -> Option<ActivePoll> {
        let poll = self.active.read().await.get(task_id).cloned()?;
        poll.cancel.cancel();
        Some(poll)
    }

    pub async fn list(&self) -> Vec<ActivePoll> {
        let mut polls = self
            .active
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        polls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        polls
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub store: Arc<TaskStore>,
    pub logs: Arc<dyn LogStorage>,
    pub runner: RunnerClient,
    pub dispatcher: Dispatcher,
    pub poller: StatusPoller,
    pub event_bus: EventBus,
    pub notifier: Notifier,
    pub polls: PollRegistry,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Opens the task store and log store under `state_dir`.
    pub async fn open(state_dir: impl AsRef<Path>, config: ConfigStore) -> anyhow::Result<Self> {
        let state_dir = state_dir.as_ref();
        let store = Arc::new(TaskStore::open(state_dir.join("store")).await?);
        let logs: Arc<dyn LogStorage> = Arc::new(FileLogStore::new(state_dir.join("logs")));
        Self::with_parts(config, store, logs).await
    }

    pub async fn with_parts(
        config: ConfigStore,
        store: Arc<TaskStore>,
        logs: Arc<dyn LogStorage>,
    ) -> anyhow::Result<Self> {
        let snapshot = config.get().await;
        let runner = RunnerClient::new(snapshot.runner.clone())?;
        let event_bus = EventBus::new();
        let notifier = Notifier::from_config(&snapshot.notify)?;
        let dispatcher = Dispatcher::new(
            store.clone(),
            runner.clone(),
            snapshot.state_store.clone(),
            notifier.clone(),
            event_bus.clone(),
        );
        let poller = StatusPoller::new(
            store.clone(),
            logs.clone(),
            runner.clone(),
            event_bus.clone(),
            notifier.clone(),
            snapshot.poller.clone(),
        );
        Ok(Self {
            config,
            store,
            logs,
            runner,
            dispatcher,
            poller,
            event_bus,
            notifier,
            polls: PollRegistry::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts a background poll for `task_id` unless one is already active.
    pub async fn spawn_poll(&self, task_id: &str) -> Result<ActivePoll, ActivePoll> {
        let poll = self.polls.acquire(task_id, &self.shutdown).await?;
        let state = self.clone();
        let running = poll.clone();
        tokio::spawn(async move {
            let result = state
                .poller
                .wait_task_result(&running.cancel, &running.task_id)
                .await;
            match result {
                Ok(SyncOutcome::Finished(status)) => {
                    info!(task_id = %running.task_id, %status, "task poll finished");
                }
                Ok(SyncOutcome::Cancelled) => {
                    info!(task_id = %running.task_id, "task poll cancelled");
                }
                Err(err) => {
                    warn!(task_id = %running.task_id, "task poll failed: {err}");
                    let detail = err.to_string();
                    emit_event(
                        Level::WARN,
                        ProcessKind::Server,
                        ObservabilityEvent::new("task.poll.failed", "poll_registry")
                            .task(&running.task_id)
                            .detail(&detail),
                    );
                }
            }
            state
                .polls
                .finish_if_match(&running.task_id, &running.poll_id)
                .await;
        });
        Ok(poll)
    }

    /// Resumes polling for every task left `running` by a previous process.
    pub async fn recover_running_tasks(&self) -> usize {
        let running = self.store.list_tasks_with_status(TaskStatus::Running).await;
        let mut spawned = 0;
        for task in running {
            if self.spawn_poll(&task.guid).await.is_ok() {
                spawned += 1;
            }
        }
        if spawned > 0 {
            info!(count = spawned, "recovered running task polls");
        }
        spawned
    }
}
