//! Best-effort task notifications.
//!
//! Notifications go through a bounded queue drained by a fixed pool of
//! workers. Producers never wait: when the queue is full the notification is
//! dropped and counted. Delivery failures are logged and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use iacd_observability::redact_text;
use iacd_types::{Task, TaskSource, TaskStatus};

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum NotificationKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::TaskCreated => "task.created",
            NotificationKind::TaskCompleted => "task.completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub task_id: String,
    pub template_id: String,
    pub status: TaskStatus,
    pub source: TaskSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl Notification {
    fn for_task(kind: NotificationKind, task: &Task) -> Self {
        Self {
            kind,
            task_id: task.guid.clone(),
            template_id: task.template_guid.clone(),
            status: task.status,
            source: task.source,
            transaction_id: task.transaction_id.clone(),
            detail: task.status_detail.clone(),
            at: Utc::now(),
        }
    }

    pub fn task_created(task: &Task) -> Self {
        Self::for_task(NotificationKind::TaskCreated, task)
    }

    pub fn task_completed(task: &Task) -> Self {
        Self::for_task(NotificationKind::TaskCompleted, task)
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            kind = notification.kind.as_str(),
            task_id = %notification.task_id,
            status = %notification.status,
            transaction_id = notification.transaction_id.as_deref().unwrap_or(""),
            "task notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed url.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook responded with {}", resp.status());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Spawns `workers` delivery tasks on the current runtime.
    pub fn start(sinks: Vec<Arc<dyn NotificationSink>>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let sinks: Arc<[Arc<dyn NotificationSink>]> = sinks.into();
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let sinks = sinks.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(notification) = next else {
                        break;
                    };
                    for sink in sinks.iter() {
                        if let Err(err) = sink.deliver(&notification).await {
                            warn!(
                                sink = sink.name(),
                                task_id = %notification.task_id,
                                "notification delivery failed: {err:#}"
                            );
                        }
                    }
                }
                debug!(worker, "notifier worker stopped");
            });
        }
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Self> {
        let tracing_sink: Arc<dyn NotificationSink> = Arc::new(TracingSink);
        let mut sinks = vec![tracing_sink];
        if let Some(url) = config
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
        {
            info!(url = %redact_text(url), "webhook notifications enabled");
            sinks.push(Arc::new(WebhookSink::new(
                url,
                Duration::from_secs(config.timeout_secs.max(1)),
            )?));
        }
        Ok(Self::start(sinks, config.queue_capacity, config.workers))
    }

    pub fn notify(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notification)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = notification.kind.as_str(),
                    task_id = %notification.task_id,
                    "notification queue full, dropping"
                );
            }
            Err(mpsc::error::TrySendError::Closed(notification)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %notification.task_id, "notifier stopped, dropping");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iacd_types::{NewTask, TaskType, Template};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recording {
        seen: std::sync::Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
            self.seen
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?
                .push(notification.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("unreachable endpoint")
        }
    }

    /// Blocks every delivery until released.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl NotificationSink for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn deliver(&self, _: &Notification) -> anyhow::Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn task() -> Task {
        let template = Template::new("tpl-1", "org-1", "https://git.example.com/a.git");
        Task::new(
            1,
            &template,
            NewTask {
                task_type: TaskType::Plan,
                source: TaskSource::Workflow,
                transaction_id: Some("tx-9".into()),
                commit_id: None,
            },
        )
    }

    async fn wait_for(recording: &Recording, count: usize) {
        for _ in 0..100 {
            if recording.seen.lock().expect("lock").len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} notifications");
    }

    #[tokio::test]
    async fn delivers_to_every_sink_despite_failures() {
        let recording = Arc::new(Recording::default());
        let failing: Arc<dyn NotificationSink> = Arc::new(Failing);
        let recorder: Arc<dyn NotificationSink> = recording.clone();
        let notifier = Notifier::start(vec![failing, recorder], 8, 2);
        notifier.notify(Notification::task_completed(&task()));
        wait_for(&recording, 1).await;
        let seen = recording.seen.lock().expect("lock");
        assert_eq!(seen[0].kind, NotificationKind::TaskCompleted);
        assert_eq!(seen[0].transaction_id.as_deref(), Some("tx-9"));
        assert_eq!(notifier.dropped(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let sink: Arc<dyn NotificationSink> = gate.clone();
        let notifier = Notifier::start(vec![sink], 1, 1);
        let task = task();
        notifier.notify(Notification::task_created(&task));
        gate.entered.notified().await;
        notifier.notify(Notification::task_created(&task));
        notifier.notify(Notification::task_created(&task));
        assert_eq!(notifier.dropped(), 1);
        gate.release.notify_one();
    }

    #[test]
    fn notification_serializes_kind_as_dotted_name() {
        let value = serde_json::to_value(Notification::task_created(&task())).expect("json");
        assert_eq!(value["kind"], "task.created");
        assert_eq!(value["source"], "workflow");
    }
}
