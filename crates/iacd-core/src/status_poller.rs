//! Task status synchronisation.
//!
//! A poll opens the runner's status stream for one task and follows it until
//! the container exits, the task deadline passes, the caller cancels or the
//! stream fails. The most recent log chunk is flushed to the log store and
//! the outcome is written back to the task in a single revision-checked
//! update.
//!
//! [`StatusPoller::wait_task_result`] wraps [`StatusPoller::sync`] with a
//! bounded, linearly growing retry for transient stream failures.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};

use iacd_observability::{emit_event, ObservabilityEvent, ProcessKind};
use iacd_runner::{RunnerClient, RunnerError, RunnerStatusMessage, StatusQuery};
use iacd_types::{MissingBackendKey, Task, TaskSource, TaskStatus};

use crate::config::PollerConfig;
use crate::event_bus::{EventBus, EVENT_TASK_FINISHED};
use crate::log_storage::{LogStorage, LogStoreError};
use crate::notifier::{Notification, Notifier};
use crate::storage::{StoreError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The task is in this terminal status.
    Finished(TaskStatus),
    /// The caller cancelled before the task finished. No status was written.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("task `{0}` not found")]
    TaskNotFound(String),
    #[error("task `{0}` has not been started")]
    NotStarted(String),
    #[error(transparent)]
    MissingBackend(#[from] MissingBackendKey),
    #[error("cannot open runner status stream: {0}")]
    Connect(#[source] RunnerError),
    #[error("runner status stream failed: {0}")]
    Read(#[source] RunnerError),
    #[error("runner closed the status stream before the task exited")]
    StreamClosed,
    #[error("task log flush failed (status {status}): {source}")]
    LogFlush {
        status: TaskStatus,
        #[source]
        source: LogStoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("status sync gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },
}

impl SyncError {
    /// Errors worth reopening the status stream for.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Connect(err) => !matches!(err, RunnerError::InvalidUrl { .. }),
            SyncError::Read(_) | SyncError::StreamClosed => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SyncError::TaskNotFound(_) => "TASK_NOT_FOUND",
            SyncError::NotStarted(_) => "TASK_NOT_STARTED",
            SyncError::MissingBackend(_) => "BACKEND_INFO_INCOMPLETE",
            SyncError::Connect(_) => "RUNNER_CONNECT_FAILED",
            SyncError::Read(_) => "RUNNER_STREAM_FAILED",
            SyncError::StreamClosed => "RUNNER_STREAM_CLOSED",
            SyncError::LogFlush { .. } => "LOG_FLUSH_FAILED",
            SyncError::Store(_) => "TASK_STORE_FAILED",
            SyncError::RetriesExhausted { .. } => "SYNC_RETRIES_EXHAUSTED",
        }
    }
}

enum LoopEnd {
    Status(TaskStatus, Option<String>),
    Cancelled,
    Failed(SyncError),
}

#[derive(Clone)]
pub struct StatusPoller {
    store: Arc<TaskStore>,
    logs: Arc<dyn LogStorage>,
    runner: RunnerClient,
    events: EventBus,
    notifier: Notifier,
    config: PollerConfig,
}

impl StatusPoller {
    pub fn new(
        store: Arc<TaskStore>,
        logs: Arc<dyn LogStorage>,
        runner: RunnerClient,
        events: EventBus,
        notifier: Notifier,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            logs,
            runner,
            events,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Follows the runner status stream of task `guid` once.
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        guid: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let task = self
            .store
            .get_task(guid)
            .await
            .ok_or_else(|| SyncError::TaskNotFound(guid.to_string()))?;
        if task.exited() {
            return Ok(SyncOutcome::Finished(task.status));
        }
        if !task.started() {
            return Err(SyncError::NotStarted(task.guid));
        }
        let backend_url = task.backend_info.require_backend_url()?.to_string();
        let container_id = task.backend_info.require_container_id()?.to_string();
        let log_file = task.backend_info.require_log_file()?.to_string();
        let deadline = self.deadline_for(&task);

        let query = StatusQuery {
            template_uuid: task.template_guid.clone(),
            task_id: task.guid.clone(),
            container_id,
            offset: task.backend_info.log_offset,
        };
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(SyncOutcome::Cancelled),
            opened = self.runner.open_status_stream(&backend_url, &query) => {
                opened.map_err(SyncError::Connect)?
            }
        };
        debug!(task_id = %task.guid, offset = query.offset, "status stream opened");

        let (mut reader, closer) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let read_loop = tokio::spawn(async move {
            while let Some(item) = reader.next_message().await {
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });

        let mut last_log: Option<RunnerStatusMessage> = None;
        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break LoopEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    break LoopEnd::Status(
                        TaskStatus::Timeout,
                        Some(format!("task exceeded its {}s timeout", task.timeout_secs)),
                    );
                }
                item = rx.recv() => match item {
                    None => break LoopEnd::Failed(SyncError::StreamClosed),
                    Some(Err(err)) => break LoopEnd::Failed(SyncError::Read(err)),
                    Some(Ok(message)) => {
                        let exited = message.is_exited();
                        let code = message.status_code;
                        if message.has_log() {
                            last_log = Some(message);
                        }
                        if exited {
                            break if code == 0 {
                                LoopEnd::Status(TaskStatus::Complete, None)
                            } else {
                                LoopEnd::Status(
                                    TaskStatus::Failed,
                                    Some(format!("runner exited with code {code}")),
                                )
                            };
                        }
                    }
                },
            }
        };
        closer.close().await;
        read_loop.abort();

        let offset = task.backend_info.log_offset;
        let flushed = match &last_log {
            Some(message) => self
                .flush_log(&log_file, offset, message)
                .await
                .map(Some),
            None => Ok(None),
        };

        let mut next = task.clone();
        let mut reached = None;
        if let Ok(Some(new_offset)) = &flushed {
            next.backend_info.log_offset = *new_offset;
        }
        if let LoopEnd::Status(status, detail) = &end {
            next.status = *status;
            next.status_detail = detail.clone();
            next.end_at = Some(Utc::now());
            reached = Some(*status);
        }
        let stored = if reached.is_some() || next.backend_info.log_offset != offset {
            self.store.update_task(next).await?
        } else {
            task
        };
        if reached.is_some() {
            self.announce_finished(&stored);
        }

        if let Err(source) = flushed {
            warn!(task_id = %stored.guid, "task log flush failed: {source}");
            let err = SyncError::LogFlush {
                status: stored.status,
                source,
            };
            self.emit_failure(&stored, &err);
            return Err(err);
        }
        match end {
            LoopEnd::Status(status, _) => Ok(SyncOutcome::Finished(status)),
            LoopEnd::Cancelled => {
                debug!(task_id = %stored.guid, "status sync cancelled");
                Ok(SyncOutcome::Cancelled)
            }
            LoopEnd::Failed(err) => Err(err),
        }
    }

    /// Runs [`sync`](Self::sync) until it yields an outcome, retrying
    /// transient failures up to `max_retries` times.
    pub async fn wait_task_result(
        &self,
        cancel: &CancellationToken,
        guid: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.sync(cancel, guid).await {
                Err(err) if err.is_transient() => err,
                other => return other,
            };
            if attempt >= max_attempts {
                let err = SyncError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                };
                warn!(task_id = %guid, "{err}");
                return Err(err);
            }
            let delay = self.config.retry_delay(attempt);
            warn!(
                task_id = %guid,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "status sync failed, retrying: {err}"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SyncOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn deadline_for(&self, task: &Task) -> Instant {
        let now = Utc::now();
        let remaining = task
            .deadline()
            .and_then(|deadline| (deadline - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero());
        match remaining {
            Some(remaining) => Instant::now() + remaining,
            None => Instant::now() + self.config.deadline_grace(),
        }
    }

    /// Rewrites the log as the first `offset` stored lines followed by the
    /// lines of `message`. Returns the new offset.
    ///
    /// Entries carrying embedded newlines are split so that the offset
    /// always counts the `'\n'`-separated lines actually stored.
    async fn flush_log(
        &self,
        log_file: &str,
        offset: u64,
        message: &RunnerStatusMessage,
    ) -> Result<u64, LogStoreError> {
        let stored = if offset == 0 {
            Vec::new()
        } else {
            match self.logs.read(log_file).await {
                Ok(bytes) => bytes,
                Err(LogStoreError::NotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            }
        };
        let stored = String::from_utf8_lossy(&stored);
        let keep = usize::try_from(offset).unwrap_or(usize::MAX);
        let mut lines = if stored.is_empty() {
            Vec::new()
        } else {
            stored.split('\n').take(keep).collect::<Vec<_>>()
        };
        let incoming = message
            .log_content
            .iter()
            .flat_map(|entry| {
                let entry = entry.as_str();
                entry.strip_suffix('\n').unwrap_or(entry).split('\n')
            })
            .collect::<Vec<_>>();
        let written = incoming.len() as u64;
        lines.extend(incoming);
        self.logs.write(log_file, lines.join("\n").as_bytes()).await?;

        if message.log_content_lines != 0 && message.log_content_lines != message.line_count() {
            warn!(
                log_file,
                reported = message.log_content_lines,
                received = message.line_count(),
                "runner line count disagrees with log content"
            );
        }
        Ok(offset + written)
    }

    fn announce_finished(&self, task: &Task) {
        info!(task_id = %task.guid, status = %task.status, "task finished");
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent::new("task.finished", "status_poller")
                .task(&task.guid)
                .template(&task.template_guid)
                .status(task.status.as_str())
                .detail(task.status_detail.as_deref().unwrap_or("")),
        );
        self.events.publish_task(EVENT_TASK_FINISHED, task);
        if task.source == TaskSource::Workflow {
            self.notifier.notify(Notification::task_completed(task));
        }
    }

    fn emit_failure(&self, task: &Task, err: &SyncError) {
        let detail = err.to_string();
        emit_event(
            Level::WARN,
            ProcessKind::Server,
            ObservabilityEvent::new("task.sync.failed", "status_poller")
                .task(&task.guid)
                .template(&task.template_guid)
                .status(task.status.as_str())
                .error_code(err.code())
                .detail(&detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stream_failures_are_transient() {
        assert!(SyncError::StreamClosed.is_transient());
        assert!(SyncError::Read(RunnerError::AbnormalClose {
            code: 1011,
            reason: "boom".into()
        })
        .is_transient());
        assert!(SyncError::Connect(RunnerError::ConnectTimeout("ws://x".into())).is_transient());
        assert!(!SyncError::Connect(RunnerError::InvalidUrl {
            url: "x".into(),
            reason: "bad".into()
        })
        .is_transient());
        assert!(!SyncError::NotStarted("run-1".into()).is_transient());
        assert!(!SyncError::Store(StoreError::RevisionConflict {
            guid: "run-1".into(),
            expected: 1,
            current: 2
        })
        .is_transient());
    }
}
