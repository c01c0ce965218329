use serde_json::json;
use tokio::sync::broadcast;

use iacd_types::{Task, TaskEvent};

pub const EVENT_TASK_STARTED: &str = "task.started";
pub const EVENT_TASK_FINISHED: &str = "task.finished";

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_task(&self, event_type: &str, task: &Task) {
        self.publish(TaskEvent::new(
            event_type,
            json!({
                "taskId": task.guid,
                "templateId": task.template_guid,
                "status": task.status,
                "statusDetail": task.status_detail,
                "containerId": task.backend_info.container_id,
            }),
        ));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
