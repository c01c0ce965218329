use serde::{Deserialize, Serialize};
use serde_json::Value;

/// In-process event published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl TaskEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn task_guid(&self) -> Option<&str> {
        self.properties.get("taskId").and_then(|v| v.as_str())
    }
}
