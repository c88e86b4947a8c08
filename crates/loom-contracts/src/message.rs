//! Consumer-side result types built by the task-tree reducer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ErrorPayload;
use crate::execution::TaskId;
use crate::model::{ChatMessage, Usage};

/// The user turn that started a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    pub content: String,
}

/// Accumulated content/objects/images of one task or message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBuffer {
    pub content: String,
    pub objects: Vec<Value>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The reducer's record of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    pub assistant_id: String,
    pub assistant_name: String,
    /// Nesting depth, fixed when the trace is first inserted.
    pub deep: u32,
    #[serde(default)]
    pub input_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_messages: Option<Vec<ChatMessage>>,
    pub output: OutputBuffer,
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub stop: bool,
}

/// Content a non-main task streamed as its own message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubMessage {
    pub task_id: TaskId,
    pub assistant_id: String,
    pub output: OutputBuffer,
}

/// The assistant turn of a run, with its task tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMessage {
    pub id: String,
    pub content: String,
    pub images: Vec<String>,
    pub objects: Vec<Value>,
    /// Traces in insertion order.
    pub input_messages: Vec<Trace>,
    pub sub_messages: Vec<SubMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub cancelled: bool,
}

impl AggregatedMessage {
    pub fn trace(&self, task_id: &TaskId) -> Option<&Trace> {
        self.input_messages.iter().find(|t| &t.task_id == task_id)
    }

    /// No further mutation is applied once an error or cancel was observed.
    pub fn is_frozen(&self) -> bool {
        self.cancelled || self.error.is_some()
    }
}
