//! The stream-event protocol.
//!
//! Every executor reports progress as `StreamEvent`s through an
//! [`EventSink`]. Events are transient: each is delivered exactly once to the
//! caller's callback and never persisted by the runtime.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::RespondAs;
use crate::error::LoomError;
use crate::execution::TaskId;
use crate::model::{ChatMessage, Usage};

/// Lifecycle phase carried by an EXECUTE event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutePhase {
    ExecuteAssistantStart,
    ExecuteAssistantEnd,
    /// A decision case ended selection early; closes the task with `stop`.
    ExecuteSelectStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub current_phase: ExecutePhase,
}

/// Incremental output of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChunkDelta {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn object(object: Value) -> Self {
        Self {
            object: Some(object),
            ..Self::default()
        }
    }

    pub fn images(images: Vec<String>) -> Self {
        Self {
            images: Some(images),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&LoomError> for ErrorPayload {
    fn from(err: &LoomError) -> Self {
        Self {
            message: err.to_string(),
            kind: Some(err.kind().to_string()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// The tagged union every executor emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    InputParameter { content: String },

    #[serde(rename_all = "camelCase")]
    Input {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_task_id: Option<TaskId>,
        assistant_id: String,
        assistant_name: String,
        input_parameters: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_messages: Option<Vec<ChatMessage>>,
    },

    #[serde(rename_all = "camelCase")]
    Chunk {
        task_id: TaskId,
        assistant_id: String,
        delta: ChunkDelta,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        respond_as: Option<RespondAs>,
    },

    #[serde(rename_all = "camelCase")]
    Execute {
        task_id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_task_id: Option<TaskId>,
        assistant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assistant_name: Option<String>,
        execution: Execution,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    #[serde(rename_all = "camelCase")]
    Usage {
        task_id: TaskId,
        assistant_id: String,
        usage: Usage,
    },

    #[serde(rename_all = "camelCase")]
    Log {
        task_id: TaskId,
        assistant_id: String,
        log: String,
        timestamp: DateTime<Utc>,
    },

    Error { error: ErrorPayload },

    /// Reserved; consumers ignore it.
    Progress {
        #[serde(default)]
        payload: Value,
    },
}

impl StreamEvent {
    /// The task this event belongs to, when it carries one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            StreamEvent::Input { task_id, .. }
            | StreamEvent::Chunk { task_id, .. }
            | StreamEvent::Execute { task_id, .. }
            | StreamEvent::Usage { task_id, .. }
            | StreamEvent::Log { task_id, .. } => Some(task_id),
            StreamEvent::InputParameter { .. }
            | StreamEvent::Error { .. }
            | StreamEvent::Progress { .. } => None,
        }
    }
}

/// One item of a streamed run: an event, or the final outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RunUpdate {
    Event { event: StreamEvent },
    Completed { outputs: Value },
}

/// The caller-supplied event callback.
///
/// Delivery is synchronous and infallible from the producer's point of view:
/// a consumer that stopped listening simply drops what it receives.
#[derive(Clone)]
pub struct EventSink {
    callback: Arc<dyn Fn(StreamEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(callback: impl Fn(StreamEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, event: StreamEvent) {
        (self.callback)(event);
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
