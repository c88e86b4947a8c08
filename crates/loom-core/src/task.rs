//! Per-task lifecycle, event emission, and the invocation context handed to
//! executors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use loom_contracts::{
    agent::{AgentDefinition, RespondAs},
    error::{LoomError, LoomResult},
    event::{ChunkDelta, EventSink, ExecutePhase, Execution, StreamEvent},
    execution::{TaskId, TaskPhase},
    identity::AgentIdentity,
    model::{ChatMessage, Usage},
    verify::OutputSchema,
};

use crate::retry::RetryPolicy;
use crate::runtime::{ExecuteOptions, RuntimeExecutor};
use crate::template::TemplateScope;

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// `Created → Running → Closed`. Any other transition is a
/// `StateMachine` error.
#[derive(Debug)]
pub struct TaskLifecycle {
    task_id: TaskId,
    phase: TaskPhase,
}

impl TaskLifecycle {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            phase: TaskPhase::Created,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn start(&mut self) -> LoomResult<()> {
        match self.phase {
            TaskPhase::Created => {
                self.phase = TaskPhase::Running;
                Ok(())
            }
            other => Err(self.illegal("start", other)),
        }
    }

    pub fn close(&mut self, stopped: bool) -> LoomResult<()> {
        match self.phase {
            TaskPhase::Running => {
                self.phase = TaskPhase::Closed { stopped };
                Ok(())
            }
            other => Err(self.illegal("close", other)),
        }
    }

    fn illegal(&self, action: &str, from: TaskPhase) -> LoomError {
        LoomError::StateMachine {
            reason: format!("task {} cannot {action} from {from:?}", self.task_id),
        }
    }
}

// ── Emission ──────────────────────────────────────────────────────────────────

/// Builds and emits the events of one task.
#[derive(Debug, Clone)]
pub struct TaskEmitter {
    sink: EventSink,
    task_id: TaskId,
    parent_task_id: Option<TaskId>,
    assistant_id: String,
    assistant_name: String,
    respond_as: Option<RespondAs>,
}

impl TaskEmitter {
    pub fn new(
        sink: EventSink,
        task_id: TaskId,
        parent_task_id: Option<TaskId>,
        definition: &AgentDefinition,
    ) -> Self {
        Self {
            sink,
            task_id,
            parent_task_id,
            assistant_id: definition.id.clone(),
            assistant_name: definition.name.clone(),
            respond_as: definition.respond_as,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// The same task, with every event dropped.
    pub fn muted(&self) -> Self {
        Self {
            sink: EventSink::discard(),
            ..self.clone()
        }
    }

    pub fn input(&self, input_parameters: Value, prompt_messages: Option<Vec<ChatMessage>>) {
        self.sink.emit(StreamEvent::Input {
            task_id: self.task_id.clone(),
            parent_task_id: self.parent_task_id.clone(),
            assistant_id: self.assistant_id.clone(),
            assistant_name: self.assistant_name.clone(),
            input_parameters,
            prompt_messages,
        });
    }

    pub fn execute(&self, phase: ExecutePhase) {
        self.sink.emit(StreamEvent::Execute {
            task_id: self.task_id.clone(),
            parent_task_id: self.parent_task_id.clone(),
            assistant_id: self.assistant_id.clone(),
            assistant_name: Some(self.assistant_name.clone()),
            execution: Execution { current_phase: phase },
            timestamp: Some(Utc::now()),
        });
    }

    fn chunk(&self, delta: ChunkDelta) {
        self.sink.emit(StreamEvent::Chunk {
            task_id: self.task_id.clone(),
            assistant_id: self.assistant_id.clone(),
            delta,
            respond_as: self.respond_as,
        });
    }

    pub fn text(&self, text: &str) {
        if !text.is_empty() {
            self.chunk(ChunkDelta::content(text));
        }
    }

    pub fn object(&self, object: Value) {
        self.chunk(ChunkDelta::object(object));
    }

    pub fn images(&self, images: Vec<String>) {
        self.chunk(ChunkDelta::images(images));
    }

    pub fn usage(&self, usage: Usage) {
        self.sink.emit(StreamEvent::Usage {
            task_id: self.task_id.clone(),
            assistant_id: self.assistant_id.clone(),
            usage,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        self.sink.emit(StreamEvent::Log {
            task_id: self.task_id.clone(),
            assistant_id: self.assistant_id.clone(),
            log: message.into(),
            timestamp: Utc::now(),
        });
    }

    /// A sink for a child run that forwards everything to this task's sink
    /// and hands the child's streamed text to `on_text`.
    ///
    /// The child is the first task whose INPUT names this task as parent.
    pub fn watch_child_text(&self, on_text: impl Fn(&str) + Send + Sync + 'static) -> EventSink {
        let parent = self.sink.clone();
        let me = self.task_id.clone();
        let child: Arc<Mutex<Option<TaskId>>> = Arc::new(Mutex::new(None));

        EventSink::new(move |event| {
            let text = match &event {
                StreamEvent::Input {
                    task_id,
                    parent_task_id: Some(p),
                    ..
                } if *p == me => {
                    child
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert_with(|| task_id.clone());
                    None
                }
                StreamEvent::Chunk { task_id, delta, .. } => {
                    let watched = child.lock().unwrap_or_else(PoisonError::into_inner);
                    delta.content.clone().filter(|_| watched.as_ref() == Some(task_id))
                }
                _ => None,
            };
            parent.emit(event);
            if let Some(text) = text {
                on_text(&text);
            }
        })
    }
}

/// Remove secret inputs before they are put on an event.
pub fn redact(definition: &AgentDefinition, inputs: &Value) -> Value {
    match inputs {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(name, _)| !definition.input(name).is_some_and(|d| d.secret))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ── Invocation ────────────────────────────────────────────────────────────────

/// Everything an executor knows about the task it is running.
pub struct Invocation<'a> {
    pub runtime: &'a RuntimeExecutor,
    pub definition: &'a AgentDefinition,
    pub identity: AgentIdentity,
    pub emitter: TaskEmitter,
    pub deadline: Option<Instant>,
    pub max_retries: u32,
    /// Retry default inherited by sub-invocations.
    pub(crate) caller_max_retries: Option<u32>,
    stopped: AtomicBool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        runtime: &'a RuntimeExecutor,
        definition: &'a AgentDefinition,
        identity: AgentIdentity,
        emitter: TaskEmitter,
        options: &ExecuteOptions,
    ) -> Self {
        let max_retries = definition
            .max_retries()
            .or(options.max_retries)
            .unwrap_or(runtime.config().max_retries);
        Self {
            runtime,
            definition,
            identity,
            emitter,
            deadline: options.deadline,
            max_retries,
            caller_max_retries: options.max_retries,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        self.emitter.task_id()
    }

    /// Mark the task as stopped; it closes with `EXECUTE_SELECT_STOP`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_deadline(self.deadline)
    }

    pub fn schema(&self) -> OutputSchema {
        OutputSchema::for_agent(self.definition)
    }

    pub fn partial_schema(&self) -> OutputSchema {
        OutputSchema::partial_for_agent(self.definition)
    }

    /// Check outputs against the full schema; failure is retryable.
    pub fn validate(&self, outputs: &Value) -> LoomResult<()> {
        self.runtime.verifier().ensure_valid(outputs, &self.schema())
    }

    pub async fn memory(&self) -> LoomResult<BTreeMap<String, Value>> {
        let variables = self.runtime.collaborators().memory.variables(&self.identity).await?;
        Ok(variables.into_iter().map(|v| (v.name, v.value)).collect())
    }

    pub fn scope<'s>(&'s self, inputs: &'s Value, memory: &'s BTreeMap<String, Value>) -> TemplateScope<'s> {
        TemplateScope {
            inputs,
            memory,
            declarations: &self.definition.inputs,
        }
    }

    /// Run a sub-agent as a child of this task.
    ///
    /// `sink` replaces this task's sink for the child run; pass `None` to
    /// share it.
    pub async fn run_child(&self, agent_ref: &str, inputs: Value, sink: Option<EventSink>) -> LoomResult<Value> {
        debug!(parent = %self.task_id(), agent = %agent_ref, "running sub-agent");
        let options = ExecuteOptions {
            parent_task_id: Some(self.task_id().clone()),
            required: true,
            deadline: self.deadline,
            max_retries: self.caller_max_retries,
            user_message: None,
        };
        let sink = sink.unwrap_or_else(|| self.emitter.sink().clone());
        self.runtime
            .execute_in(&self.identity.project_id, agent_ref, inputs, options, sink)
            .await
    }
}

/// Inputs as an object map; anything else is treated as no inputs.
pub fn input_map(inputs: &Value) -> Map<String, Value> {
    inputs.as_object().cloned().unwrap_or_default()
}
