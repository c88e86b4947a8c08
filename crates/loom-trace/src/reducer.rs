//! The task-tree reducer.
//!
//! Folds the flat `StreamEvent` sequence of one run into a [`TaskTree`]: the
//! user turn, the assistant turn, and one `Trace` per observed task.
//!
//! `reduce` is a pure by-value fold. It reads no clock and mints no ids, so
//! replaying the same ordered events from a fresh state always yields an
//! equal tree. Timestamps come from the events themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use loom_contracts::{
    agent::RespondAs,
    event::{ChunkDelta, ExecutePhase, StreamEvent},
    execution::TaskId,
    message::{AggregatedMessage, LogEntry, OutputBuffer, SubMessage, Trace, UserMessage},
};

/// The reducer state of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTree {
    pub user: UserMessage,
    pub assistant: AggregatedMessage,
    /// The first task observed with a CHUNK; fixed for the rest of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_task_id: Option<TaskId>,
}

impl TaskTree {
    /// An empty tree for the two root message ids supplied by the caller.
    pub fn new(user_message_id: impl Into<String>, assistant_message_id: impl Into<String>) -> Self {
        Self {
            user: UserMessage {
                id: user_message_id.into(),
                content: String::new(),
            },
            assistant: AggregatedMessage {
                id: assistant_message_id.into(),
                ..AggregatedMessage::default()
            },
            main_task_id: None,
        }
    }

    /// Return the trace for `task_id`, inserting a fresh one when absent.
    ///
    /// `deep` is derived from whatever parent trace exists right now and is
    /// never recomputed afterwards, even if the parent shows up later.
    fn ensure_trace(
        &mut self,
        task_id: &TaskId,
        parent_task_id: Option<&TaskId>,
        assistant_id: &str,
    ) -> &mut Trace {
        let position = self
            .assistant
            .input_messages
            .iter()
            .position(|t| &t.task_id == task_id);

        let index = match position {
            Some(index) => index,
            None => {
                let deep = parent_task_id
                    .and_then(|parent| self.assistant.trace(parent))
                    .map_or(0, |parent| parent.deep + 1);
                trace!(task_id = %task_id, deep, "inserting trace");
                self.assistant.input_messages.push(Trace {
                    task_id: task_id.clone(),
                    parent_task_id: parent_task_id.cloned(),
                    assistant_id: assistant_id.to_string(),
                    assistant_name: String::new(),
                    deep,
                    input_parameters: Value::Null,
                    prompt_messages: None,
                    output: OutputBuffer::default(),
                    logs: Vec::new(),
                    usage: None,
                    start_time: None,
                    end_time: None,
                    stop: false,
                });
                self.assistant.input_messages.len() - 1
            }
        };

        let trace = &mut self.assistant.input_messages[index];
        if trace.parent_task_id.is_none() {
            trace.parent_task_id = parent_task_id.cloned();
        }
        trace
    }
}

fn append_delta(buffer: &mut OutputBuffer, delta: &ChunkDelta) {
    if let Some(content) = &delta.content {
        buffer.content.push_str(content);
    }
    if let Some(object) = &delta.object {
        buffer.objects.push(object.clone());
    }
    if let Some(images) = &delta.images {
        buffer.images.extend(images.iter().cloned());
    }
}

/// Apply one event to the tree.
///
/// Once the assistant message carries an error or was cancelled the tree is
/// returned unchanged.
pub fn reduce(mut state: TaskTree, event: &StreamEvent) -> TaskTree {
    if state.assistant.is_frozen() {
        return state;
    }

    match event {
        StreamEvent::InputParameter { content } => {
            state.user.content = content.clone();
        }

        StreamEvent::Input {
            task_id,
            parent_task_id,
            assistant_id,
            assistant_name,
            input_parameters,
            prompt_messages,
        } => {
            let trace = state.ensure_trace(task_id, parent_task_id.as_ref(), assistant_id);
            trace.assistant_id = assistant_id.clone();
            trace.assistant_name = assistant_name.clone();
            trace.input_parameters = input_parameters.clone();
            if prompt_messages.is_some() {
                trace.prompt_messages = prompt_messages.clone();
            }
        }

        StreamEvent::Chunk {
            task_id,
            assistant_id,
            delta,
            respond_as,
        } => {
            let main = state.main_task_id.get_or_insert_with(|| task_id.clone()).clone();
            if &main == task_id {
                let message = &mut state.assistant;
                if let Some(content) = &delta.content {
                    message.content.push_str(content);
                }
                if let Some(object) = &delta.object {
                    message.objects.push(object.clone());
                }
                if let Some(images) = &delta.images {
                    message.images.extend(images.iter().cloned());
                }
            } else {
                if *respond_as != Some(RespondAs::None) {
                    let subs = &mut state.assistant.sub_messages;
                    let index = match subs.iter().position(|s| &s.task_id == task_id) {
                        Some(index) => index,
                        None => {
                            subs.push(SubMessage {
                                task_id: task_id.clone(),
                                assistant_id: assistant_id.clone(),
                                output: OutputBuffer::default(),
                            });
                            subs.len() - 1
                        }
                    };
                    append_delta(&mut subs[index].output, delta);
                }
                let trace = state.ensure_trace(task_id, None, assistant_id);
                append_delta(&mut trace.output, delta);
            }
        }

        StreamEvent::Execute {
            task_id,
            parent_task_id,
            assistant_id,
            assistant_name,
            execution,
            timestamp,
        } => {
            let trace = state.ensure_trace(task_id, parent_task_id.as_ref(), assistant_id);
            if let Some(name) = assistant_name {
                if trace.assistant_name.is_empty() {
                    trace.assistant_name = name.clone();
                }
            }
            match execution.current_phase {
                ExecutePhase::ExecuteAssistantStart => {
                    if timestamp.is_some() {
                        trace.start_time = *timestamp;
                    }
                }
                ExecutePhase::ExecuteAssistantEnd => {
                    if timestamp.is_some() {
                        trace.end_time = *timestamp;
                    }
                }
                ExecutePhase::ExecuteSelectStop => {
                    if timestamp.is_some() {
                        trace.end_time = *timestamp;
                    }
                    trace.stop = true;
                }
            }
        }

        StreamEvent::Usage {
            task_id,
            assistant_id,
            usage,
        } => {
            let trace = state.ensure_trace(task_id, None, assistant_id);
            trace.usage.get_or_insert_with(Default::default).add(usage);
            state
                .assistant
                .usage
                .get_or_insert_with(Default::default)
                .add(usage);
        }

        StreamEvent::Log {
            task_id,
            assistant_id,
            log,
            timestamp,
        } => {
            let trace = state.ensure_trace(task_id, None, assistant_id);
            trace.logs.push(LogEntry {
                message: log.clone(),
                timestamp: *timestamp,
            });
        }

        StreamEvent::Error { error } => {
            debug!(message = %error.message, "run error observed; freezing message");
            state.assistant.error = Some(error.clone());
        }

        StreamEvent::Progress { .. } => {}
    }

    state
}

/// Stateful wrapper around [`reduce`] for consumers that receive events one
/// at a time.
#[derive(Debug, Clone, Default)]
pub struct TaskTreeReducer {
    state: TaskTree,
}

impl TaskTreeReducer {
    pub fn new(user_message_id: impl Into<String>, assistant_message_id: impl Into<String>) -> Self {
        Self {
            state: TaskTree::new(user_message_id, assistant_message_id),
        }
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, event);
    }

    pub fn apply_all<'e>(&mut self, events: impl IntoIterator<Item = &'e StreamEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    /// Mark the run as cancelled; every later event is ignored.
    pub fn cancel(&mut self) {
        self.state.assistant.cancelled = true;
    }

    pub fn state(&self) -> &TaskTree {
        &self.state
    }

    pub fn message(&self) -> &AggregatedMessage {
        &self.state.assistant
    }

    pub fn into_state(self) -> TaskTree {
        self.state
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use loom_contracts::{
        event::{ErrorPayload, Execution},
        model::Usage,
    };

    use super::*;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn input(task: &str, parent: Option<&str>, name: &str) -> StreamEvent {
        StreamEvent::Input {
            task_id: TaskId::from(task),
            parent_task_id: parent.map(TaskId::from),
            assistant_id: format!("{name}-id"),
            assistant_name: name.to_string(),
            input_parameters: json!({ "q": name }),
            prompt_messages: None,
        }
    }

    fn execute(task: &str, parent: Option<&str>, phase: ExecutePhase, second: u32) -> StreamEvent {
        StreamEvent::Execute {
            task_id: TaskId::from(task),
            parent_task_id: parent.map(TaskId::from),
            assistant_id: format!("{task}-id"),
            assistant_name: None,
            execution: Execution { current_phase: phase },
            timestamp: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, second).unwrap()),
        }
    }

    fn chunk(task: &str, delta: ChunkDelta, respond_as: Option<RespondAs>) -> StreamEvent {
        StreamEvent::Chunk {
            task_id: TaskId::from(task),
            assistant_id: format!("{task}-id"),
            delta,
            respond_as,
        }
    }

    fn sample_run() -> Vec<StreamEvent> {
        vec![
            StreamEvent::InputParameter { content: "hello".into() },
            input("root", None, "root"),
            execute("root", None, ExecutePhase::ExecuteAssistantStart, 0),
            chunk("root", ChunkDelta::content("Hi "), None),
            input("child", Some("root"), "child"),
            execute("child", Some("root"), ExecutePhase::ExecuteAssistantStart, 1),
            chunk("child", ChunkDelta::content("sub"), None),
            chunk("child", ChunkDelta::object(json!({ "a": 1 })), Some(RespondAs::Message)),
            StreamEvent::Log {
                task_id: TaskId::from("child"),
                assistant_id: "child-id".into(),
                log: "working".into(),
                timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 2).unwrap(),
            },
            StreamEvent::Usage {
                task_id: TaskId::from("child"),
                assistant_id: "child-id".into(),
                usage: Usage {
                    prompt_tokens: 3,
                    completion_tokens: 4,
                    total_tokens: 7,
                },
            },
            execute("child", Some("root"), ExecutePhase::ExecuteAssistantEnd, 3),
            chunk("root", ChunkDelta::content("there"), None),
            execute("root", None, ExecutePhase::ExecuteAssistantEnd, 4),
        ]
    }

    fn fold(events: &[StreamEvent]) -> TaskTree {
        events.iter().fold(TaskTree::new("u", "a"), reduce)
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    #[test]
    fn main_task_chunks_go_to_assistant_message() {
        let tree = fold(&sample_run());

        assert_eq!(tree.user.content, "hello");
        assert_eq!(tree.main_task_id, Some(TaskId::from("root")));
        assert_eq!(tree.assistant.content, "Hi there");
        assert!(tree.assistant.objects.is_empty());

        let sub = &tree.assistant.sub_messages[0];
        assert_eq!(sub.task_id, TaskId::from("child"));
        assert_eq!(sub.output.content, "sub");
        assert_eq!(sub.output.objects, vec![json!({ "a": 1 })]);

        let child = tree.assistant.trace(&TaskId::from("child")).unwrap();
        assert_eq!(child.output.content, "sub");
        assert_eq!(child.deep, 1);
        assert_eq!(child.logs[0].message, "working");
        assert_eq!(child.usage.unwrap().total_tokens, 7);
        assert!(child.start_time.is_some() && child.end_time.is_some());
        assert_eq!(tree.assistant.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn respond_as_none_skips_sub_message_but_keeps_trace_output() {
        let events = vec![
            chunk("root", ChunkDelta::content("x"), None),
            input("quiet", Some("root"), "quiet"),
            chunk("quiet", ChunkDelta::content("hidden"), Some(RespondAs::None)),
        ];
        let tree = fold(&events);

        assert!(tree.assistant.sub_messages.is_empty());
        let quiet = tree.assistant.trace(&TaskId::from("quiet")).unwrap();
        assert_eq!(quiet.output.content, "hidden");
    }

    #[test]
    fn select_stop_sets_stop_flag() {
        let events = vec![
            input("d", None, "decide"),
            execute("d", None, ExecutePhase::ExecuteAssistantStart, 0),
            execute("d", None, ExecutePhase::ExecuteSelectStop, 1),
        ];
        let tree = fold(&events);
        let trace = tree.assistant.trace(&TaskId::from("d")).unwrap();
        assert!(trace.stop);
        assert!(trace.end_time.is_some());
    }

    #[test]
    fn progress_is_ignored() {
        let before = fold(&sample_run());
        let mut events = sample_run();
        events.insert(3, StreamEvent::Progress { payload: json!({ "pct": 50 }) });
        assert_eq!(fold(&events), before);
    }

    // ── Idempotence and ordering ──────────────────────────────────────────────

    #[test]
    fn replay_is_idempotent() {
        let events = sample_run();
        assert_eq!(fold(&events), fold(&events));
    }

    #[test]
    fn input_and_execute_order_converges() {
        let input_first = fold(&[
            input("t", None, "agent"),
            execute("t", None, ExecutePhase::ExecuteAssistantStart, 0),
        ]);
        let execute_first = fold(&[
            execute("t", None, ExecutePhase::ExecuteAssistantStart, 0),
            input("t", None, "agent"),
        ]);
        assert_eq!(input_first.assistant.input_messages, execute_first.assistant.input_messages);
    }

    #[test]
    fn deep_is_fixed_at_insertion() {
        let tree = fold(&[input("B", Some("A"), "b")]);
        assert_eq!(tree.assistant.trace(&TaskId::from("B")).unwrap().deep, 0);

        let tree = reduce(tree, &input("A", None, "a"));
        assert_eq!(tree.assistant.trace(&TaskId::from("B")).unwrap().deep, 0);
        assert_eq!(tree.assistant.trace(&TaskId::from("A")).unwrap().deep, 0);
    }

    // ── Freezing ──────────────────────────────────────────────────────────────

    #[test]
    fn error_freezes_message() {
        let mut events = vec![
            chunk("root", ChunkDelta::content("partial"), None),
            StreamEvent::Error {
                error: ErrorPayload {
                    message: "boom".into(),
                    kind: Some("ModelError".into()),
                    timestamp: None,
                },
            },
        ];
        events.push(chunk("root", ChunkDelta::content(" more"), None));
        let tree = fold(&events);

        assert_eq!(tree.assistant.content, "partial");
        assert_eq!(tree.assistant.error.as_ref().unwrap().message, "boom");
    }

    #[test]
    fn cancel_freezes_message() {
        let mut reducer = TaskTreeReducer::new("u", "a");
        reducer.apply(&chunk("root", ChunkDelta::content("a"), None));
        reducer.cancel();
        reducer.apply(&chunk("root", ChunkDelta::content("b"), None));

        assert!(reducer.message().cancelled);
        assert_eq!(reducer.message().content, "a");
    }

    #[test]
    fn wrapper_matches_fold() {
        let events = sample_run();
        let mut reducer = TaskTreeReducer::new("u", "a");
        reducer.apply_all(&events);
        assert_eq!(reducer.into_state(), fold(&events));
    }
}
