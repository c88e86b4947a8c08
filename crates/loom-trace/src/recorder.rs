//! Append-only, hash-chained recording of a run's events.
//!
//! `EventRecorder` keeps every `StreamEvent` a run emits in a `Vec` behind a
//! `Mutex`, chained by SHA-256 so two recordings can be compared by digest
//! and a stored log can be checked before it is replayed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{info, warn};

use loom_contracts::{
    error::LoomResult,
    event::{EventSink, StreamEvent},
};

use crate::{
    chain::{hash_event, verify_chain},
    event::{EventLog, RecordedEvent},
    reducer::{TaskTree, TaskTreeReducer},
};

// ── Internal mutable state ────────────────────────────────────────────────────

pub(crate) struct RecorderState {
    pub(crate) events: Vec<RecordedEvent>,
    pub(crate) sequence: u64,
    pub(crate) last_hash: String,
}

impl RecorderState {
    fn append(&mut self, run_id: &str, event: &StreamEvent) -> LoomResult<()> {
        let prev_hash = self.last_hash.clone();
        let sequence = self.sequence;
        let this_hash = hash_event(run_id, sequence, event, &prev_hash)?;

        self.events.push(RecordedEvent {
            sequence,
            run_id: run_id.to_string(),
            event: event.clone(),
            prev_hash,
            this_hash: this_hash.clone(),
        });
        self.sequence += 1;
        self.last_hash = this_hash;
        Ok(())
    }
}

// ── Public recorder ───────────────────────────────────────────────────────────

/// Records one run. Cloning shares the underlying log.
#[derive(Clone)]
pub struct EventRecorder {
    run_id: String,
    pub(crate) state: Arc<Mutex<RecorderState>>,
}

impl EventRecorder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: Arc::new(Mutex::new(RecorderState {
                events: Vec::new(),
                sequence: 0,
                last_hash: RecordedEvent::GENESIS_HASH.to_string(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append one event to the chain.
    pub fn record(&self, event: &StreamEvent) -> LoomResult<()> {
        self.lock().append(&self.run_id, event)
    }

    /// A sink that records every event and then forwards it to `inner`.
    pub fn tee(&self, inner: EventSink) -> EventSink {
        let recorder = self.clone();
        EventSink::new(move |event| {
            if let Err(e) = recorder.record(&event) {
                warn!(run_id = %recorder.run_id, error = %e, "failed to record event");
            }
            inner.emit(event);
        })
    }

    /// A sink that only records.
    pub fn sink(&self) -> EventSink {
        self.tee(EventSink::discard())
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the last recorded event, or `GENESIS_HASH` before any.
    pub fn digest(&self) -> String {
        self.lock().last_hash.clone()
    }

    pub fn export_log(&self) -> EventLog {
        let state = self.lock();
        let terminal_hash = state
            .events
            .last()
            .map(|e| e.this_hash.clone())
            .unwrap_or_default();

        info!(
            run_id = %self.run_id,
            event_count = state.events.len(),
            terminal_hash = %terminal_hash,
            "event log exported"
        );

        EventLog {
            run_id: self.run_id.clone(),
            events: state.events.clone(),
            finalized_at: Utc::now(),
            terminal_hash,
        }
    }

    pub fn verify_integrity(&self) -> bool {
        verify_chain(&self.lock().events)
    }

    /// Rebuild the task tree from the recorded events.
    pub fn replay(
        &self,
        user_message_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
    ) -> TaskTree {
        let state = self.lock();
        let mut reducer = TaskTreeReducer::new(user_message_id, assistant_message_id);
        reducer.apply_all(state.events.iter().map(|e| &e.event));
        reducer.into_state()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use loom_contracts::{
        event::{ChunkDelta, StreamEvent},
        execution::TaskId,
    };

    use super::*;

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk {
            task_id: TaskId::from("root"),
            assistant_id: "writer".into(),
            delta: ChunkDelta::content(text),
            respond_as: None,
        }
    }

    fn record_all(recorder: &EventRecorder, texts: &[&str]) {
        for text in texts {
            recorder.record(&chunk(text)).unwrap();
        }
    }

    #[test]
    fn chain_is_valid_after_sequential_records() {
        let recorder = EventRecorder::new("run-1");
        record_all(&recorder, &["a", "b", "c"]);
        assert!(recorder.verify_integrity());
        assert_eq!(recorder.len(), 3);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let recorder = EventRecorder::new("run-1");
        record_all(&recorder, &["a", "b", "c"]);

        {
            let mut state = recorder.state.lock().unwrap();
            state.events[0].event = chunk("TAMPERED");
        }

        assert!(!recorder.verify_integrity());
    }

    #[test]
    fn first_event_links_to_genesis_and_sequence_is_gapless() {
        let recorder = EventRecorder::new("run-1");
        record_all(&recorder, &["a", "b", "c"]);

        let log = recorder.export_log();
        assert_eq!(log.events[0].prev_hash, RecordedEvent::GENESIS_HASH);
        for (idx, event) in log.events.iter().enumerate() {
            assert_eq!(event.sequence, idx as u64);
        }
        assert_eq!(log.terminal_hash, log.events.last().unwrap().this_hash);
        assert!(verify_chain(&log.events));
    }

    #[test]
    fn identical_runs_share_a_digest() {
        let first = EventRecorder::new("run-1");
        let second = EventRecorder::new("run-1");
        record_all(&first, &["a", "b"]);
        record_all(&second, &["a", "b"]);
        assert_eq!(first.digest(), second.digest());

        let third = EventRecorder::new("run-1");
        record_all(&third, &["a", "c"]);
        assert_ne!(first.digest(), third.digest());
    }

    #[test]
    fn empty_recorder_is_valid() {
        let recorder = EventRecorder::new("run-empty");
        assert!(recorder.is_empty());
        assert!(recorder.verify_integrity());
        assert_eq!(recorder.digest(), RecordedEvent::GENESIS_HASH);
        assert!(recorder.export_log().terminal_hash.is_empty());
    }

    #[test]
    fn tee_records_and_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let recorder = EventRecorder::new("run-tee");
        let sink = recorder.tee(EventSink::new(move |e| captured.lock().unwrap().push(e)));

        sink.emit(chunk("x"));
        sink.emit(StreamEvent::Log {
            task_id: TaskId::from("root"),
            assistant_id: "writer".into(),
            log: "hi".into(),
            timestamp: Utc::now(),
        });

        assert_eq!(recorder.len(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn replay_rebuilds_the_task_tree() {
        let recorder = EventRecorder::new("run-replay");
        record_all(&recorder, &["Hello, ", "world"]);
        recorder
            .record(&StreamEvent::Chunk {
                task_id: TaskId::from("root"),
                assistant_id: "writer".into(),
                delta: ChunkDelta::object(json!({ "done": true })),
                respond_as: None,
            })
            .unwrap();

        let tree = recorder.replay("u", "a");
        assert_eq!(tree.assistant.content, "Hello, world");
        assert_eq!(tree.assistant.objects, vec![json!({ "done": true })]);
        assert_eq!(tree, recorder.replay("u", "a"));
    }
}
