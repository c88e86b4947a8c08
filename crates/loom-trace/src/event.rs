//! Recorded event and sealed log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_contracts::event::StreamEvent;

/// One entry of a run's event chain.
///
/// Changing any field, including the embedded event, invalidates
/// `this_hash` and every later `prev_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Position in the chain, starting at 0.
    pub sequence: u64,

    pub run_id: String,

    pub event: StreamEvent,

    /// Hash of the previous entry, or `GENESIS_HASH` for the first.
    pub prev_hash: String,

    pub this_hash: String,
}

impl RecordedEvent {
    /// The `prev_hash` of the first event in every chain.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A sealed copy of everything one run emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub run_id: String,

    /// Events in emission order.
    pub events: Vec<RecordedEvent>,

    pub finalized_at: DateTime<Utc>,

    /// The `this_hash` of the last event. Empty when nothing was recorded.
    ///
    /// Two runs that emitted the same events under the same run id share the
    /// same digest.
    pub terminal_hash: String,
}

impl EventLog {
    /// The bare events, in order, for replay.
    pub fn stream_events(&self) -> impl Iterator<Item = &StreamEvent> {
        self.events.iter().map(|e| &e.event)
    }
}
