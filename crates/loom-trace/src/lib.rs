//! # loom-trace
//!
//! Consumer side of the LOOM event protocol.
//!
//! - [`reducer`] folds the flat `StreamEvent` sequence of a run into one
//!   `AggregatedMessage` with a trace per task.
//! - [`recorder`] keeps an append-only, SHA-256 chained copy of a run's
//!   events for replay and digest comparison.
//!
//! ```rust,ignore
//! use loom_trace::{EventRecorder, TaskTreeReducer};
//!
//! let recorder = EventRecorder::new("run-001");
//! runtime.execute(&agent, inputs, options, recorder.sink()).await?;
//!
//! assert!(recorder.verify_integrity());
//! let tree = recorder.replay("user-msg", "assistant-msg");
//! ```

pub mod chain;
pub mod event;
pub mod recorder;
pub mod reducer;

pub use chain::{hash_event, verify_chain};
pub use event::{EventLog, RecordedEvent};
pub use recorder::EventRecorder;
pub use reducer::{reduce, TaskTree, TaskTreeReducer};
