//! # loom-contracts
//!
//! Shared types, schemas, and contracts for the LOOM agent runtime.
//!
//! All crates in the workspace import from here. No execution logic lives in
//! this crate — only data definitions, the event protocol, the identity
//! codec, and error types.

pub mod agent;
pub mod capability;
pub mod error;
pub mod event;
pub mod execution;
pub mod identity;
pub mod message;
pub mod model;
pub mod verify;

pub use error::{LoomError, LoomResult, ScriptFault};
pub use event::{EventSink, RunUpdate, StreamEvent};
pub use execution::TaskId;
pub use identity::{AgentIdentity, AgentRef};
