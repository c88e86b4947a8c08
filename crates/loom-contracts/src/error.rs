//! Runtime error types for the LOOM execution pipeline.
//!
//! All fallible operations in the LOOM crates return `LoomResult<T>`.
//! Variants carry enough context to build a user-visible ERROR event.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An uncaught exception raised by a sandboxed script.
///
/// The cause chain thrown by the script is preserved and exposed through
/// `std::error::Error::source`, so callers can walk it like any other error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptFault {
    /// Error name as thrown by the script (defaults to `"Error"`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// The error this one was raised from, if the script supplied one.
    pub cause: Option<Box<ScriptFault>>,
}

impl ScriptFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ScriptFault) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ScriptFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// The unified error type for the LOOM runtime.
#[derive(Debug, Clone, Error)]
pub enum LoomError {
    /// An agent identity or token is malformed.
    #[error("invalid agent identity: {reason}")]
    InvalidIdentity { reason: String },

    /// Resolution of an agent reference yielded nothing.
    #[error("agent '{agent}' not found")]
    AgentNotFound { agent: String },

    /// Caller-supplied inputs do not satisfy the agent's declared inputs.
    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    /// Generated output failed the agent's declared output schema.
    #[error("output validation failed: {reason}")]
    OutputValidation { reason: String },

    /// Output validation kept failing until the retry budget was spent.
    #[error("unexpected response format from '{agent}' after {attempts} attempt(s): {reason}")]
    UnexpectedResponseFormat {
        agent: String,
        attempts: u32,
        reason: String,
    },

    /// An uncaught exception inside a sandboxed script.
    #[error("script error: {0}")]
    Script(#[source] ScriptFault),

    /// The sandbox hit its memory, time, or operation budget.
    #[error("resource exceeded: {resource} (limit {limit})")]
    ResourceExceeded { resource: String, limit: String },

    /// A script imported a module outside the allow-list.
    #[error("unsupported module '{module}'")]
    UnsupportedModule { module: String },

    /// The model-call collaborator failed.
    #[error("model call failed: {reason}")]
    Model { reason: String },

    /// An outbound HTTP call failed or returned a non-success status.
    #[error("http call failed: {reason}")]
    Http { status: Option<u16>, reason: String },

    /// A task lifecycle transition was attempted from the wrong state.
    #[error("state machine error: {reason}")]
    StateMachine { reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A JSON Schema document could not be compiled.
    #[error("schema validation error: {reason}")]
    SchemaValidation { reason: String },

    /// An agent definition is internally inconsistent.
    #[error("invalid agent definition '{agent}': {reason}")]
    InvalidDefinition { agent: String, reason: String },

    /// A value could not be serialized to or parsed from JSON.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The run was abandoned by its consumer.
    #[error("execution cancelled")]
    Cancelled,
}

impl LoomError {
    /// Stable discriminant used as the `type` of an ERROR event.
    pub fn kind(&self) -> &'static str {
        match self {
            LoomError::InvalidIdentity { .. } => "InvalidIdentity",
            LoomError::AgentNotFound { .. } => "AgentNotFound",
            LoomError::InvalidInput { .. } => "InvalidInput",
            LoomError::OutputValidation { .. } => "OutputValidation",
            LoomError::UnexpectedResponseFormat { .. } => "UnexpectedResponseFormat",
            LoomError::Script(_) => "ScriptError",
            LoomError::ResourceExceeded { .. } => "ResourceExceeded",
            LoomError::UnsupportedModule { .. } => "UnsupportedModule",
            LoomError::Model { .. } => "ModelError",
            LoomError::Http { .. } => "HttpError",
            LoomError::StateMachine { .. } => "StateMachineError",
            LoomError::Config { .. } => "ConfigError",
            LoomError::SchemaValidation { .. } => "SchemaValidation",
            LoomError::InvalidDefinition { .. } => "InvalidDefinition",
            LoomError::Serialization { .. } => "SerializationError",
            LoomError::Cancelled => "Cancelled",
        }
    }

    /// Only output validation failures are retried by the executors.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoomError::OutputValidation { .. })
    }
}

impl From<serde_json::Error> for LoomError {
    fn from(err: serde_json::Error) -> Self {
        LoomError::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the LOOM crates.
pub type LoomResult<T> = Result<T, LoomError>;
