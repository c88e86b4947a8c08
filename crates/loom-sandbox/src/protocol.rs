//! Messages exchanged across the sandbox boundary.
//!
//! The interpreter thread never touches host state. Everything it needs
//! from the host travels as a [`HostRequest`] with a one-shot reply, and
//! everything it produces travels back as a [`SandboxMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use loom_contracts::error::{LoomError, LoomResult};

/// A host function invocation made by the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum HostCall {
    /// `log(message)`.
    Log { message: String },

    /// `fetch(method, url, body)`.
    Fetch {
        method: String,
        url: String,
        #[serde(default)]
        body: Value,
    },

    /// `run_agent(name, inputs[, #{relay: true}])`.
    RunAgent {
        agent: String,
        inputs: Value,
        relay_text: bool,
    },

    /// `json(parts)`.
    RenderJson { parts: Vec<JsonPart> },
}

impl HostCall {
    pub fn name(&self) -> &'static str {
        match self {
            HostCall::Log { .. } => "log",
            HostCall::Fetch { .. } => "fetch",
            HostCall::RunAgent { .. } => "run_agent",
            HostCall::RenderJson { .. } => "json",
        }
    }
}

/// One element of a `json(parts)` template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum JsonPart {
    /// Raw JSON text, spliced verbatim.
    Raw { text: String },
    /// A sub-agent whose streamed text becomes a JSON string literal.
    Agent { agent: String, inputs: Value },
    /// A script value, serialized as JSON.
    Value { value: Value },
}

/// A host call plus the channel its answer goes back on.
#[derive(Debug)]
pub struct HostRequest {
    pub call: HostCall,
    pub reply: oneshot::Sender<LoomResult<Value>>,
}

/// One item of a relayed stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayChunk {
    Data { value: Value },
    Error { message: String },
    Done,
}

/// Everything the interpreter thread sends to the host.
#[derive(Debug)]
pub enum SandboxMessage {
    Host(HostRequest),
    /// The script's return value, with every stream replaced by a
    /// `{"$stream": "<path>"}` sentinel.
    Result(Value),
    /// An item of the stream found at `path` in the result.
    Relay { path: String, chunk: RelayChunk },
    Failed(LoomError),
}
