//! Host side of a running script.
//!
//! A [`SandboxSession`] owns the receiving end of the interpreter thread's
//! message channel. [`SandboxSession::complete`] services host requests
//! until the script produces its result; the relay messages that follow
//! are demultiplexed by [`RelayDemux`] into one lazy stream per path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedReceiver, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use loom_contracts::error::{LoomError, LoomResult, ScriptFault};

use crate::{
    convert::stream_paths,
    protocol::{HostCall, RelayChunk, SandboxMessage},
};

/// Services the host calls a script makes.
#[async_trait]
pub trait HostHandler: Send + Sync {
    async fn handle(&self, call: HostCall) -> LoomResult<Value>;
}

/// A script that is running (or has finished) on its interpreter thread.
pub struct SandboxSession {
    rx: UnboundedReceiver<SandboxMessage>,
    deadline: Instant,
    deadline_ms: u128,
}

/// The script's result plus access to its relayed streams.
pub struct SandboxOutcome {
    /// The returned value, with `{"$stream": path}` sentinels.
    pub value: Value,
    pub relay: RelayDemux,
}

impl SandboxOutcome {
    /// Paths of every stream sentinel in the result.
    pub fn stream_paths(&self) -> Vec<String> {
        stream_paths(&self.value)
    }
}

impl SandboxSession {
    pub(crate) fn new(rx: UnboundedReceiver<SandboxMessage>, deadline: Instant, deadline_ms: u128) -> Self {
        Self {
            rx,
            deadline,
            deadline_ms,
        }
    }

    fn time_exceeded(&self) -> LoomError {
        LoomError::ResourceExceeded {
            resource: "time".to_string(),
            limit: format!("{}ms", self.deadline_ms),
        }
    }

    /// Drive the script to completion, answering its host calls with
    /// `handler`.
    ///
    /// The deadline covers both the script and the host calls it waits on.
    /// Dropping the reply of an abandoned call unblocks the interpreter
    /// thread, which then terminates.
    pub async fn complete<H>(mut self, handler: &H) -> LoomResult<SandboxOutcome>
    where
        H: HostHandler + ?Sized,
    {
        loop {
            let message = match timeout_at(self.deadline, self.rx.recv()).await {
                Err(_) => return Err(self.time_exceeded()),
                Ok(None) => {
                    return Err(LoomError::Script(ScriptFault::new(
                        "InternalError",
                        "sandbox exited without a result",
                    )))
                }
                Ok(Some(message)) => message,
            };

            match message {
                SandboxMessage::Host(request) => {
                    let call_name = request.call.name();
                    let result = match timeout_at(self.deadline, handler.handle(request.call)).await {
                        Err(_) => return Err(self.time_exceeded()),
                        Ok(result) => result,
                    };
                    if request.reply.send(result).is_err() {
                        debug!(call = call_name, "script no longer waiting for host reply");
                    }
                }
                SandboxMessage::Result(value) => {
                    return Ok(SandboxOutcome {
                        value,
                        relay: RelayDemux::new(self.rx),
                    })
                }
                SandboxMessage::Relay { path, .. } => {
                    warn!(%path, "relay chunk before script result; dropped");
                }
                SandboxMessage::Failed(err) => return Err(err),
            }
        }
    }
}

// ── Relay demultiplexing ──────────────────────────────────────────────────────

struct DemuxState {
    rx: UnboundedReceiver<SandboxMessage>,
    buffers: HashMap<String, VecDeque<RelayChunk>>,
    closed: bool,
}

/// Splits the relay channel into independent per-path streams.
///
/// Each stream pulls from the shared channel on demand and parks chunks for
/// other paths in their buffers, so streams can be read in any order.
#[derive(Clone)]
pub struct RelayDemux {
    state: Arc<Mutex<DemuxState>>,
}

impl RelayDemux {
    fn new(rx: UnboundedReceiver<SandboxMessage>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DemuxState {
                rx,
                buffers: HashMap::new(),
                closed: false,
            })),
        }
    }

    async fn next_chunk(state: &Mutex<DemuxState>, path: &str) -> Option<RelayChunk> {
        let mut state = state.lock().await;
        loop {
            if let Some(chunk) = state.buffers.get_mut(path).and_then(VecDeque::pop_front) {
                return Some(chunk);
            }
            if state.closed {
                return None;
            }
            match state.rx.recv().await {
                Some(SandboxMessage::Relay { path, chunk }) => {
                    state.buffers.entry(path).or_default().push_back(chunk);
                }
                Some(other) => warn!(?other, "unexpected message after script result"),
                None => state.closed = true,
            }
        }
    }

    /// The items of the stream at `path`. Ends on `Done`; yields one error
    /// and ends if the script failed the stream.
    pub fn stream(&self, path: &str) -> BoxStream<'static, LoomResult<Value>> {
        let seed = (self.state.clone(), path.to_string(), false);
        stream::unfold(seed, |(state, path, finished)| async move {
            if finished {
                return None;
            }
            match Self::next_chunk(&state, &path).await? {
                RelayChunk::Data { value } => Some((Ok(value), (state, path, false))),
                RelayChunk::Error { message } => {
                    let err = LoomError::Script(ScriptFault::new("StreamError", message));
                    Some((Err(err), (state, path, true)))
                }
                RelayChunk::Done => None,
            }
        })
        .boxed()
    }
}
