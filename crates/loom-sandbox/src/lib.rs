//! # loom-sandbox
//!
//! Isolated, resource-bounded execution of user scripts.
//!
//! Each [`run`] starts a fresh `rhai` engine on its own OS thread. The
//! script sees only its arguments, the stream helpers, and the host
//! functions its [`CapabilitySet`](loom_contracts::capability::CapabilitySet)
//! grants. It talks to the host exclusively through [`SandboxMessage`]s:
//!
//! ```text
//!  interpreter thread                     host task
//!  ──────────────────                     ─────────
//!  Host(HostRequest) ───────────────────▶ HostHandler::handle
//!        ◀─────────────── one-shot reply
//!  Result(value with $stream sentinels) ▶ SandboxOutcome
//!  Relay { path, data|error|done } ─────▶ RelayDemux::stream(path)
//! ```
//!
//! Failures surface as `LoomError::Script`, `ResourceExceeded` (memory,
//! time, operations) or `UnsupportedModule` (rejected before the thread is
//! started).

pub mod convert;
mod fault;
pub mod host;
pub mod limits;
pub mod modules;
pub mod protocol;
pub mod session;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use rhai::{Dynamic, Engine, Scope};
use serde_json::{Map as JsonMap, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

use loom_contracts::error::{LoomError, LoomResult};

use crate::convert::{binary_size, to_dynamic, to_json};
use crate::host::StreamRegistry;

pub use host::ScriptStream;
pub use limits::SandboxLimits;
pub use protocol::{HostCall, HostRequest, JsonPart, RelayChunk, SandboxMessage};
pub use session::{HostHandler, RelayDemux, SandboxOutcome, SandboxSession};

/// Start `code` with `args` bound as variables.
///
/// Imports outside the allow-list and oversized binary arguments are
/// rejected here, before any interpreter exists.
pub fn run(code: &str, args: JsonMap<String, Value>, limits: SandboxLimits) -> LoomResult<SandboxSession> {
    modules::check_imports(code, &limits.allowed_modules)?;

    let binary_bytes: usize = args.values().map(binary_size).sum();
    if binary_bytes as u64 > limits.memory_limit_bytes {
        return Err(LoomError::ResourceExceeded {
            resource: "memory".to_string(),
            limit: format!("{} bytes", limits.memory_limit_bytes),
        });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let deadline = Instant::now() + limits.deadline;
    let deadline_ms = limits.deadline.as_millis();
    let code = code.to_string();

    std::thread::Builder::new()
        .name("loom-sandbox".to_string())
        .spawn(move || interpret(&code, args, &limits, deadline, &tx))
        .map_err(|e| LoomError::ResourceExceeded {
            resource: "threads".to_string(),
            limit: e.to_string(),
        })?;

    Ok(SandboxSession::new(
        rx,
        tokio::time::Instant::from_std(deadline),
        deadline_ms,
    ))
}

/// Body of the interpreter thread.
fn interpret(
    code: &str,
    args: JsonMap<String, Value>,
    limits: &SandboxLimits,
    deadline: Instant,
    tx: &UnboundedSender<SandboxMessage>,
) {
    let registry = Rc::new(RefCell::new(StreamRegistry::default()));

    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    limits.apply(&mut engine, deadline);
    engine.set_module_resolver(modules::resolver(&limits.allowed_modules));
    host::register_streams(&mut engine, registry.clone());
    host::register_host_functions(&mut engine, &limits.capabilities, tx);

    let outcome = engine
        .compile(code)
        .map_err(|e| fault::from_parse_error(&e))
        .and_then(|ast| {
            let mut scope = Scope::new();
            for (name, value) in args {
                scope.push_dynamic(name, to_dynamic(value));
            }
            engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(|e| fault::from_eval_error(&e, limits))
        });

    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "script failed");
            let _ = tx.send(SandboxMessage::Failed(err));
            return;
        }
    };

    let mut streams = Vec::new();
    let result = to_json(value, "", &mut streams);
    if tx.send(SandboxMessage::Result(result)).is_err() {
        return;
    }

    for (path, stream) in streams {
        let chunks = registry.borrow_mut().drain(stream);
        for chunk in chunks {
            if tx
                .send(SandboxMessage::Relay {
                    path: path.clone(),
                    chunk,
                })
                .is_err()
            {
                warn!(%path, "host dropped the relay channel");
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
