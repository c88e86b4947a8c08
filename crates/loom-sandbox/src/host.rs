//! Host functions registered into the interpreter.
//!
//! Only functions whose capability is granted are registered; a script
//! calling anything else fails with a "function not found" error. Stream
//! helpers (`stream`, `push`, `fail`) are always available because they
//! never leave the interpreter thread.

use std::cell::RefCell;
use std::rc::Rc;

use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position};
use serde_json::Value;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::trace;

use loom_contracts::{
    capability::{CapabilitySet, HostCapability},
    error::LoomError,
};

use crate::{
    convert::{to_dynamic, to_plain_json},
    protocol::{HostCall, HostRequest, JsonPart, RelayChunk, SandboxMessage},
};

/// Termination token used when the host stops answering.
pub(crate) const HOST_GONE: &str = "host closed the channel";

const AGENT_KEY: &str = "$agent";

/// A script-created stream. The items live in the thread's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptStream {
    pub(crate) id: usize,
}

/// Items pushed into each stream, indexed by stream id.
#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    streams: Vec<Vec<RelayChunk>>,
}

impl StreamRegistry {
    fn create(&mut self) -> ScriptStream {
        self.streams.push(Vec::new());
        ScriptStream {
            id: self.streams.len() - 1,
        }
    }

    fn push(&mut self, stream: ScriptStream, chunk: RelayChunk) {
        if let Some(items) = self.streams.get_mut(stream.id) {
            items.push(chunk);
        }
    }

    /// Remove and return the items of `stream`, terminated by `Done` unless
    /// the stream already failed.
    pub(crate) fn drain(&mut self, stream: ScriptStream) -> Vec<RelayChunk> {
        let mut items = self
            .streams
            .get_mut(stream.id)
            .map(std::mem::take)
            .unwrap_or_default();
        if !matches!(items.last(), Some(RelayChunk::Error { .. })) {
            items.push(RelayChunk::Done);
        }
        items
    }
}

/// A runtime error value the script can catch, shaped like a thrown map.
pub(crate) fn script_error(name: &str, message: impl Into<String>) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert("name".into(), Dynamic::from(ImmutableString::from(name)));
    map.insert("message".into(), Dynamic::from(ImmutableString::from(message.into())));
    EvalAltResult::ErrorRuntime(Dynamic::from_map(map), Position::NONE).into()
}

/// A host failure the script must not intercept, carried back out of the
/// interpreter unchanged.
#[derive(Debug, Clone)]
pub(crate) struct HostFailure(pub(crate) LoomError);

/// Failures a script may catch and recover from. Anything else ends the run.
fn is_catchable(err: &LoomError) -> bool {
    matches!(
        err,
        LoomError::Script(_)
            | LoomError::Http { .. }
            | LoomError::Model { .. }
            | LoomError::OutputValidation { .. }
            | LoomError::UnexpectedResponseFormat { .. }
            | LoomError::InvalidInput { .. }
            | LoomError::Serialization { .. }
    )
}

/// Turn a host error into the interpreter error the script observes.
pub(crate) fn host_error(err: LoomError) -> Box<EvalAltResult> {
    if is_catchable(&err) {
        return script_error(err.kind(), err.to_string());
    }
    EvalAltResult::ErrorTerminated(Dynamic::from(HostFailure(err)), Position::NONE).into()
}

fn host_gone() -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::from(ImmutableString::from(HOST_GONE)), Position::NONE).into()
}

/// Send `call` to the host and block this thread until it answers.
fn call_host(tx: &UnboundedSender<SandboxMessage>, call: HostCall) -> Result<Dynamic, Box<EvalAltResult>> {
    trace!(call = call.name(), "sandbox host call");
    let (reply, answer) = oneshot::channel();
    tx.send(SandboxMessage::Host(HostRequest { call, reply }))
        .map_err(|_| host_gone())?;
    match answer.blocking_recv() {
        Ok(Ok(value)) => Ok(to_dynamic(value)),
        Ok(Err(err)) => Err(host_error(err)),
        Err(_) => Err(host_gone()),
    }
}

fn json_part(item: Dynamic) -> JsonPart {
    if item.is::<ImmutableString>() {
        return JsonPart::Raw {
            text: item.into_string().unwrap_or_default(),
        };
    }
    match to_plain_json(item) {
        Value::Object(mut map) if map.contains_key(AGENT_KEY) => JsonPart::Agent {
            agent: map
                .remove(AGENT_KEY)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            inputs: map.remove("inputs").unwrap_or(Value::Null),
        },
        value => JsonPart::Value { value },
    }
}

pub(crate) fn register_streams(engine: &mut Engine, registry: Rc<RefCell<StreamRegistry>>) {
    engine.register_type_with_name::<ScriptStream>("Stream");

    let reg = registry.clone();
    engine.register_fn("stream", move || reg.borrow_mut().create());

    let reg = registry.clone();
    engine.register_fn("push", move |stream: &mut ScriptStream, value: Dynamic| {
        reg.borrow_mut().push(
            *stream,
            RelayChunk::Data {
                value: to_plain_json(value),
            },
        );
    });

    let reg = registry;
    engine.register_fn("fail", move |stream: &mut ScriptStream, message: &str| {
        reg.borrow_mut().push(
            *stream,
            RelayChunk::Error {
                message: message.to_string(),
            },
        );
    });
}

pub(crate) fn register_host_functions(
    engine: &mut Engine,
    capabilities: &CapabilitySet,
    tx: &UnboundedSender<SandboxMessage>,
) {
    if capabilities.has(HostCapability::Log) {
        let sender = tx.clone();
        engine.register_fn("log", move |message: &str| -> Result<(), Box<EvalAltResult>> {
            call_host(
                &sender,
                HostCall::Log {
                    message: message.to_string(),
                },
            )
            .map(|_| ())
        });

        // `print`/`debug` go to the same place, without waiting for the host.
        let sender = tx.clone();
        engine.on_print(move |text| {
            let (reply, _) = oneshot::channel();
            let call = HostCall::Log {
                message: text.to_string(),
            };
            let _ = sender.send(SandboxMessage::Host(HostRequest { call, reply }));
        });
        let sender = tx.clone();
        engine.on_debug(move |text, _source, _pos| {
            let (reply, _) = oneshot::channel();
            let call = HostCall::Log {
                message: text.to_string(),
            };
            let _ = sender.send(SandboxMessage::Host(HostRequest { call, reply }));
        });
    } else {
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
    }

    if capabilities.has(HostCapability::Http) {
        let sender = tx.clone();
        engine.register_fn(
            "fetch",
            move |method: &str, url: &str, body: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                call_host(
                    &sender,
                    HostCall::Fetch {
                        method: method.to_uppercase(),
                        url: url.to_string(),
                        body: to_plain_json(body),
                    },
                )
            },
        );
        let sender = tx.clone();
        engine.register_fn("fetch", move |url: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            call_host(
                &sender,
                HostCall::Fetch {
                    method: "GET".to_string(),
                    url: url.to_string(),
                    body: Value::Null,
                },
            )
        });
    }

    if capabilities.has(HostCapability::RunAgent) {
        let sender = tx.clone();
        engine.register_fn(
            "run_agent",
            move |agent: &str, inputs: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                call_host(
                    &sender,
                    HostCall::RunAgent {
                        agent: agent.to_string(),
                        inputs: to_plain_json(inputs),
                        relay_text: false,
                    },
                )
            },
        );
        let sender = tx.clone();
        engine.register_fn(
            "run_agent",
            move |agent: &str, inputs: Dynamic, options: Map| -> Result<Dynamic, Box<EvalAltResult>> {
                let relay_text = options
                    .get("relay")
                    .and_then(|v| v.as_bool().ok())
                    .unwrap_or(false);
                call_host(
                    &sender,
                    HostCall::RunAgent {
                        agent: agent.to_string(),
                        inputs: to_plain_json(inputs),
                        relay_text,
                    },
                )
            },
        );
    }

    if capabilities.has(HostCapability::Json) {
        engine.register_fn("agent", |agent: &str, inputs: Dynamic| {
            let mut map = Map::new();
            map.insert(AGENT_KEY.into(), Dynamic::from(ImmutableString::from(agent)));
            map.insert("inputs".into(), inputs);
            map
        });

        let sender = tx.clone();
        engine.register_fn("json", move |parts: rhai::Array| -> Result<Dynamic, Box<EvalAltResult>> {
            let parts = parts.into_iter().map(json_part).collect();
            call_host(&sender, HostCall::RenderJson { parts })
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn registry_terminates_streams() {
        let mut registry = StreamRegistry::default();
        let ok = registry.create();
        let bad = registry.create();
        registry.push(ok, RelayChunk::Data { value: json!(1) });
        registry.push(bad, RelayChunk::Error { message: "nope".into() });

        assert_eq!(
            registry.drain(ok),
            vec![RelayChunk::Data { value: json!(1) }, RelayChunk::Done]
        );
        assert_eq!(
            registry.drain(bad),
            vec![RelayChunk::Error { message: "nope".into() }]
        );
    }

    #[test]
    fn json_parts_are_classified() {
        assert_eq!(
            json_part(Dynamic::from(ImmutableString::from("{\"a\":"))),
            JsonPart::Raw { text: "{\"a\":".into() }
        );

        let mut descriptor = Map::new();
        descriptor.insert(AGENT_KEY.into(), Dynamic::from(ImmutableString::from("writer")));
        descriptor.insert("inputs".into(), Dynamic::from_map(Map::new()));
        assert_eq!(
            json_part(Dynamic::from_map(descriptor)),
            JsonPart::Agent {
                agent: "writer".into(),
                inputs: json!({}),
            }
        );

        assert_eq!(
            json_part(Dynamic::from(3 as rhai::INT)),
            JsonPart::Value { value: json!(3) }
        );
    }
}
