//! Scripted-logic agents: user code run in the sandbox.
//!
//! The script's host calls are answered here. Streams the script returns
//! are drained after it finishes: a stream at a streaming-text output is
//! forwarded to the user as text, any other stream is collected into an
//! array.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::debug;
use url::Url;

use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, ScriptSpec},
    error::{LoomError, LoomResult},
    verify::OutputSchema,
};
use loom_sandbox::{HostCall, HostHandler, JsonPart, SandboxLimits, SandboxOutcome};
use loom_verify::Verifier;

use crate::partial_json::{repair, PartialJsonEmitter};
use crate::task::{input_map, Invocation, TaskEmitter};
use crate::template::value_text;
use crate::traits::HttpRequest;

use super::{kind_mismatch, AgentExecutor};

pub struct ScriptedLogicExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&ScriptSpec> {
    match &definition.kind {
        AgentKind::ScriptedLogic(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::ScriptedLogic)),
    }
}

#[async_trait]
impl AgentExecutor for ScriptedLogicExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::ScriptedLogic
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let limits = SandboxLimits::from(&inv.runtime.config().sandbox);

        let (limits, inputs) = (&limits, &inputs);
        inv.retry_policy()
            .run(&inv.definition.id, |attempt| async move {
                let host = ScriptHost::for_attempt(inv, attempt);
                let session = loom_sandbox::run(&spec.source, input_map(inputs), limits.clone())?;
                let outcome = session.complete(&host).await?;
                let outputs = drain_streams(inv, outcome, attempt).await?;
                inv.validate(&outputs)?;
                Ok(outputs)
            })
            .await
    }
}

fn is_text_output(definition: &AgentDefinition, path: &str) -> bool {
    path.strip_prefix('/')
        .is_some_and(|name| definition.outputs.iter().any(|o| o.streaming_text && o.name == name))
}

/// Replace every stream sentinel in the result with the stream's contents.
async fn drain_streams(inv: &Invocation<'_>, outcome: SandboxOutcome, attempt: u32) -> LoomResult<Value> {
    let paths = outcome.stream_paths();
    let SandboxOutcome { mut value, relay } = outcome;

    for path in paths {
        let mut items = relay.stream(&path);
        let collected = if is_text_output(inv.definition, &path) {
            let mut text = String::new();
            while let Some(item) = items.next().await {
                let piece = value_text(&item?);
                if attempt == 1 {
                    inv.emitter.text(&piece);
                }
                text.push_str(&piece);
            }
            Value::String(text)
        } else {
            let mut values = Vec::new();
            while let Some(item) = items.next().await {
                values.push(item?);
            }
            Value::Array(values)
        };

        match value.pointer_mut(&path) {
            Some(slot) => *slot = collected,
            None => debug!(%path, "stream path vanished from script result"),
        }
    }
    Ok(value)
}

// ── Host calls ───────────────────────────────────────────────────────────────

/// Answers one attempt's host calls. Only the first attempt reports its
/// logs, objects and sub-agent runs; a retry repeats them silently.
struct ScriptHost<'a> {
    inv: &'a Invocation<'a>,
    emitter: TaskEmitter,
}

#[async_trait]
impl<'a> HostHandler for ScriptHost<'a> {
    async fn handle(&self, call: HostCall) -> LoomResult<Value> {
        debug!(task_id = %self.inv.task_id(), call = call.name(), "script host call");
        match call {
            HostCall::Log { message } => {
                self.emitter.log(message);
                Ok(Value::Null)
            }
            HostCall::Fetch { method, url, body } => self.fetch(method, url, body).await,
            HostCall::RunAgent {
                agent,
                inputs,
                relay_text,
            } => self.run_agent(&agent, inputs, relay_text).await,
            HostCall::RenderJson { parts } => self.render_json(parts).await,
        }
    }
}

impl<'a> ScriptHost<'a> {
    fn for_attempt(inv: &'a Invocation<'a>, attempt: u32) -> Self {
        let emitter = if attempt == 1 {
            inv.emitter.clone()
        } else {
            inv.emitter.muted()
        };
        Self { inv, emitter }
    }

    async fn fetch(&self, method: String, url: String, body: Value) -> LoomResult<Value> {
        ensure_allowed(&url, &self.inv.runtime.config().http.allowed_base_urls)?;
        let request = HttpRequest {
            method,
            url,
            headers: Vec::new(),
            body: (!body.is_null()).then_some(body),
        };
        let response = self.inv.runtime.collaborators().http.send(request).await?;
        Ok(response.to_value())
    }

    async fn run_agent(&self, agent: &str, inputs: Value, relay_text: bool) -> LoomResult<Value> {
        let sink = if relay_text {
            let emitter = self.emitter.clone();
            self.emitter.watch_child_text(move |text| emitter.text(text))
        } else {
            self.emitter.sink().clone()
        };
        self.inv.run_child(agent, inputs, Some(sink)).await
    }

    async fn render_json(&self, parts: Vec<JsonPart>) -> LoomResult<Value> {
        let document = Arc::new(JsonDocument::new(self.inv, self.emitter.clone()));
        for part in parts {
            match part {
                JsonPart::Raw { text } => document.append(&text),
                JsonPart::Value { value } => document.append(&value.to_string()),
                JsonPart::Agent { agent, inputs } => {
                    document.append("\"");
                    let target = document.clone();
                    let sink = self
                        .emitter
                        .watch_child_text(move |text| target.append(&escape_fragment(text)));
                    self.inv.run_child(&agent, inputs, Some(sink)).await?;
                    document.append("\"");
                }
            }
        }
        document.finish()
    }
}

/// Only URLs under one of the configured base URLs may be fetched.
/// Whether `path` is `base` itself or lies below it on a segment boundary.
fn within_base(base: &str, path: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || base.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

fn ensure_allowed(url: &str, allowed: &[String]) -> LoomResult<()> {
    let target = Url::parse(url).map_err(|e| LoomError::Http {
        status: None,
        reason: format!("invalid url '{url}': {e}"),
    })?;
    let permitted = allowed
        .iter()
        .filter_map(|base| Url::parse(base).ok())
        .any(|base| base.origin() == target.origin() && within_base(base.path(), target.path()));
    if permitted {
        Ok(())
    } else {
        Err(LoomError::Http {
            status: None,
            reason: format!("url '{url}' is outside the allowed base urls"),
        })
    }
}

/// `text` escaped for use inside a JSON string literal, without the quotes.
fn escape_fragment(text: &str) -> String {
    let quoted = Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

// ── json(parts) ──────────────────────────────────────────────────────────────

/// A JSON document assembled from template parts. Each distinct,
/// schema-conforming intermediate object is emitted as a CHUNK.
struct JsonDocument {
    emitter: TaskEmitter,
    verifier: Arc<dyn Verifier>,
    schema: OutputSchema,
    state: Mutex<(String, PartialJsonEmitter)>,
}

impl JsonDocument {
    fn new(inv: &Invocation<'_>, emitter: TaskEmitter) -> Self {
        Self {
            emitter,
            verifier: inv.runtime.verifier().clone(),
            schema: inv.partial_schema(),
            state: Mutex::new((String::new(), PartialJsonEmitter::new())),
        }
    }

    fn append(&self, text: &str) {
        let emitted = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (document, partial) = &mut *state;
            document.push_str(text);
            repair(document).and_then(|candidate| partial.offer(candidate, self.verifier.as_ref(), &self.schema))
        };
        if let Some(object) = emitted {
            self.emitter.object(object);
        }
    }

    fn finish(&self) -> LoomResult<Value> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(serde_json::from_str(&state.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_is_limited_to_allowed_base_urls() {
        let allowed = vec!["https://api.example.com/v1/".to_string()];
        assert!(ensure_allowed("https://api.example.com/v1/items?q=1", &allowed).is_ok());
        assert!(ensure_allowed("https://api.example.com/v2/items", &allowed).is_err());
        assert!(ensure_allowed("https://evil.example.com/v1/", &allowed).is_err());
        assert!(ensure_allowed("not a url", &allowed).is_err());
        assert!(ensure_allowed("https://api.example.com/v1/", &[]).is_err());
    }

    #[test]
    fn base_url_without_trailing_slash_stops_at_segment_boundary() {
        let allowed = vec!["https://svc.example.com/api".to_string()];
        assert!(ensure_allowed("https://svc.example.com/api", &allowed).is_ok());
        assert!(ensure_allowed("https://svc.example.com/api/users", &allowed).is_ok());
        assert!(ensure_allowed("https://svc.example.com/api-admin/users", &allowed).is_err());
        assert!(ensure_allowed("https://svc.example.com/apiX", &allowed).is_err());
        assert!(ensure_allowed("https://svc.example.com/", &allowed).is_err());
    }

    #[test]
    fn bare_origin_allows_every_path() {
        let allowed = vec!["https://svc.example.com".to_string()];
        assert!(ensure_allowed("https://svc.example.com/anything/at/all", &allowed).is_ok());
        assert!(ensure_allowed("http://svc.example.com/anything", &allowed).is_err());
    }

    #[test]
    fn fragments_are_escaped_for_string_literals() {
        assert_eq!(escape_fragment("say \"hi\"\n"), "say \\\"hi\\\"\\n");
    }
}
