//! Model-prompt agents.
//!
//! Two paths, chosen by the model's capabilities:
//!
//! - **Structured**: a text call for the streaming outputs runs alongside a
//!   schema-constrained call for the rest; the results are merged.
//! - **Fenced**: one text call; the model is asked to append a fenced JSON
//!   block, which is cut out of the stream by the metadata extractor while
//!   the surrounding narrative streams to the user.
//!
//! Narrative text is forwarded only on the first attempt, so a retry never
//! repeats what the user has already seen.

use async_trait::async_trait;
use futures::future::try_join;
use futures::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use tracing::debug;

use loom_config::ExtractionConfig;
use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, ModelPromptSpec},
    error::{LoomError, LoomResult},
    model::{ChatMessage, ModelSettings, ToolCall, Usage},
    verify::OutputSchema,
};

use crate::extract::{extract_stream, ExtractChunk};
use crate::task::Invocation;
use crate::template::render_messages;
use crate::traits::{ModelCall, ModelStream};

use super::{kind_mismatch, AgentExecutor};

pub struct ModelPromptExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&ModelPromptSpec> {
    match &definition.kind {
        AgentKind::ModelPrompt(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::ModelPrompt)),
    }
}

/// `settings` with the runtime's default model filled in.
pub(crate) fn effective_settings(inv: &Invocation<'_>, settings: &ModelSettings) -> ModelSettings {
    let mut settings = settings.clone();
    if settings.model.is_empty() {
        settings.model = inv.runtime.config().default_model.clone();
    }
    settings
}

#[async_trait]
impl AgentExecutor for ModelPromptExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::ModelPrompt
    }

    async fn prompt_messages(&self, inv: &Invocation<'_>, inputs: &Value) -> LoomResult<Option<Vec<ChatMessage>>> {
        let spec = spec(inv.definition)?;
        let memory = inv.memory().await?;
        Ok(Some(render_messages(&spec.messages, &inv.scope(inputs, &memory))))
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let model = inv.runtime.collaborators().model()?.clone();
        let memory = inv.memory().await?;

        let messages = render_messages(&spec.messages, &inv.scope(&inputs, &memory));
        let settings = effective_settings(inv, &spec.model);
        let structured = model.supports_structured_output(&settings);
        debug!(task_id = %inv.task_id(), model = %settings.model, structured, "model prompt starting");

        let model: &dyn ModelCall = model.as_ref();
        let (messages, settings) = (&messages, &settings);
        inv.retry_policy()
            .run(&inv.definition.id, |attempt| async move {
                let outputs = if structured {
                    structured_attempt(inv, model, messages, settings, attempt).await?
                } else {
                    fenced_attempt(inv, model, messages, settings, attempt).await?
                };
                inv.validate(&outputs)?;
                Ok(outputs)
            })
            .await
    }
}

// ── Response collection ──────────────────────────────────────────────────────

/// A fully drained model response.
#[derive(Debug, Default)]
pub(crate) struct Collected {
    pub text: String,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
}

fn add_usage(total: &mut Option<Usage>, usage: Option<&Usage>) {
    if let Some(usage) = usage {
        total.get_or_insert_with(Usage::default).add(usage);
    }
}

/// Drain `stream`, handing each text delta to `on_text` as it arrives.
pub(crate) async fn collect_response(mut stream: ModelStream, mut on_text: impl FnMut(&str) + Send) -> LoomResult<Collected> {
    let mut collected = Collected::default();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        add_usage(&mut collected.usage, delta.usage.as_ref());
        collected.tool_calls.extend(delta.tool_calls);
        if let Some(text) = delta.content {
            on_text(&text);
            collected.text.push_str(&text);
        }
    }
    Ok(collected)
}

/// Streaming-text outputs take the narrative unless the model set them.
fn fill_streaming_outputs(definition: &AgentDefinition, outputs: &mut Map<String, Value>, text: &str) {
    for output in definition.outputs.iter().filter(|o| o.streaming_text) {
        outputs
            .entry(output.name.clone())
            .or_insert_with(|| Value::String(text.trim().to_string()));
    }
}

// ── Structured path ──────────────────────────────────────────────────────────

async fn structured_attempt(
    inv: &Invocation<'_>,
    model: &dyn ModelCall,
    messages: &[ChatMessage],
    settings: &ModelSettings,
    attempt: u32,
) -> LoomResult<Value> {
    let definition = inv.definition;
    let has_text = definition.outputs.iter().any(|o| o.streaming_text);

    let mut object_settings = settings.clone();
    object_settings.response_schema = Some(OutputSchema::structured_for_agent(definition).json_schema);

    let text = async {
        if !has_text {
            return Ok(Collected::default());
        }
        let stream = model.call(messages.to_vec(), settings).await?;
        collect_response(stream, |t| {
            if attempt == 1 {
                inv.emitter.text(t);
            }
        })
        .await
    };
    let object = async {
        let stream = model.call(messages.to_vec(), &object_settings).await?;
        collect_response(stream, |_| {}).await
    };
    let (text, object) = try_join(text, object).await?;

    let mut usage = text.usage;
    add_usage(&mut usage, object.usage.as_ref());
    if let Some(usage) = usage {
        inv.emitter.usage(usage);
    }

    let mut outputs = match serde_json::from_str::<Value>(object.text.trim()) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(LoomError::OutputValidation {
                reason: format!("structured output is not an object: {other}"),
            })
        }
        Err(e) => {
            return Err(LoomError::OutputValidation {
                reason: format!("structured output is not valid JSON: {e}"),
            })
        }
    };
    fill_streaming_outputs(definition, &mut outputs, &text.text);
    Ok(Value::Object(outputs))
}

// ── Fenced path ──────────────────────────────────────────────────────────────

fn fence_instruction(definition: &AgentDefinition, extraction: &ExtractionConfig) -> Option<String> {
    if definition.outputs.iter().all(|o| o.streaming_text) {
        return None;
    }
    let schema = OutputSchema::structured_for_agent(definition).json_schema;
    Some(format!(
        "After your answer, output a single JSON object matching this schema, \
         starting on its own line with {} and ending with {}:\n{schema}",
        extraction.start, extraction.end
    ))
}

/// Merge a best-effort parse of the whole text with every parseable block.
fn merge_outputs(definition: &AgentDefinition, blocks: &[String], raw: &str, narrative: &str) -> Value {
    let mut outputs = Map::new();
    if let Ok(Value::Object(whole)) = serde_json::from_str::<Value>(raw.trim()) {
        outputs.extend(whole);
    }
    for block in blocks {
        match serde_json::from_str::<Value>(block.trim()) {
            Ok(Value::Object(map)) => outputs.extend(map),
            _ => debug!(agent = %definition.id, "ignoring unparseable metadata block"),
        }
    }
    fill_streaming_outputs(definition, &mut outputs, narrative);
    Value::Object(outputs)
}

async fn fenced_attempt(
    inv: &Invocation<'_>,
    model: &dyn ModelCall,
    messages: &[ChatMessage],
    settings: &ModelSettings,
    attempt: u32,
) -> LoomResult<Value> {
    let extraction = &inv.runtime.config().extraction;
    let mut prompt = messages.to_vec();
    if let Some(instruction) = fence_instruction(inv.definition, extraction) {
        prompt.push(ChatMessage::system(instruction));
    }

    let stream = model.call(prompt, settings).await?;
    let mut usage = None;
    let mut raw = String::new();
    let mut narrative = String::new();
    let mut blocks = Vec::new();
    {
        let fragments = stream.map_ok(|delta| {
            add_usage(&mut usage, delta.usage.as_ref());
            let text = delta.content.unwrap_or_default();
            raw.push_str(&text);
            text
        });
        let mut chunks = std::pin::pin!(extract_stream(fragments, &extraction.start, &extraction.end));
        while let Some(chunk) = chunks.next().await {
            match chunk? {
                ExtractChunk::Text(text) => {
                    if attempt == 1 {
                        inv.emitter.text(&text);
                    }
                    narrative.push_str(&text);
                }
                ExtractChunk::Match(block) => blocks.push(block),
            }
        }
    }

    if let Some(usage) = usage {
        inv.emitter.usage(usage);
    }
    Ok(merge_outputs(inv.definition, &blocks, &raw, &narrative))
}
