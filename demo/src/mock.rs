//! Offline stand-ins for the model collaborators.
//!
//! `DemoModel` answers text calls by echoing the prompt (or with scripted
//! replies), fills schema-constrained calls with placeholder values, and
//! picks the first case when offered a `select_case` tool.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Map, Value};

use loom_contracts::{
    error::LoomResult,
    model::{ChatMessage, ModelDelta, ModelSettings, Role, ToolCall, Usage},
};
use loom_core::{ImageModelCall, ModelCall, ModelStream};

pub struct DemoModel {
    replies: Vec<String>,
    next: AtomicUsize,
}

impl DemoModel {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies,
            next: AtomicUsize::new(0),
        }
    }

    fn scripted_reply(&self) -> Option<String> {
        if self.replies.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(self.replies[n % self.replies.len()].clone())
    }
}

/// Word-sized pieces, so the output streams like a real model's would.
fn pieces(text: &str) -> Vec<ModelDelta> {
    text.split_inclusive(' ').map(ModelDelta::text).collect()
}

fn last_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.text())
        .unwrap_or_default()
}

/// A value of the type `schema` describes.
fn placeholder(schema: &Value) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => json!("demo"),
        Some("number") | Some("integer") => json!(0),
        Some("boolean") => json!(false),
        Some("array") => json!([]),
        Some("object") => {
            let properties = schema.get("properties").and_then(Value::as_object);
            let filled: Map<String, Value> = properties
                .into_iter()
                .flatten()
                .map(|(name, property)| (name.clone(), placeholder(property)))
                .collect();
            Value::Object(filled)
        }
        _ => Value::Null,
    }
}

fn usage(prompt: &[ChatMessage], completion: &str) -> Usage {
    let prompt_tokens: u64 = prompt.iter().map(|m| m.content.text().split_whitespace().count() as u64).sum();
    let completion_tokens = completion.split_whitespace().count() as u64;
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

#[async_trait]
impl ModelCall for DemoModel {
    async fn call(&self, messages: Vec<ChatMessage>, settings: &ModelSettings) -> LoomResult<ModelStream> {
        let mut deltas = if let Some(schema) = &settings.response_schema {
            vec![ModelDelta::text(placeholder(schema).to_string())]
        } else if let Some(reply) = self.scripted_reply() {
            pieces(&reply)
        } else if let Some(tool) = settings.tools.iter().find(|t| t.name == "select_case") {
            let first = tool.parameters.pointer("/properties/case/enum/0").cloned().unwrap_or(Value::Null);
            vec![ModelDelta {
                tool_calls: vec![ToolCall {
                    name: tool.name.clone(),
                    arguments: json!({ "case": first }),
                }],
                ..ModelDelta::default()
            }]
        } else {
            pieces(&format!("You asked: {}", last_user_text(&messages)))
        };

        let completion: String = deltas.iter().filter_map(|d| d.content.as_deref()).collect();
        deltas.push(ModelDelta {
            usage: Some(usage(&messages, &completion)),
            ..ModelDelta::default()
        });
        Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
    }

    fn supports_structured_output(&self, _settings: &ModelSettings) -> bool {
        true
    }
}

pub struct DemoImageModel;

#[async_trait]
impl ImageModelCall for DemoImageModel {
    async fn generate(&self, prompt: &str, _settings: &ModelSettings, count: u32) -> LoomResult<Vec<String>> {
        let slug: String = prompt
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .take(32)
            .collect::<String>()
            .trim()
            .replace(' ', "-")
            .to_lowercase();
        Ok((1..=count).map(|n| format!("https://images.example/{slug}-{n}.png")).collect())
    }
}
