//! Prompt template rendering.
//!
//! Placeholders are `{{name}}`, `{{name.path.0}}` over the invocation
//! inputs, and `{{memory.var}}` over the agent's memory variables. Inputs
//! declared as images become image parts in user messages and plain URLs
//! everywhere else.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use loom_contracts::{
    agent::{InputDecl, PromptTemplate, ValueType},
    model::{ChatMessage, ContentPart, MessageContent, Role},
};

const MEMORY_PREFIX: &str = "memory";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_$][\w$-]*(?:\.[\w$-]+)*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Values visible to a template.
pub struct TemplateScope<'a> {
    pub inputs: &'a Value,
    pub memory: &'a BTreeMap<String, Value>,
    pub declarations: &'a [InputDecl],
}

impl<'a> TemplateScope<'a> {
    fn lookup(&self, expr: &str) -> Option<Value> {
        let mut segments = expr.split('.');
        let head = segments.next()?;
        let root = if head == MEMORY_PREFIX && self.inputs.get(MEMORY_PREFIX).is_none() {
            let name = segments.next()?;
            self.memory.get(name)?
        } else {
            self.inputs.get(head)?
        };
        segments
            .try_fold(root, |value, key| match value {
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                Value::Object(map) => map.get(key),
                _ => None,
            })
            .cloned()
    }

    fn is_image(&self, expr: &str) -> bool {
        !expr.contains('.')
            && self
                .declarations
                .iter()
                .any(|d| d.name == expr && d.value_type == ValueType::Image)
    }
}

/// Text form of a value as spliced into a prompt.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// URL of an image-typed value: a string, or an object with `url`.
fn image_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Render `template` to plain text.
pub fn render_text(template: &str, scope: &TemplateScope<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let expr = &caps[1];
            match scope.lookup(expr) {
                Some(value) if scope.is_image(expr) => image_url(&value).unwrap_or_else(|| value_text(&value)),
                Some(value) => value_text(&value),
                None => {
                    warn!(placeholder = %expr, "template placeholder has no value");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn render_parts(template: &str, scope: &TemplateScope<'_>) -> MessageContent {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut last = 0;
    let mut has_image = false;

    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        text.push_str(&template[last..whole.start()]);
        last = whole.end();

        let expr = &caps[1];
        let value = scope.lookup(expr);
        match value.as_ref().filter(|_| scope.is_image(expr)).and_then(image_url) {
            Some(url) => {
                if !text.is_empty() {
                    parts.push(ContentPart::Text {
                        text: std::mem::take(&mut text),
                    });
                }
                parts.push(ContentPart::ImageUrl { url });
                has_image = true;
            }
            None => text.push_str(&render_text(whole.as_str(), scope)),
        }
    }
    text.push_str(&template[last..]);

    if !has_image {
        return MessageContent::Text(text);
    }
    if !text.is_empty() {
        parts.push(ContentPart::Text { text });
    }
    MessageContent::Parts(parts)
}

/// Render every prompt template into a chat message.
pub fn render_messages(templates: &[PromptTemplate], scope: &TemplateScope<'_>) -> Vec<ChatMessage> {
    templates
        .iter()
        .map(|t| ChatMessage {
            role: t.role,
            content: match t.role {
                Role::User => render_parts(&t.content, scope),
                Role::System | Role::Assistant => MessageContent::Text(render_text(&t.content, scope)),
            },
        })
        .collect()
}
