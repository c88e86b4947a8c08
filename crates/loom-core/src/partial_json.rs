//! Best-effort parsing of incomplete JSON documents.
//!
//! Used while a JSON document is still being produced: each prefix is
//! repaired into the most complete value it implies, checked against the
//! partial output schema, and emitted only if it differs from the last
//! emitted value.

use serde_json::Value;

use loom_contracts::verify::OutputSchema;
use loom_verify::Verifier;

/// Close open strings and containers of `prefix` without cutting anything.
fn close(prefix: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in prefix.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = prefix.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed = out.trim_end().trim_end_matches(',').len();
    out.truncate(trimmed);
    out.extend(stack.iter().rev());
    out
}

/// Byte offsets at which `text` may be cut: just after an opening bracket
/// or just before a comma, outside strings.
fn cut_points(text: &str) -> Vec<usize> {
    let mut points = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => points.push(i + 1),
            ',' => points.push(i),
            _ => {}
        }
    }
    points
}

/// The most complete value implied by a JSON prefix, or `None` if nothing
/// parseable can be recovered.
pub fn repair(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    if let Ok(value) = serde_json::from_str(&close(text)) {
        return Some(value);
    }
    cut_points(text)
        .into_iter()
        .rev()
        .find_map(|at| serde_json::from_str(&close(&text[..at])).ok())
}

/// Emits each distinct, schema-conforming intermediate value once.
#[derive(Debug, Default)]
pub struct PartialJsonEmitter {
    last: Option<Value>,
}

impl PartialJsonEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `candidate` if it passes `schema` and differs from the last
    /// value returned.
    pub fn offer(&mut self, candidate: Value, verifier: &dyn Verifier, schema: &OutputSchema) -> Option<Value> {
        if self.last.as_ref() == Some(&candidate) {
            return None;
        }
        match verifier.verify(&candidate, schema) {
            Ok(report) if report.passed => {
                self.last = Some(candidate.clone());
                Some(candidate)
            }
            _ => None,
        }
    }

    pub fn last(&self) -> Option<&Value> {
        self.last.as_ref()
    }
}
