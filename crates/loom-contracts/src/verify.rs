//! Output verification schema and report types.
//!
//! Before an executor hands outputs back to its caller, they are checked
//! against an `OutputSchema` derived from the agent's declared outputs.
//! Streaming executors check intermediate objects against the *partial*
//! variant of the same schema, which drops the `required` constraints.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::agent::{AgentDefinition, OutputDecl, ValueType};

/// What the verifier checks an agent's outputs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Identifier used in logs (the agent id, suffixed for partial schemas).
    pub schema_id: String,
    /// A JSON Schema document used for structural validation.
    pub json_schema: Value,
    /// Additional domain rules evaluated after structural validation.
    pub rules: Vec<VerificationRule>,
}

impl OutputSchema {
    /// Build the complete output schema of `definition`.
    pub fn for_agent(definition: &AgentDefinition) -> Self {
        Self {
            schema_id: definition.id.clone(),
            json_schema: object_schema(&definition.outputs, true),
            rules: definition.output_rules.clone(),
        }
    }

    /// Schema for intermediate objects: same shape, nothing required, no rules.
    pub fn partial_for_agent(definition: &AgentDefinition) -> Self {
        Self {
            schema_id: format!("{}#partial", definition.id),
            json_schema: object_schema(&definition.outputs, false),
            rules: Vec::new(),
        }
    }

    /// Schema of only the outputs that are not streamed as text.
    pub fn structured_for_agent(definition: &AgentDefinition) -> Self {
        let outputs: Vec<OutputDecl> = definition
            .outputs
            .iter()
            .filter(|o| !o.streaming_text)
            .cloned()
            .collect();
        Self {
            schema_id: format!("{}#structured", definition.id),
            json_schema: object_schema(&outputs, true),
            rules: Vec::new(),
        }
    }
}

fn object_schema(outputs: &[OutputDecl], with_required: bool) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for output in outputs {
        let mut property = type_schema(output.value_type);
        if let (Some(description), Some(obj)) = (&output.description, property.as_object_mut()) {
            obj.insert("description".to_string(), json!(description));
        }
        properties.insert(output.name.clone(), property);
        if with_required && !output.optional {
            required.push(json!(output.name));
        }
    }

    let mut schema = json!({ "type": "object", "properties": properties });
    if !required.is_empty() {
        schema["required"] = Value::Array(required);
    }
    schema
}

fn type_schema(value_type: ValueType) -> Value {
    match value_type {
        ValueType::String => json!({ "type": "string" }),
        ValueType::Number => json!({ "type": "number" }),
        ValueType::Integer => json!({ "type": "integer" }),
        ValueType::Boolean => json!({ "type": "boolean" }),
        ValueType::Object => json!({ "type": "object" }),
        ValueType::Array => json!({ "type": "array" }),
        ValueType::Image => json!({ "type": ["string", "object"] }),
        ValueType::Any => json!({}),
    }
}

/// A single semantic rule applied to agent outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRule {
    /// Unique identifier for this rule, referenced in failure reports.
    pub rule_id: String,
    #[serde(default)]
    pub description: String,
    pub rule_type: VerificationRuleType,
}

/// The semantic checks the verifier supports out of the box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VerificationRuleType {
    /// The field at `field_path` (dotted) must be present and non-null.
    #[serde(rename_all = "camelCase")]
    RequiredField { field_path: String },

    /// The field at `field_path` must equal one of `allowed`.
    #[serde(rename_all = "camelCase")]
    AllowedValues { field_path: String, allowed: Vec<Value> },

    /// The string at `field_path` must not contain `pattern`.
    #[serde(rename_all = "camelCase")]
    ForbiddenPattern { field_path: String, pattern: String },

    /// Delegate to a function registered with the verifier under this name.
    #[serde(rename_all = "camelCase")]
    Custom { function_name: String },
}

/// The result of checking one output object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// True only if all checks passed.
    pub passed: bool,
    pub failures: Vec<VerificationFailure>,
}

impl VerificationReport {
    /// `[rule] message; [rule] message` — used in errors and log lines.
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("[{}] {}", f.rule_id, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationFailure {
    pub rule_id: String,
    pub message: String,
}
