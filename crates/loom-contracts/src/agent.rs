//! Agent definitions as authored in the studio.
//!
//! An `AgentDefinition` is read-only to the runtime. Its `kind` is a closed
//! set of variants; adding a kind means adding a variant here and an entry in
//! the executor table in `loom-core`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ModelSettings, Role};
use crate::verify::VerificationRule;

/// Value types an input or output may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    /// An image reference: a URL string or `{"url": "..."}`.
    Image,
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDecl {
    pub name: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Secret inputs never appear in emitted events.
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDecl {
    pub name: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub optional: bool,
    /// The output is free text streamed to the user while it is produced.
    #[serde(default)]
    pub streaming_text: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a sub-agent's streamed content is surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RespondAs {
    Message,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub outputs: Vec<OutputDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond_as: Option<RespondAs>,
    /// Semantic checks applied after structural validation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_rules: Vec<VerificationRule>,
    #[serde(flatten)]
    pub kind: AgentKind,
}

impl AgentDefinition {
    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// The per-kind retry override, if the definition carries one.
    pub fn max_retries(&self) -> Option<u32> {
        match &self.kind {
            AgentKind::ModelPrompt(spec) => spec.max_retries,
            AgentKind::ScriptedLogic(spec) => spec.max_retries,
            AgentKind::Decision(spec) => spec.max_retries,
            AgentKind::HttpApi(spec) => Some(spec.max_retries.unwrap_or(0)),
            AgentKind::Pipeline(_) | AgentKind::ImageGeneration(_) => None,
        }
    }
}

/// The per-kind payload of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "kebab-case")]
pub enum AgentKind {
    ModelPrompt(ModelPromptSpec),
    ScriptedLogic(ScriptSpec),
    Pipeline(PipelineSpec),
    Decision(DecisionSpec),
    HttpApi(HttpApiSpec),
    ImageGeneration(ImageGenerationSpec),
}

/// Discriminant of [`AgentKind`], used as the executor table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKindTag {
    ModelPrompt,
    ScriptedLogic,
    Pipeline,
    Decision,
    HttpApi,
    ImageGeneration,
}

impl AgentKind {
    pub fn tag(&self) -> AgentKindTag {
        match self {
            AgentKind::ModelPrompt(_) => AgentKindTag::ModelPrompt,
            AgentKind::ScriptedLogic(_) => AgentKindTag::ScriptedLogic,
            AgentKind::Pipeline(_) => AgentKindTag::Pipeline,
            AgentKind::Decision(_) => AgentKindTag::Decision,
            AgentKind::HttpApi(_) => AgentKindTag::HttpApi,
            AgentKind::ImageGeneration(_) => AgentKindTag::ImageGeneration,
        }
    }
}

// ── Model prompt ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub role: Role,
    /// Template text with `{{name}}` / `{{name.path}}` placeholders.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPromptSpec {
    pub messages: Vec<PromptTemplate>,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

// ── Scripted logic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSpec {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// One key of a property path: object key or array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropKey {
    Index(usize),
    Key(String),
}

/// Where a bound value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueBinding {
    #[serde(rename_all = "camelCase")]
    Variable {
        from_variable: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        from_variable_prop_path: Vec<PropKey>,
    },
    Literal {
        value: Value,
    },
}

impl ValueBinding {
    pub fn variable(name: impl Into<String>, path: Vec<PropKey>) -> Self {
        ValueBinding::Variable {
            from_variable: name.into(),
            from_variable_prop_path: path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// Variable name the step's outputs are stored under.
    pub name: String,
    /// Agent reference: identity token or local agent id.
    pub agent: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueBinding>,
    /// Runs together with adjacent concurrent steps.
    #[serde(default)]
    pub concurrent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<PipelineStep>,
    /// Pipeline output name → binding over pipeline variables.
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueBinding>,
}

// ── Decision ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCase {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, ValueBinding>,
    /// Selecting this case ends the decision without delegating.
    #[serde(default)]
    pub stop: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSpec {
    #[serde(default)]
    pub instruction: String,
    pub cases: Vec<DecisionCase>,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

// ── HTTP / API ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
    Cookie,
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpParameter {
    /// Name on the wire (path placeholder, query key, header, cookie, body key).
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    pub value: ValueBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub method: String,
    pub base_url: String,
    /// Path with `{name}` placeholders for path parameters.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointRef {
    Inline(EndpointDescriptor),
    /// Resolved through the resource resolver at execution time.
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpApiSpec {
    pub endpoint: EndpointRef,
    #[serde(default)]
    pub parameters: Vec<HttpParameter>,
    /// Output name → JSON pointer into the response body.
    #[serde(default)]
    pub response: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

// ── Image generation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGenerationSpec {
    pub prompt: String,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default = "default_image_count")]
    pub count: u32,
}

fn default_image_count() -> u32 {
    1
}
