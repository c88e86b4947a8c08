//! Decision agents: a model picks one case, which either delegates to a
//! sub-agent or stops the decision.
//!
//! The model is offered a `select_case` tool; a plain-text answer naming a
//! case is accepted too. An answer naming no known case is retried like any
//! other validation failure.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, DecisionCase, DecisionSpec},
    error::{LoomError, LoomResult},
    model::{ChatMessage, ModelSettings, ToolSpec},
};

use crate::bindings::resolve_all;
use crate::task::{input_map, redact, Invocation};
use crate::traits::ModelCall;

use super::model::{collect_response, effective_settings, Collected};
use super::{kind_mismatch, AgentExecutor};

pub(crate) const SELECT_TOOL: &str = "select_case";

pub struct DecisionExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&DecisionSpec> {
    match &definition.kind {
        AgentKind::Decision(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::Decision)),
    }
}

fn select_tool(spec: &DecisionSpec) -> ToolSpec {
    let names: Vec<&str> = spec.cases.iter().map(|c| c.name.as_str()).collect();
    ToolSpec {
        name: SELECT_TOOL.to_string(),
        description: "Select the case that best fits the input.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": { "case": { "type": "string", "enum": names } },
            "required": ["case"]
        }),
    }
}

fn decision_messages(spec: &DecisionSpec, inputs: &Value) -> Vec<ChatMessage> {
    let cases: Vec<String> = spec
        .cases
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect();
    let system = format!(
        "{}\n\nChoose exactly one case. Call `{SELECT_TOOL}`, or answer with the case name alone.\n{}",
        spec.instruction,
        cases.join("\n")
    );
    vec![ChatMessage::system(system.trim_start()), ChatMessage::user(inputs.to_string())]
}

fn decision_settings(inv: &Invocation<'_>, spec: &DecisionSpec) -> ModelSettings {
    let mut settings = effective_settings(inv, &spec.model);
    settings.tools.push(select_tool(spec));
    settings
}

/// The case named by a `select_case` call, else by the answer text.
fn select_case<'s>(spec: &'s DecisionSpec, response: &Collected) -> Option<&'s DecisionCase> {
    let by_name = |name: &str| spec.cases.iter().find(|c| c.name == name);

    let from_tool = response
        .tool_calls
        .iter()
        .filter(|call| call.name == SELECT_TOOL)
        .find_map(|call| {
            let arguments = match &call.arguments {
                Value::String(raw) => serde_json::from_str(raw).ok()?,
                other => other.clone(),
            };
            arguments.get("case").and_then(Value::as_str).and_then(by_name)
        });
    if from_tool.is_some() {
        return from_tool;
    }

    let text = response.text.trim();
    by_name(text).or_else(|| {
        spec.cases
            .iter()
            .filter(|c| !c.name.is_empty() && text.contains(c.name.as_str()))
            .max_by_key(|c| c.name.len())
    })
}

#[async_trait]
impl AgentExecutor for DecisionExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::Decision
    }

    async fn prompt_messages(&self, inv: &Invocation<'_>, inputs: &Value) -> LoomResult<Option<Vec<ChatMessage>>> {
        let spec = spec(inv.definition)?;
        Ok(Some(decision_messages(spec, &redact(inv.definition, inputs))))
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let model = inv.runtime.collaborators().model()?.clone();
        let messages = decision_messages(spec, &redact(inv.definition, &inputs));
        let settings = decision_settings(inv, spec);

        let model: &dyn ModelCall = model.as_ref();
        let (messages, settings) = (&messages, &settings);
        let case = inv
            .retry_policy()
            .run(&inv.definition.id, |_| async move {
                let stream = model.call(messages.to_vec(), settings).await?;
                let response = collect_response(stream, |_| {}).await?;
                if let Some(usage) = response.usage {
                    inv.emitter.usage(usage);
                }
                select_case(spec, &response).ok_or_else(|| LoomError::OutputValidation {
                    reason: format!("model answer selects no known case: {:?}", response.text.trim()),
                })
            })
            .await?;

        info!(task_id = %inv.task_id(), case = %case.name, stop = case.stop, "decision case selected");

        let Some(agent) = case.agent.as_deref().filter(|_| !case.stop) else {
            inv.stop();
            return Ok(Value::Object(Map::new()));
        };

        let child_inputs = if case.inputs.is_empty() {
            inputs.clone()
        } else {
            resolve_all(&case.inputs, &input_map(&inputs))
        };
        let outputs = inv.run_child(agent, child_inputs, None).await?;
        inv.validate(&outputs)?;
        Ok(outputs)
    }
}
