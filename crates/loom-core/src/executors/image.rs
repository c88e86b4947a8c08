//! Image-generation agents.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, ImageGenerationSpec, ValueType},
    error::LoomResult,
};

use crate::task::Invocation;
use crate::template::render_text;

use super::model::effective_settings;
use super::{kind_mismatch, AgentExecutor};

const DEFAULT_OUTPUT: &str = "images";

pub struct ImageGenerationExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&ImageGenerationSpec> {
    match &definition.kind {
        AgentKind::ImageGeneration(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::ImageGeneration)),
    }
}

/// Place the images under the first declared output: the whole list for
/// array-like outputs, the first image otherwise.
fn shape_outputs(definition: &AgentDefinition, images: Vec<String>) -> Value {
    let (name, value) = match definition.outputs.first() {
        None => (DEFAULT_OUTPUT.to_string(), json!(images)),
        Some(output) => {
            let value = match output.value_type {
                ValueType::Image | ValueType::String => images.into_iter().next().map_or(Value::Null, Value::String),
                _ => json!(images),
            };
            (output.name.clone(), value)
        }
    };
    let mut map = Map::new();
    map.insert(name, value);
    Value::Object(map)
}

#[async_trait]
impl AgentExecutor for ImageGenerationExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::ImageGeneration
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let image_model = inv.runtime.collaborators().image_model()?.clone();
        let memory = inv.memory().await?;

        let prompt = render_text(&spec.prompt, &inv.scope(&inputs, &memory));
        let settings = effective_settings(inv, &spec.model);
        let images = image_model.generate(&prompt, &settings, spec.count.max(1)).await?;
        info!(task_id = %inv.task_id(), count = images.len(), "images generated");

        inv.emitter.images(images.clone());
        let outputs = shape_outputs(inv.definition, images);
        inv.validate(&outputs)?;
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use loom_contracts::agent::OutputDecl;
    use loom_contracts::model::ModelSettings;

    use super::*;

    fn definition(outputs: Vec<OutputDecl>) -> AgentDefinition {
        AgentDefinition {
            id: "painter".into(),
            name: "Painter".into(),
            inputs: vec![],
            outputs,
            respond_as: None,
            output_rules: vec![],
            kind: AgentKind::ImageGeneration(ImageGenerationSpec {
                prompt: "a cat".into(),
                model: ModelSettings::default(),
                count: 2,
            }),
        }
    }

    fn output(name: &str, value_type: ValueType) -> OutputDecl {
        OutputDecl {
            name: name.into(),
            value_type,
            optional: false,
            streaming_text: false,
            description: None,
        }
    }

    #[test]
    fn images_land_under_the_declared_output() {
        let images = vec!["u1".to_string(), "u2".to_string()];
        assert_eq!(
            shape_outputs(&definition(vec![]), images.clone()),
            json!({ "images": ["u1", "u2"] })
        );
        assert_eq!(
            shape_outputs(&definition(vec![output("pics", ValueType::Array)]), images.clone()),
            json!({ "pics": ["u1", "u2"] })
        );
        assert_eq!(
            shape_outputs(&definition(vec![output("cover", ValueType::Image)]), images),
            json!({ "cover": "u1" })
        );
    }
}
