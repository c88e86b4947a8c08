//! Pipeline agents: a sequence of sub-agent steps over shared variables.
//!
//! Variables start as the pipeline's inputs; each step's outputs are stored
//! under the step name. Adjacent steps marked `concurrent` run together and
//! only see the variables that existed before their group started.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, PipelineSpec, PipelineStep},
    error::{LoomError, LoomResult},
};

use crate::bindings::resolve_all;
use crate::task::{input_map, Invocation};

use super::{kind_mismatch, AgentExecutor};

pub struct PipelineExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&PipelineSpec> {
    match &definition.kind {
        AgentKind::Pipeline(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::Pipeline)),
    }
}

/// Split steps into runs: each concurrent block together, every other
/// step alone.
fn groups(steps: &[PipelineStep]) -> Vec<&[PipelineStep]> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < steps.len() {
        let mut end = start + 1;
        if steps[start].concurrent {
            while end < steps.len() && steps[end].concurrent {
                end += 1;
            }
        }
        out.push(&steps[start..end]);
        start = end;
    }
    out
}

#[async_trait]
impl AgentExecutor for PipelineExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::Pipeline
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let mut variables = input_map(&inputs);
        let mut last = Value::Null;

        for group in groups(&spec.steps) {
            debug!(
                task_id = %inv.task_id(),
                steps = ?group.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "pipeline group starting"
            );
            let runs = group.iter().map(|step| {
                let step_inputs = resolve_all(&step.inputs, &variables);
                async move {
                    let outputs = inv.run_child(&step.agent, step_inputs, None).await?;
                    Ok::<_, LoomError>((step.name.clone(), outputs))
                }
            });
            for (name, outputs) in try_join_all(runs).await? {
                last = outputs.clone();
                variables.insert(name, outputs);
            }
        }

        let outputs = if spec.outputs.is_empty() {
            last
        } else {
            resolve_all(&spec.outputs, &variables)
        };
        inv.validate(&outputs)?;
        Ok(outputs)
    }
}
