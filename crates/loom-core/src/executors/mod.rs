//! One executor per agent kind, looked up through a static table.
//!
//! Every executor runs inside the same frame (see [`run_task`]):
//!
//! ```text
//! INPUT → EXECUTE_ASSISTANT_START → process() → EXECUTE_ASSISTANT_END
//!                                             ↘ EXECUTE_SELECT_STOP (stopped)
//! ```

mod decision;
mod http;
mod image;
mod model;
mod pipeline;
mod script;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use loom_contracts::{
    agent::{AgentDefinition, AgentKindTag},
    error::{LoomError, LoomResult},
    event::ExecutePhase,
    model::ChatMessage,
};

use crate::task::{redact, Invocation, TaskLifecycle};

pub use decision::DecisionExecutor;
pub use http::HttpApiExecutor;
pub use image::ImageGenerationExecutor;
pub use model::ModelPromptExecutor;
pub use pipeline::PipelineExecutor;
pub use script::ScriptedLogicExecutor;

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn kind(&self) -> AgentKindTag;

    /// The rendered prompt, reported on the INPUT event. Only executors
    /// that talk to a model have one.
    async fn prompt_messages(&self, _inv: &Invocation<'_>, _inputs: &Value) -> LoomResult<Option<Vec<ChatMessage>>> {
        Ok(None)
    }

    /// Produce validated outputs for `inputs`.
    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value>;
}

/// The executor registered for `tag`.
pub fn executor_for(tag: AgentKindTag) -> &'static dyn AgentExecutor {
    match tag {
        AgentKindTag::ModelPrompt => &ModelPromptExecutor,
        AgentKindTag::ScriptedLogic => &ScriptedLogicExecutor,
        AgentKindTag::Pipeline => &PipelineExecutor,
        AgentKindTag::Decision => &DecisionExecutor,
        AgentKindTag::HttpApi => &HttpApiExecutor,
        AgentKindTag::ImageGeneration => &ImageGenerationExecutor,
    }
}

/// Drive one task through its lifecycle around `executor.process`.
pub(crate) async fn run_task(executor: &dyn AgentExecutor, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
    let mut lifecycle = TaskLifecycle::new(inv.task_id().clone());

    let prompt = match executor.prompt_messages(inv, &inputs).await {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(task_id = %inv.task_id(), error = %err, "could not render prompt for INPUT event");
            None
        }
    };
    inv.emitter.input(redact(inv.definition, &inputs), prompt);

    lifecycle.start()?;
    inv.emitter.execute(ExecutePhase::ExecuteAssistantStart);

    let result = executor.process(inv, inputs).await;

    let stopped = result.is_ok() && inv.is_stopped();
    lifecycle.close(stopped)?;
    inv.emitter.execute(if stopped {
        ExecutePhase::ExecuteSelectStop
    } else {
        ExecutePhase::ExecuteAssistantEnd
    });

    match &result {
        Ok(_) => debug!(task_id = %inv.task_id(), agent = %inv.definition.id, stopped, "task closed"),
        Err(err) => warn!(task_id = %inv.task_id(), agent = %inv.definition.id, error = %err, "task failed"),
    }
    result
}

pub(crate) fn kind_mismatch(definition: &AgentDefinition, expected: AgentKindTag) -> LoomError {
    LoomError::InvalidDefinition {
        agent: definition.id.clone(),
        reason: format!("expected a {expected:?} agent, found {:?}", definition.kind.tag()),
    }
}
