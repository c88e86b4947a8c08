//! The runtime executor: resolves an agent reference, prepares its inputs,
//! and runs it through the executor for its kind.
//!
//! Sub-invocations re-enter [`RuntimeExecutor::execute_in`] with the
//! caller's task as parent, so a whole run forms one task tree.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use loom_config::RuntimeConfig;
use loom_contracts::{
    agent::{AgentDefinition, EndpointDescriptor},
    error::{LoomError, LoomResult},
    event::{ErrorPayload, EventSink, RunUpdate, StreamEvent},
    execution::TaskId,
    identity::{AgentIdentity, AgentRef},
};
use loom_verify::{SchemaVerifier, Verifier};

use crate::cache;
use crate::collaborators::Collaborators;
use crate::executors::{self, run_task};
use crate::project::Project;
use crate::task::{Invocation, TaskEmitter};

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub parent_task_id: Option<TaskId>,
    /// When false, an unresolvable agent yields `null` instead of an error.
    pub required: bool,
    /// Retries never start after this instant.
    pub deadline: Option<Instant>,
    /// Retry budget for agents whose definition carries none.
    pub max_retries: Option<u32>,
    /// Emitted as INPUT_PARAMETER before a top-level run starts.
    pub user_message: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parent_task_id: None,
            required: true,
            deadline: None,
            max_retries: None,
            user_message: None,
        }
    }
}

/// A failure plus whether the task had started emitting events.
struct Failure {
    error: LoomError,
    started: bool,
}

impl Failure {
    fn before_start(error: LoomError) -> Self {
        Self { error, started: false }
    }
}

pub struct RuntimeExecutor {
    project: Arc<Project>,
    collaborators: Collaborators,
    config: RuntimeConfig,
    verifier: Arc<dyn Verifier>,
}

impl RuntimeExecutor {
    pub fn new(project: Project, collaborators: Collaborators, config: RuntimeConfig) -> Self {
        Self {
            project: Arc::new(project),
            collaborators,
            config,
            verifier: Arc::new(SchemaVerifier::new()),
        }
    }

    /// Replace the default schema verifier, e.g. with one carrying custom
    /// rule functions.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn verifier(&self) -> &Arc<dyn Verifier> {
        &self.verifier
    }

    // ── Resolution ───────────────────────────────────────────────────────────

    /// Resolve `agent_ref` as seen from `project_id`: the local project
    /// first, then the resource resolver.
    pub async fn resolve(
        &self,
        agent_ref: &str,
        project_id: &str,
    ) -> LoomResult<Option<(AgentIdentity, AgentDefinition)>> {
        let identity = AgentRef::parse(agent_ref).into_identity(project_id);
        if identity.is_local_to(&self.project.id) {
            if let Some(definition) = self.project.agent(&identity.agent_id) {
                return Ok(Some((identity, definition.clone())));
            }
        }
        let resolved = self.collaborators.resolver.resolve_agent(&identity).await?;
        Ok(resolved.map(|definition| (identity, definition)))
    }

    pub async fn resolve_endpoint(&self, name: &str) -> LoomResult<Option<EndpointDescriptor>> {
        if let Some(endpoint) = self.project.endpoint(name) {
            return Ok(Some(endpoint.clone()));
        }
        self.collaborators.resolver.resolve_endpoint(name).await
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Run an agent to completion and return its outputs.
    ///
    /// Events go to `sink` as they happen. A top-level run that fails after
    /// emitting its first event ends with exactly one ERROR event.
    pub fn execute<'a>(
        &'a self,
        agent_ref: &'a str,
        inputs: Value,
        options: ExecuteOptions,
        sink: EventSink,
    ) -> BoxFuture<'a, LoomResult<Value>> {
        let project_id = self.project.id.as_str();
        self.execute_in(project_id, agent_ref, inputs, options, sink)
    }

    /// [`execute`](Self::execute) with local references anchored in
    /// `project_id`.
    pub fn execute_in<'a>(
        &'a self,
        project_id: &'a str,
        agent_ref: &'a str,
        inputs: Value,
        options: ExecuteOptions,
        sink: EventSink,
    ) -> BoxFuture<'a, LoomResult<Value>> {
        async move {
            let top_level = options.parent_task_id.is_none();
            match self.run(project_id, agent_ref, inputs, options, sink.clone()).await {
                Ok(outputs) => Ok(outputs),
                Err(Failure { error, started }) => {
                    if top_level && started {
                        sink.emit(StreamEvent::Error {
                            error: ErrorPayload::from(&error),
                        });
                    }
                    Err(error)
                }
            }
        }
        .boxed()
    }

    async fn run(
        &self,
        project_id: &str,
        agent_ref: &str,
        inputs: Value,
        options: ExecuteOptions,
        sink: EventSink,
    ) -> Result<Value, Failure> {
        let resolved = self
            .resolve(agent_ref, project_id)
            .await
            .map_err(Failure::before_start)?;
        let Some((identity, definition)) = resolved else {
            if options.required {
                return Err(Failure::before_start(LoomError::AgentNotFound {
                    agent: agent_ref.to_string(),
                }));
            }
            warn!(agent = %agent_ref, "optional agent not found; returning null");
            return Ok(Value::Null);
        };

        let inputs = prepare_inputs(&definition, inputs).map_err(Failure::before_start)?;

        let fingerprint = cache::fingerprint(&identity, &inputs);
        if let Some(outputs) = self.collaborators.cache.get(&fingerprint).await {
            debug!(agent = %definition.id, %fingerprint, "cache hit");
            return Ok(outputs);
        }

        if options.parent_task_id.is_none() {
            if let Some(content) = &options.user_message {
                sink.emit(StreamEvent::InputParameter {
                    content: content.clone(),
                });
            }
        }

        let task_id = TaskId::new();
        info!(
            task_id = %task_id,
            parent_task_id = ?options.parent_task_id.as_ref().map(TaskId::as_str),
            agent = %definition.id,
            kind = ?definition.kind.tag(),
            "task starting"
        );

        let emitter = TaskEmitter::new(sink, task_id, options.parent_task_id.clone(), &definition);
        let invocation = Invocation::new(self, &definition, identity, emitter, &options);
        let executor = executors::executor_for(definition.kind.tag());

        let outputs = run_task(executor, &invocation, inputs)
            .await
            .map_err(|error| Failure { error, started: true })?;

        self.collaborators.cache.set(&fingerprint, &outputs).await;
        Ok(outputs)
    }

    /// Run an agent on a background task and stream its events followed by
    /// the final outputs.
    ///
    /// Any failure ends the stream with one ERROR event. Dropping the
    /// stream aborts the run.
    pub fn execute_stream(self: Arc<Self>, agent_ref: impl Into<String>, inputs: Value, options: ExecuteOptions) -> RunStream {
        let agent_ref = agent_ref.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let events = tx.clone();
            let sink = EventSink::new(move |event| {
                // A closed channel means the consumer is gone.
                let _ = events.send(RunUpdate::Event { event });
            });

            let project_id = self.project.id.clone();
            match self.run(&project_id, &agent_ref, inputs, options, sink).await {
                Ok(outputs) => {
                    let _ = tx.send(RunUpdate::Completed { outputs });
                }
                Err(Failure { error, .. }) => {
                    warn!(agent = %agent_ref, error = %error, "streamed run failed");
                    let _ = tx.send(RunUpdate::Event {
                        event: StreamEvent::Error {
                            error: ErrorPayload::from(&error),
                        },
                    });
                }
            }
        });

        RunStream {
            inner: UnboundedReceiverStream::new(rx),
            handle,
        }
    }
}

/// Apply declared defaults and reject missing required inputs.
fn prepare_inputs(definition: &AgentDefinition, inputs: Value) -> LoomResult<Value> {
    let mut map = match inputs {
        Value::Object(map) => map,
        Value::Null => Default::default(),
        other => {
            return Err(LoomError::InvalidInput {
                name: "*".to_string(),
                reason: format!("inputs must be an object, got {other}"),
            })
        }
    };

    for decl in &definition.inputs {
        let present = map.get(&decl.name).is_some_and(|v| !v.is_null());
        if present {
            continue;
        }
        match &decl.default {
            Some(default) => {
                map.insert(decl.name.clone(), default.clone());
            }
            None if !decl.optional => {
                return Err(LoomError::InvalidInput {
                    name: decl.name.clone(),
                    reason: "required input is missing".to_string(),
                })
            }
            None => {}
        }
    }
    Ok(Value::Object(map))
}

// ── Streaming ─────────────────────────────────────────────────────────────────

/// The update stream of a background run. Dropping it aborts the run.
pub struct RunStream {
    inner: UnboundedReceiverStream<RunUpdate>,
    handle: JoinHandle<()>,
}

impl Stream for RunStream {
    type Item = RunUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::{stream, StreamExt};
    use serde_json::json;

    use loom_contracts::{
        agent::{
            AgentKind, DecisionCase, DecisionSpec, EndpointRef, HttpApiSpec, HttpParameter, InputDecl,
            ModelPromptSpec, OutputDecl, ParameterLocation, PipelineSpec, PipelineStep, PromptTemplate, PropKey,
            ScriptSpec, ValueBinding, ValueType,
        },
        event::ExecutePhase,
        model::{ChatMessage, ModelDelta, ModelSettings, Role, ToolCall},
    };
    use loom_trace::TaskTreeReducer;

    use super::*;
    use crate::collaborators::InMemoryCache;
    use crate::traits::{HttpClient, HttpRequest, HttpResponse, MemoryLookup, MemoryVariable, ModelCall, ModelStream, ResourceResolver};

    // ── Mocks ─────────────────────────────────────────────────────────────────

    type Respond = dyn Fn(&[ChatMessage], &ModelSettings) -> Vec<ModelDelta> + Send + Sync;

    /// Model that answers every call through a closure and counts calls.
    struct MockModel {
        respond: Box<Respond>,
        structured: bool,
        calls: Arc<Mutex<u32>>,
        prompts: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    impl MockModel {
        fn new(respond: impl Fn(&[ChatMessage], &ModelSettings) -> Vec<ModelDelta> + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                structured: false,
                calls: Arc::new(Mutex::new(0)),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Streams the same text pieces on every call.
        fn streaming(pieces: &[&str]) -> Self {
            let pieces: Vec<String> = pieces.iter().map(|p| p.to_string()).collect();
            Self::new(move |_, _| pieces.iter().map(ModelDelta::text).collect())
        }

        fn structured(mut self) -> Self {
            self.structured = true;
            self
        }
    }

    #[async_trait]
    impl ModelCall for MockModel {
        async fn call(&self, messages: Vec<ChatMessage>, settings: &ModelSettings) -> LoomResult<ModelStream> {
            *self.calls.lock().unwrap() += 1;
            let deltas = (self.respond)(&messages, settings);
            self.prompts.lock().unwrap().push(messages);
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        }

        fn supports_structured_output(&self, _settings: &ModelSettings) -> bool {
            self.structured
        }
    }

    /// HTTP client that returns one canned response and records requests.
    struct MockHttp {
        status: u16,
        body: Value,
        requests: Arc<Mutex<Vec<HttpRequest>>>,
    }

    impl MockHttp {
        fn new(status: u16, body: Value) -> Self {
            Self {
                status,
                body,
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttp {
        async fn send(&self, request: HttpRequest) -> LoomResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: self.status,
                headers: BTreeMap::new(),
                body: self.body.clone(),
            })
        }
    }

    /// Resolver that knows one agent of another project.
    struct MockResolver {
        identity: AgentIdentity,
        definition: AgentDefinition,
        lookups: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl ResourceResolver for MockResolver {
        async fn resolve_agent(&self, identity: &AgentIdentity) -> LoomResult<Option<AgentDefinition>> {
            *self.lookups.lock().unwrap() += 1;
            Ok((identity == &self.identity).then(|| self.definition.clone()))
        }
    }

    struct MockMemory;

    #[async_trait]
    impl MemoryLookup for MockMemory {
        async fn variables(&self, _identity: &AgentIdentity) -> LoomResult<Vec<MemoryVariable>> {
            Ok(vec![MemoryVariable {
                name: "tone".into(),
                value: json!("cheerful"),
            }])
        }
    }

    /// Collects every event a run emits.
    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<StreamEvent>>>);

    impl Events {
        fn sink(&self) -> EventSink {
            let events = self.0.clone();
            EventSink::new(move |event| events.lock().unwrap().push(event))
        }

        fn all(&self) -> Vec<StreamEvent> {
            self.0.lock().unwrap().clone()
        }

        fn task_of(&self, agent: &str) -> TaskId {
            self.all()
                .into_iter()
                .find_map(|event| match event {
                    StreamEvent::Input {
                        task_id, assistant_id, ..
                    } if assistant_id == agent => Some(task_id),
                    _ => None,
                })
                .unwrap_or_else(|| panic!("no INPUT event for {agent}"))
        }

        fn text_of(&self, task: &TaskId) -> Vec<String> {
            self.all()
                .into_iter()
                .filter_map(|event| match event {
                    StreamEvent::Chunk { task_id, delta, .. } if &task_id == task => delta.content,
                    _ => None,
                })
                .collect()
        }

        fn objects_of(&self, task: &TaskId) -> Vec<Value> {
            self.all()
                .into_iter()
                .filter_map(|event| match event {
                    StreamEvent::Chunk { task_id, delta, .. } if &task_id == task => delta.object,
                    _ => None,
                })
                .collect()
        }

        fn errors(&self) -> usize {
            self.all()
                .iter()
                .filter(|e| matches!(e, StreamEvent::Error { .. }))
                .count()
        }
    }

    // ── Fixtures ──────────────────────────────────────────────────────────────

    fn input(name: &str, value_type: ValueType) -> InputDecl {
        InputDecl {
            name: name.into(),
            value_type,
            optional: false,
            default: None,
            secret: false,
            description: None,
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

    fn text_output(name: &str) -> OutputDecl {
        OutputDecl {
            streaming_text: true,
            ..output(name, ValueType::String)
        }
    }

    fn agent(id: &str, inputs: Vec<InputDecl>, outputs: Vec<OutputDecl>, kind: AgentKind) -> AgentDefinition {
        AgentDefinition {
            id: id.into(),
            name: id.to_uppercase(),
            inputs,
            outputs,
            respond_as: None,
            output_rules: vec![],
            kind,
        }
    }

    fn script(id: &str, source: &str, inputs: Vec<InputDecl>, outputs: Vec<OutputDecl>) -> AgentDefinition {
        agent(
            id,
            inputs,
            outputs,
            AgentKind::ScriptedLogic(ScriptSpec {
                source: source.into(),
                max_retries: None,
            }),
        )
    }

    fn writer(outputs: Vec<OutputDecl>, max_retries: Option<u32>) -> AgentDefinition {
        agent(
            "writer",
            vec![input("topic", ValueType::String)],
            outputs,
            AgentKind::ModelPrompt(ModelPromptSpec {
                messages: vec![PromptTemplate {
                    role: Role::User,
                    content: "Write about {{topic}}.".into(),
                }],
                model: ModelSettings::default(),
                max_retries,
            }),
        )
    }

    fn runtime(project: Project, collaborators: Collaborators) -> RuntimeExecutor {
        RuntimeExecutor::new(project, collaborators, RuntimeConfig::default())
    }

    fn project(agents: Vec<AgentDefinition>) -> Project {
        agents
            .into_iter()
            .fold(Project::new("demo"), |project, agent| project.with_agent(agent))
    }

    // ── Model prompts ─────────────────────────────────────────────────────────

    /// The fenced block is cut out of the narrative and merged into outputs.
    #[tokio::test]
    async fn test_fenced_model_outputs() {
        let model = Arc::new(MockModel::streaming(&[
            "Cats sleep a lot.",
            "\n```js",
            "on\n{\"score\": 0.5}\n```",
        ]));
        let rt = runtime(
            project(vec![writer(
                vec![text_output("answer"), output("score", ValueType::Number)],
                None,
            )]),
            Collaborators::default().with_model(model.clone()),
        );
        let events = Events::default();

        let outputs = rt
            .execute("writer", json!({ "topic": "cats" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();

        assert_eq!(outputs, json!({ "answer": "Cats sleep a lot.", "score": 0.5 }));
        let task = events.task_of("writer");
        assert_eq!(events.text_of(&task).concat(), "Cats sleep a lot.\n");
        assert_eq!(*model.calls.lock().unwrap(), 1);
    }

    /// Invalid output is retried up to the budget; narrative streams once.
    #[tokio::test]
    async fn test_retry_exhaustion_emits_text_once() {
        let model = Arc::new(MockModel::streaming(&["hello"]));
        let rt = runtime(
            project(vec![writer(
                vec![text_output("answer"), output("score", ValueType::Number)],
                Some(2),
            )]),
            Collaborators::default().with_model(model.clone()),
        );
        let events = Events::default();

        let result = rt
            .execute("writer", json!({ "topic": "cats" }), ExecuteOptions::default(), events.sink())
            .await;

        match result {
            Err(LoomError::UnexpectedResponseFormat { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected UnexpectedResponseFormat, got {:?}", other),
        }
        assert_eq!(*model.calls.lock().unwrap(), 3);
        let task = events.task_of("writer");
        assert_eq!(events.text_of(&task), vec!["hello".to_string()]);
        assert_eq!(events.errors(), 1);
        assert!(matches!(events.all().last(), Some(StreamEvent::Error { .. })));
    }

    /// Structured-capable models get a separate schema-constrained call.
    #[tokio::test]
    async fn test_structured_model_outputs() {
        let model = Arc::new(
            MockModel::new(|_, settings| {
                if settings.response_schema.is_some() {
                    vec![ModelDelta::text("{\"score\": 1}")]
                } else {
                    vec![ModelDelta::text("A fine topic.")]
                }
            })
            .structured(),
        );
        let rt = runtime(
            project(vec![writer(
                vec![text_output("answer"), output("score", ValueType::Number)],
                None,
            )]),
            Collaborators::default().with_model(model.clone()),
        );
        let events = Events::default();

        let outputs = rt
            .execute("writer", json!({ "topic": "cats" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();

        assert_eq!(outputs, json!({ "answer": "A fine topic.", "score": 1 }));
        assert_eq!(*model.calls.lock().unwrap(), 2);
        let task = events.task_of("writer");
        assert_eq!(events.text_of(&task).concat(), "A fine topic.");
    }

    /// Prompt templates see memory variables, and the INPUT event carries
    /// the rendered prompt.
    #[tokio::test]
    async fn test_memory_variables_reach_the_prompt() {
        let mut def = writer(vec![text_output("answer")], None);
        if let AgentKind::ModelPrompt(spec) = &mut def.kind {
            spec.messages[0].content = "Be {{memory.tone}} about {{topic}}.".into();
        }
        let model = Arc::new(MockModel::streaming(&["ok"]));
        let rt = runtime(
            project(vec![def]),
            Collaborators::default()
                .with_model(model.clone())
                .with_memory(Arc::new(MockMemory)),
        );
        let events = Events::default();

        rt.execute("writer", json!({ "topic": "cats" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts[0][0].content.text(), "Be cheerful about cats.");
        let reported = events.all().into_iter().find_map(|e| match e {
            StreamEvent::Input { prompt_messages, .. } => prompt_messages,
            _ => None,
        });
        assert_eq!(reported.unwrap()[0].content.text(), "Be cheerful about cats.");
    }

    // ── Resolution and inputs ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_missing_agent() {
        let rt = runtime(project(vec![]), Collaborators::default());
        let events = Events::default();

        let result = rt
            .execute("ghost", json!({}), ExecuteOptions::default(), events.sink())
            .await;
        assert!(matches!(result, Err(LoomError::AgentNotFound { .. })));
        assert!(events.all().is_empty());

        let optional = ExecuteOptions {
            required: false,
            ..ExecuteOptions::default()
        };
        let outputs = rt.execute("ghost", json!({}), optional, events.sink()).await.unwrap();
        assert_eq!(outputs, Value::Null);
        assert!(events.all().is_empty());
    }

    /// Missing required inputs fail before any event; defaults fill gaps;
    /// secret inputs never appear on the INPUT event.
    #[tokio::test]
    async fn test_input_preparation() {
        let mut units = input("units", ValueType::String);
        units.default = Some(json!("metric"));
        let mut key = input("key", ValueType::String);
        key.secret = true;
        let echo = script(
            "echo",
            "#{ units: units, key_length: key.len() }",
            vec![units, key],
            vec![output("units", ValueType::String), output("key_length", ValueType::Integer)],
        );
        let rt = runtime(project(vec![echo]), Collaborators::default());

        let events = Events::default();
        let result = rt.execute("echo", json!({}), ExecuteOptions::default(), events.sink()).await;
        assert!(matches!(result, Err(LoomError::InvalidInput { ref name, .. }) if name == "key"));
        assert!(events.all().is_empty());

        let outputs = rt
            .execute("echo", json!({ "key": "s3cret" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "units": "metric", "key_length": 6 }));

        let reported = events.all().into_iter().find_map(|e| match e {
            StreamEvent::Input { input_parameters, .. } => Some(input_parameters),
            _ => None,
        });
        assert_eq!(reported, Some(json!({ "units": "metric" })));
    }

    /// References to other projects go through the resource resolver.
    #[tokio::test]
    async fn test_remote_agent_is_resolved() {
        let identity = AgentIdentity::local("shared", "greeter");
        let lookups = Arc::new(Mutex::new(0));
        let resolver = MockResolver {
            identity: identity.clone(),
            definition: script(
                "greeter",
                "#{ greeting: \"hi \" + name }",
                vec![input("name", ValueType::String)],
                vec![output("greeting", ValueType::String)],
            ),
            lookups: lookups.clone(),
        };
        let rt = runtime(project(vec![]), Collaborators::default().with_resolver(Arc::new(resolver)));

        let token = identity.encode().unwrap();
        let outputs = rt
            .execute(&token, json!({ "name": "Ada" }), ExecuteOptions::default(), EventSink::discard())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "greeting": "hi Ada" }));
        assert_eq!(*lookups.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_message_precedes_top_level_run() {
        let rt = runtime(
            project(vec![script("one", "#{}", vec![], vec![])]),
            Collaborators::default(),
        );
        let events = Events::default();
        let options = ExecuteOptions {
            user_message: Some("go".into()),
            ..ExecuteOptions::default()
        };

        rt.execute("one", json!({}), options, events.sink()).await.unwrap();

        let all = events.all();
        assert_eq!(all[0], StreamEvent::InputParameter { content: "go".into() });
        assert!(matches!(all[1], StreamEvent::Input { .. }));
    }

    // ── Pipelines ─────────────────────────────────────────────────────────────

    fn flow(concurrent: bool) -> Vec<AgentDefinition> {
        let step = |name: &str, agent: &str, inputs: BTreeMap<String, ValueBinding>| PipelineStep {
            name: name.into(),
            agent: agent.into(),
            inputs,
            concurrent,
        };
        let pipeline = agent(
            "flow",
            vec![],
            vec![output("result", ValueType::Integer)],
            AgentKind::Pipeline(PipelineSpec {
                steps: vec![
                    step("first", "produce", BTreeMap::new()),
                    step(
                        "second",
                        "double",
                        BTreeMap::from([(
                            "x".to_string(),
                            ValueBinding::variable("first", vec![PropKey::Key("x".into())]),
                        )]),
                    ),
                ],
                outputs: BTreeMap::from([(
                    "result".to_string(),
                    ValueBinding::variable("second", vec![PropKey::Key("got".into())]),
                )]),
            }),
        );
        vec![
            pipeline,
            script("produce", "#{ x: 5 }", vec![], vec![output("x", ValueType::Integer)]),
            script(
                "double",
                "#{ got: x * 2 }",
                vec![input("x", ValueType::Integer)],
                vec![output("got", ValueType::Integer)],
            ),
        ]
    }

    /// Step outputs feed later steps, and every step is a child task of the
    /// pipeline in the reduced task tree.
    #[tokio::test]
    async fn test_pipeline_passes_step_outputs_forward() {
        let rt = runtime(project(flow(false)), Collaborators::default());
        let events = Events::default();

        let outputs = rt
            .execute("flow", json!({}), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "result": 10 }));

        let mut reducer = TaskTreeReducer::new("user", "assistant");
        reducer.apply_all(events.all().iter());
        let message = reducer.message();
        assert_eq!(message.input_messages.len(), 3);

        let pipeline = events.task_of("flow");
        let double = message.trace(&events.task_of("double")).unwrap();
        assert_eq!(double.parent_task_id.as_ref(), Some(&pipeline));
        assert_eq!(double.input_parameters, json!({ "x": 5 }));
        assert!(message.input_messages.iter().all(|t| t.end_time.is_some()));
    }

    /// Concurrent steps run as one group; the second still sees only what
    /// earlier groups produced.
    #[tokio::test]
    async fn test_concurrent_steps_run_as_a_group() {
        let mut agents = flow(true);
        if let AgentKind::Pipeline(spec) = &mut agents[0].kind {
            spec.steps[1].inputs = BTreeMap::from([(
                "x".to_string(),
                ValueBinding::Literal { value: json!(21) },
            )]);
        }
        let rt = runtime(project(agents), Collaborators::default());

        let outputs = rt
            .execute("flow", json!({}), ExecuteOptions::default(), EventSink::discard())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "result": 42 }));
    }

    // ── Decisions ─────────────────────────────────────────────────────────────

    fn router() -> Vec<AgentDefinition> {
        let decision = agent(
            "router",
            vec![input("name", ValueType::String)],
            vec![],
            AgentKind::Decision(DecisionSpec {
                instruction: "Greet or finish.".into(),
                cases: vec![
                    DecisionCase {
                        name: "greet".into(),
                        description: "say hello".into(),
                        agent: Some("greeter".into()),
                        inputs: BTreeMap::new(),
                        stop: false,
                    },
                    DecisionCase {
                        name: "done".into(),
                        description: "nothing left to do".into(),
                        agent: None,
                        inputs: BTreeMap::new(),
                        stop: true,
                    },
                ],
                model: ModelSettings::default(),
                max_retries: None,
            }),
        );
        let greeter = script(
            "greeter",
            "#{ greeting: \"hi \" + name }",
            vec![input("name", ValueType::String)],
            vec![output("greeting", ValueType::String)],
        );
        vec![decision, greeter]
    }

    #[tokio::test]
    async fn test_decision_stop_case() {
        let model = Arc::new(MockModel::new(|_, _| {
            vec![ModelDelta {
                tool_calls: vec![ToolCall {
                    name: "select_case".into(),
                    arguments: json!({ "case": "done" }),
                }],
                ..ModelDelta::default()
            }]
        }));
        let rt = runtime(project(router()), Collaborators::default().with_model(model));
        let events = Events::default();

        let outputs = rt
            .execute("router", json!({ "name": "Ada" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({}));

        let phases: Vec<ExecutePhase> = events
            .all()
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Execute { execution, .. } => Some(execution.current_phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![ExecutePhase::ExecuteAssistantStart, ExecutePhase::ExecuteSelectStop]
        );

        let mut reducer = TaskTreeReducer::new("user", "assistant");
        reducer.apply_all(events.all().iter());
        assert!(reducer.message().input_messages[0].stop);
    }

    /// A plain-text answer naming a case delegates to that case's agent.
    #[tokio::test]
    async fn test_decision_delegates_to_case_agent() {
        let model = Arc::new(MockModel::streaming(&["greet"]));
        let rt = runtime(project(router()), Collaborators::default().with_model(model));
        let events = Events::default();

        let outputs = rt
            .execute("router", json!({ "name": "Ada" }), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "greeting": "hi Ada" }));

        let greeter_parent = events.all().into_iter().find_map(|e| match e {
            StreamEvent::Input {
                assistant_id,
                parent_task_id,
                ..
            } if assistant_id == "greeter" => parent_task_id,
            _ => None,
        });
        assert_eq!(greeter_parent, Some(events.task_of("router")));
    }

    // ── Scripts ───────────────────────────────────────────────────────────────

    /// `log` lands on the script's task; relayed child text is re-emitted
    /// on the script's task after the child's own chunk.
    #[tokio::test]
    async fn test_script_log_and_relay() {
        let relay = script(
            "relay",
            r#"
                log("starting");
                let r = run_agent("writer", #{ topic: "cats" }, #{ relay: true });
                #{ summary: r.answer }
            "#,
            vec![],
            vec![output("summary", ValueType::String)],
        );
        let model = Arc::new(MockModel::streaming(&["Cats ", "purr."]));
        let rt = runtime(
            project(vec![relay, writer(vec![text_output("answer")], None)]),
            Collaborators::default().with_model(model),
        );
        let events = Events::default();

        let outputs = rt
            .execute("relay", json!({}), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "summary": "Cats purr." }));

        let relay_task = events.task_of("relay");
        let writer_task = events.task_of("writer");
        assert_eq!(events.text_of(&writer_task).concat(), "Cats purr.");
        assert_eq!(events.text_of(&relay_task).concat(), "Cats purr.");
        assert!(events.all().iter().any(|e| matches!(
            e,
            StreamEvent::Log { task_id, log, .. } if task_id == &relay_task && log == "starting"
        )));
    }

    /// Each distinct, conforming intermediate document is emitted once.
    #[tokio::test]
    async fn test_json_template_emits_partial_objects() {
        let doc = script(
            "doc",
            r#"json(["{\"a\":", "1", "}"])"#,
            vec![],
            vec![output("a", ValueType::Integer)],
        );
        let rt = runtime(project(vec![doc]), Collaborators::default());
        let events = Events::default();

        let outputs = rt
            .execute("doc", json!({}), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "a": 1 }));
        assert_eq!(events.objects_of(&events.task_of("doc")), vec![json!({}), json!({ "a": 1 })]);
    }

    /// Agent parts stream into the document as an escaped string.
    #[tokio::test]
    async fn test_json_template_with_agent_part() {
        let doc = script(
            "doc",
            r#"json(["{\"summary\": ", agent("writer", #{ topic: "quotes" }), "}"])"#,
            vec![],
            vec![output("summary", ValueType::String)],
        );
        let model = Arc::new(MockModel::streaming(&["say ", "\"hi\""]));
        let rt = runtime(
            project(vec![doc, writer(vec![text_output("answer")], None)]),
            Collaborators::default().with_model(model),
        );
        let events = Events::default();

        let outputs = rt
            .execute("doc", json!({}), ExecuteOptions::default(), events.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "summary": "say \"hi\"" }));
        let objects = events.objects_of(&events.task_of("doc"));
        assert_eq!(objects.last(), Some(&json!({ "summary": "say \"hi\"" })));
    }

    #[tokio::test]
    async fn test_script_fault_surfaces_once() {
        let rt = runtime(
            project(vec![script("boom", "throw \"kaput\";", vec![], vec![])]),
            Collaborators::default(),
        );
        let events = Events::default();

        let result = rt
            .execute("boom", json!({}), ExecuteOptions::default(), events.sink())
            .await;
        assert!(matches!(result, Err(LoomError::Script(_))));
        assert_eq!(events.errors(), 1);
    }

    /// A retried script repeats its host calls without re-reporting them.
    #[tokio::test]
    async fn test_script_retry_reports_side_effects_once() {
        let doc = agent(
            "doc",
            vec![],
            vec![output("a", ValueType::Integer), output("b", ValueType::Integer)],
            AgentKind::ScriptedLogic(ScriptSpec {
                source: r#"
                    log("attempt");
                    run_agent("writer", #{ topic: "cats" });
                    json(["{\"a\":1}"])
                "#
                .into(),
                max_retries: Some(2),
            }),
        );
        let model = Arc::new(MockModel::streaming(&["Cats."]));
        let rt = runtime(
            project(vec![doc, writer(vec![text_output("answer")], None)]),
            Collaborators::default().with_model(model.clone()),
        );
        let events = Events::default();

        let result = rt
            .execute("doc", json!({}), ExecuteOptions::default(), events.sink())
            .await;
        match result {
            Err(LoomError::UnexpectedResponseFormat { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected UnexpectedResponseFormat, got {:?}", other),
        }
        assert_eq!(*model.calls.lock().unwrap(), 3);

        let doc_task = events.task_of("doc");
        assert_eq!(events.objects_of(&doc_task), vec![json!({ "a": 1 })]);
        let logs = events
            .all()
            .iter()
            .filter(|e| matches!(e, StreamEvent::Log { log, .. } if log == "attempt"))
            .count();
        assert_eq!(logs, 1);
        let writer_runs = events
            .all()
            .iter()
            .filter(|e| matches!(e, StreamEvent::Input { assistant_id, .. } if assistant_id == "writer"))
            .count();
        assert_eq!(writer_runs, 1);
        assert_eq!(events.text_of(&events.task_of("writer")), vec!["Cats.".to_string()]);
    }

    /// A sub-agent that runs out of budget ends the caller with the same
    /// error, even inside `try`.
    #[tokio::test]
    async fn test_exhausted_sub_agent_cannot_be_caught() {
        let parent = script(
            "parent",
            r#"
                let caught = false;
                try { run_agent("spin", #{}); } catch (e) { caught = true; }
                #{ caught: caught }
            "#,
            vec![],
            vec![output("caught", ValueType::Boolean)],
        );
        let spin = script("spin", "let i = 0; loop { i += 1; }", vec![], vec![]);
        let mut config = RuntimeConfig::default();
        config.sandbox.max_operations = 1_000;
        let rt = RuntimeExecutor::new(project(vec![parent, spin]), Collaborators::default(), config);
        let events = Events::default();

        let result = rt
            .execute("parent", json!({}), ExecuteOptions::default(), events.sink())
            .await;
        match result {
            Err(LoomError::ResourceExceeded { resource, limit }) => {
                assert_eq!(resource, "operations");
                assert_eq!(limit, "1000");
            }
            other => panic!("expected ResourceExceeded, got {:?}", other),
        }
        let last_error = events.all().into_iter().rev().find_map(|e| match e {
            StreamEvent::Error { error } => error.kind,
            _ => None,
        });
        assert_eq!(last_error.as_deref(), Some("ResourceExceeded"));
    }

    /// `fetch` reaches paths under an allowed base url, never its siblings.
    #[tokio::test]
    async fn test_script_fetch_respects_path_boundary() {
        let caller = script(
            "caller",
            r#"
                let denied = "";
                try { fetch("https://svc.example.com/api-admin/users"); } catch (e) { denied = e.name; }
                let ok = fetch("https://svc.example.com/api/users");
                #{ denied: denied, status: ok.status }
            "#,
            vec![],
            vec![output("denied", ValueType::String), output("status", ValueType::Integer)],
        );
        let http = Arc::new(MockHttp::new(200, json!({ "users": [] })));
        let requests = http.requests.clone();
        let mut config = RuntimeConfig::default();
        config.http.allowed_base_urls = vec!["https://svc.example.com/api".to_string()];
        let rt = RuntimeExecutor::new(project(vec![caller]), Collaborators::default().with_http(http), config);

        let outputs = rt
            .execute("caller", json!({}), ExecuteOptions::default(), EventSink::discard())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "denied": "HttpError", "status": 200 }));
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://svc.example.com/api/users");
    }

    // ── HTTP ──────────────────────────────────────────────────────────────────

    fn weather() -> AgentDefinition {
        agent(
            "weather",
            vec![input("city", ValueType::String)],
            vec![output("temperature", ValueType::Number)],
            AgentKind::HttpApi(HttpApiSpec {
                endpoint: EndpointRef::Named("forecast".into()),
                parameters: vec![
                    HttpParameter {
                        name: "city".into(),
                        location: ParameterLocation::Path,
                        value: ValueBinding::variable("city", vec![]),
                    },
                    HttpParameter {
                        name: "units".into(),
                        location: ParameterLocation::Query,
                        value: ValueBinding::Literal { value: json!("metric") },
                    },
                ],
                response: BTreeMap::from([("temperature".to_string(), "/data/temp".to_string())]),
                max_retries: None,
            }),
        )
    }

    fn forecast_endpoint() -> EndpointDescriptor {
        EndpointDescriptor {
            method: "GET".into(),
            base_url: "https://weather.test".into(),
            path: "/v1/forecast/{city}".into(),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_http_agent_maps_response() {
        let http = Arc::new(MockHttp::new(200, json!({ "data": { "temp": 18.5 } })));
        let rt = runtime(
            project(vec![weather()]).with_endpoint("forecast", forecast_endpoint()),
            Collaborators::default().with_http(http.clone()),
        );

        let outputs = rt
            .execute("weather", json!({ "city": "Oslo" }), ExecuteOptions::default(), EventSink::discard())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "temperature": 18.5 }));

        let requests = http.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://weather.test/v1/forecast/Oslo?units=metric");
    }

    #[tokio::test]
    async fn test_http_agent_rejects_error_status() {
        let http = Arc::new(MockHttp::new(503, json!("unavailable")));
        let rt = runtime(
            project(vec![weather()]).with_endpoint("forecast", forecast_endpoint()),
            Collaborators::default().with_http(http.clone()),
        );

        let result = rt
            .execute("weather", json!({ "city": "Oslo" }), ExecuteOptions::default(), EventSink::discard())
            .await;
        match result {
            Err(LoomError::Http { status, .. }) => assert_eq!(status, Some(503)),
            other => panic!("expected Http error, got {:?}", other),
        }
        assert_eq!(http.requests.lock().unwrap().len(), 1);
    }

    // ── Cache and streaming ───────────────────────────────────────────────────

    /// A cached run returns the stored outputs without emitting anything.
    #[tokio::test]
    async fn test_cache_hit_skips_execution() {
        let cache = Arc::new(InMemoryCache::default());
        let rt = runtime(project(flow(false)), Collaborators::default().with_cache(cache.clone()));

        let first = Events::default();
        rt.execute("flow", json!({}), ExecuteOptions::default(), first.sink())
            .await
            .unwrap();
        assert!(!first.all().is_empty());
        assert!(!cache.is_empty());

        let second = Events::default();
        let outputs = rt
            .execute("flow", json!({}), ExecuteOptions::default(), second.sink())
            .await
            .unwrap();
        assert_eq!(outputs, json!({ "result": 10 }));
        assert!(second.all().is_empty());
    }

    #[tokio::test]
    async fn test_execute_stream_ends_with_completed() {
        let rt = Arc::new(runtime(project(flow(false)), Collaborators::default()));

        let updates: Vec<RunUpdate> = rt.execute_stream("flow", json!({}), ExecuteOptions::default()).collect().await;

        assert!(updates.len() > 1);
        assert_eq!(
            updates.last(),
            Some(&RunUpdate::Completed {
                outputs: json!({ "result": 10 })
            })
        );
    }

    #[tokio::test]
    async fn test_execute_stream_failure_ends_with_error() {
        let rt = Arc::new(runtime(project(vec![]), Collaborators::default()));

        let updates: Vec<RunUpdate> = rt.execute_stream("ghost", json!({}), ExecuteOptions::default()).collect().await;

        assert_eq!(updates.len(), 1);
        match &updates[0] {
            RunUpdate::Event {
                event: StreamEvent::Error { error },
            } => assert_eq!(error.kind.as_deref(), Some("AgentNotFound")),
            other => panic!("expected ERROR event, got {:?}", other),
        }
    }
}
