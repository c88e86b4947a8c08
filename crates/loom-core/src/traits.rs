//! Collaborator interfaces consumed by the runtime.
//!
//! The runtime owns no model, network or storage access of its own. Every
//! side effect goes through one of these traits:
//!
//! - `ModelCall`        — streaming chat completion
//! - `ImageModelCall`   — image generation
//! - `ResourceResolver` — agents and endpoints outside the local project
//! - `MemoryLookup`     — per-agent memory variables for templates
//! - `CachePort`        — outputs keyed by run fingerprint
//! - `HttpClient`       — outbound HTTP for API agents and script `fetch`

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use loom_contracts::{
    agent::{AgentDefinition, EndpointDescriptor},
    error::LoomResult,
    identity::AgentIdentity,
    model::{ChatMessage, ModelDelta, ModelSettings},
};

/// A streamed model response.
pub type ModelStream = BoxStream<'static, LoomResult<ModelDelta>>;

/// The language-model primitive.
#[async_trait]
pub trait ModelCall: Send + Sync {
    /// Start a completion and stream its deltas.
    async fn call(&self, messages: Vec<ChatMessage>, settings: &ModelSettings) -> LoomResult<ModelStream>;

    /// Whether the model honours `ModelSettings::response_schema`.
    ///
    /// When false, the runtime asks for a fenced JSON block in plain text
    /// and extracts it from the stream instead.
    fn supports_structured_output(&self, _settings: &ModelSettings) -> bool {
        false
    }
}

/// The image-model primitive. Returns image URLs (or data URLs).
#[async_trait]
pub trait ImageModelCall: Send + Sync {
    async fn generate(&self, prompt: &str, settings: &ModelSettings, count: u32) -> LoomResult<Vec<String>>;
}

/// Resolves agents and named endpoints that are not in the local project.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve_agent(&self, identity: &AgentIdentity) -> LoomResult<Option<AgentDefinition>>;

    async fn resolve_endpoint(&self, _name: &str) -> LoomResult<Option<EndpointDescriptor>> {
        Ok(None)
    }
}

/// A memory variable visible to an agent's templates as `{{memory.name}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryVariable {
    pub name: String,
    pub value: Value,
}

#[async_trait]
pub trait MemoryLookup: Send + Sync {
    async fn variables(&self, identity: &AgentIdentity) -> LoomResult<Vec<MemoryVariable>>;
}

/// Output cache keyed by run fingerprint.
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Option<Value>;
    async fn set(&self, fingerprint: &str, outputs: &Value);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON, or the raw text as a string when the body is not JSON.
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> LoomResult<HttpResponse>;
}
