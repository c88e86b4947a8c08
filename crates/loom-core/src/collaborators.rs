//! Default collaborator implementations and the bundle passed to executors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use loom_contracts::{
    agent::AgentDefinition,
    error::{LoomError, LoomResult},
    identity::AgentIdentity,
};

use crate::traits::{
    CachePort, HttpClient, HttpRequest, HttpResponse, ImageModelCall, MemoryLookup, MemoryVariable, ModelCall,
    ResourceResolver,
};

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Resolves nothing.
#[derive(Debug, Default)]
pub struct NoResolver;

#[async_trait]
impl ResourceResolver for NoResolver {
    async fn resolve_agent(&self, _identity: &AgentIdentity) -> LoomResult<Option<AgentDefinition>> {
        Ok(None)
    }
}

/// No memory variables for anyone.
#[derive(Debug, Default)]
pub struct NoMemory;

#[async_trait]
impl MemoryLookup for NoMemory {
    async fn variables(&self, _identity: &AgentIdentity) -> LoomResult<Vec<MemoryVariable>> {
        Ok(Vec::new())
    }
}

/// Never hits, never stores.
#[derive(Debug, Default)]
pub struct NoopCache;

#[async_trait]
impl CachePort for NoopCache {
    async fn get(&self, _fingerprint: &str) -> Option<Value> {
        None
    }

    async fn set(&self, _fingerprint: &str, _outputs: &Value) {}
}

/// A process-local cache. Useful for tests and single-user tools.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl InMemoryCache {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CachePort for InMemoryCache {
    async fn get(&self, fingerprint: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }

    async fn set(&self, fingerprint: &str, outputs: &Value) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fingerprint.to_string(), outputs.clone());
    }
}

/// `HttpClient` backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn with_timeout(timeout: Duration) -> LoomResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoomError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> LoomResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| LoomError::Http {
            status: None,
            reason: format!("invalid method '{}': {e}", request.method),
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| LoomError::Http {
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = response.text().await.map_err(|e| LoomError::Http {
            status: Some(status),
            reason: format!("failed to read response body: {e}"),
        })?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        debug!(url = %request.url, status, "http response received");
        Ok(HttpResponse { status, headers, body })
    }
}

// ── Bundle ────────────────────────────────────────────────────────────────────

/// Everything an executor may call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub model: Option<Arc<dyn ModelCall>>,
    pub image_model: Option<Arc<dyn ImageModelCall>>,
    pub resolver: Arc<dyn ResourceResolver>,
    pub memory: Arc<dyn MemoryLookup>,
    pub cache: Arc<dyn CachePort>,
    pub http: Arc<dyn HttpClient>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            model: None,
            image_model: None,
            resolver: Arc::new(NoResolver),
            memory: Arc::new(NoMemory),
            cache: Arc::new(NoopCache),
            http: Arc::new(ReqwestHttpClient::default()),
        }
    }
}

impl Collaborators {
    pub fn with_model(mut self, model: Arc<dyn ModelCall>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_image_model(mut self, image_model: Arc<dyn ImageModelCall>) -> Self {
        self.image_model = Some(image_model);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryLookup>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CachePort>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }

    pub(crate) fn model(&self) -> LoomResult<&Arc<dyn ModelCall>> {
        self.model.as_ref().ok_or_else(|| LoomError::Model {
            reason: "no model collaborator configured".to_string(),
        })
    }

    pub(crate) fn image_model(&self) -> LoomResult<&Arc<dyn ImageModelCall>> {
        self.image_model.as_ref().ok_or_else(|| LoomError::Model {
            reason: "no image model collaborator configured".to_string(),
        })
    }
}
