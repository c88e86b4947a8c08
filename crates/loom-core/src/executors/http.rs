//! HTTP/API agents: one request built from bound parameters, outputs picked
//! out of the JSON response by pointer.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use loom_contracts::{
    agent::{AgentDefinition, AgentKind, AgentKindTag, EndpointDescriptor, EndpointRef, HttpApiSpec, ParameterLocation},
    error::{LoomError, LoomResult},
};

use crate::bindings::resolve;
use crate::task::{input_map, Invocation};
use crate::template::value_text;
use crate::traits::HttpRequest;

use super::{kind_mismatch, AgentExecutor};

static PATH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("path parameter pattern is valid"));

pub struct HttpApiExecutor;

fn spec(definition: &AgentDefinition) -> LoomResult<&HttpApiSpec> {
    match &definition.kind {
        AgentKind::HttpApi(spec) => Ok(spec),
        _ => Err(kind_mismatch(definition, AgentKindTag::HttpApi)),
    }
}

fn invalid_url(reason: String) -> LoomError {
    LoomError::Http { status: None, reason }
}

/// Build the request for `endpoint` with every parameter bound over
/// `variables`. Null parameters are left out.
fn build_request(
    endpoint: &EndpointDescriptor,
    spec: &HttpApiSpec,
    variables: &Map<String, Value>,
) -> LoomResult<HttpRequest> {
    let mut path_params = BTreeMap::new();
    let mut query = Vec::new();
    let mut headers: Vec<(String, String)> = endpoint.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let mut cookies = Vec::new();
    let mut body = Map::new();

    for param in &spec.parameters {
        let value = resolve(&param.value, variables);
        if value.is_null() {
            continue;
        }
        match param.location {
            ParameterLocation::Path => {
                path_params.insert(param.name.as_str(), value_text(&value));
            }
            ParameterLocation::Query => query.push((param.name.as_str(), value_text(&value))),
            ParameterLocation::Header => headers.push((param.name.clone(), value_text(&value))),
            ParameterLocation::Cookie => cookies.push(format!("{}={}", param.name, value_text(&value))),
            ParameterLocation::Body => {
                body.insert(param.name.clone(), value);
            }
        }
    }

    let mut url = Url::parse(&endpoint.base_url)
        .map_err(|e| invalid_url(format!("invalid base url '{}': {e}", endpoint.base_url)))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| invalid_url(format!("base url '{}' cannot carry a path", endpoint.base_url)))?;
        segments.pop_if_empty();
        for segment in endpoint.path.split('/').filter(|s| !s.is_empty()) {
            let rendered = PATH_PARAM.replace_all(segment, |caps: &regex::Captures<'_>| {
                path_params.get(&caps[1]).cloned().unwrap_or_else(|| {
                    warn!(parameter = %&caps[1], "path parameter has no value");
                    String::new()
                })
            });
            segments.push(&rendered);
        }
    }
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    if !cookies.is_empty() {
        headers.push(("Cookie".to_string(), cookies.join("; ")));
    }

    Ok(HttpRequest {
        method: endpoint.method.to_uppercase(),
        url: url.to_string(),
        headers,
        body: (!body.is_empty()).then_some(Value::Object(body)),
    })
}

/// Outputs picked from the response body. Without a mapping an object body
/// is the output; anything else is wrapped as `body`.
fn map_response(mapping: &BTreeMap<String, String>, body: &Value) -> Value {
    if mapping.is_empty() {
        return match body {
            Value::Object(_) => body.clone(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other.clone());
                Value::Object(map)
            }
        };
    }
    Value::Object(
        mapping
            .iter()
            .filter_map(|(name, pointer)| body.pointer(pointer).map(|v| (name.clone(), v.clone())))
            .collect(),
    )
}

#[async_trait]
impl AgentExecutor for HttpApiExecutor {
    fn kind(&self) -> AgentKindTag {
        AgentKindTag::HttpApi
    }

    async fn process(&self, inv: &Invocation<'_>, inputs: Value) -> LoomResult<Value> {
        let spec = spec(inv.definition)?;
        let endpoint = match &spec.endpoint {
            EndpointRef::Inline(endpoint) => endpoint.clone(),
            EndpointRef::Named(name) => inv.runtime.resolve_endpoint(name).await?.ok_or_else(|| {
                LoomError::InvalidDefinition {
                    agent: inv.definition.id.clone(),
                    reason: format!("unknown endpoint '{name}'"),
                }
            })?,
        };

        let request = build_request(&endpoint, spec, &input_map(&inputs))?;
        debug!(task_id = %inv.task_id(), method = %request.method, url = %request.url, "api request");

        let http = inv.runtime.collaborators().http.as_ref();
        let request = &request;
        inv.retry_policy()
            .run(&inv.definition.id, |_| async move {
                let response = http.send(request.clone()).await?;
                if !response.is_success() {
                    return Err(LoomError::Http {
                        status: Some(response.status),
                        reason: format!("{} {} returned {}", request.method, request.url, response.status),
                    });
                }
                let outputs = map_response(&spec.response, &response.body);
                inv.validate(&outputs)?;
                Ok(outputs)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use loom_contracts::agent::{HttpParameter, ValueBinding};

    use super::*;

    fn endpoint() -> EndpointDescriptor {
        EndpointDescriptor {
            method: "get".into(),
            base_url: "https://api.example.com/v1/".into(),
            path: "/cities/{city}/weather".into(),
            headers: BTreeMap::from([("Accept".to_string(), "application/json".to_string())]),
        }
    }

    fn param(name: &str, location: ParameterLocation, from: &str) -> HttpParameter {
        HttpParameter {
            name: name.into(),
            location,
            value: ValueBinding::variable(from, vec![]),
        }
    }

    fn api(parameters: Vec<HttpParameter>) -> HttpApiSpec {
        HttpApiSpec {
            endpoint: EndpointRef::Inline(endpoint()),
            parameters,
            response: BTreeMap::new(),
            max_retries: None,
        }
    }

    #[test]
    fn parameters_land_in_their_locations() {
        let spec = api(vec![
            param("city", ParameterLocation::Path, "city"),
            param("units", ParameterLocation::Query, "units"),
            param("X-Key", ParameterLocation::Header, "key"),
            param("session", ParameterLocation::Cookie, "session"),
            param("note", ParameterLocation::Body, "note"),
            param("absent", ParameterLocation::Query, "missing"),
        ]);
        let variables = json!({
            "city": "San José", "units": "metric", "key": "k1", "session": "s1", "note": { "a": 1 }
        });
        let request = build_request(&endpoint(), &spec, variables.as_object().unwrap()).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(
            request.url,
            "https://api.example.com/v1/cities/San%20Jos%C3%A9/weather?units=metric"
        );
        assert!(request.headers.contains(&("Accept".to_string(), "application/json".to_string())));
        assert!(request.headers.contains(&("X-Key".to_string(), "k1".to_string())));
        assert!(request.headers.contains(&("Cookie".to_string(), "session=s1".to_string())));
        assert_eq!(request.body, Some(json!({ "note": { "a": 1 } })));
    }

    #[test]
    fn path_values_cannot_escape_their_segment() {
        let spec = api(vec![param("city", ParameterLocation::Path, "city")]);
        let variables = json!({ "city": "../admin" });
        let request = build_request(&endpoint(), &spec, variables.as_object().unwrap()).unwrap();
        assert!(request.url.contains("/cities/..%2Fadmin/weather"));
    }

    #[test]
    fn response_mapping_uses_json_pointers() {
        let body = json!({ "data": { "temp": 21.5, "tags": ["sunny"] } });
        let mapping = BTreeMap::from([
            ("temperature".to_string(), "/data/temp".to_string()),
            ("first_tag".to_string(), "/data/tags/0".to_string()),
            ("missing".to_string(), "/nope".to_string()),
        ]);
        assert_eq!(
            map_response(&mapping, &body),
            json!({ "temperature": 21.5, "first_tag": "sunny" })
        );
        assert_eq!(map_response(&BTreeMap::new(), &json!("plain")), json!({ "body": "plain" }));
    }
}
