//! The local project: agents and named endpoints resolved without a
//! round-trip to the resource resolver.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use loom_contracts::{
    agent::{AgentDefinition, EndpointDescriptor},
    error::{LoomError, LoomResult},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointDescriptor>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.get(name)
    }

    pub fn from_json_str(text: &str) -> LoomResult<Self> {
        let project: Self = serde_json::from_str(text)?;
        if project.id.is_empty() {
            return Err(LoomError::Config {
                reason: "project id must not be empty".to_string(),
            });
        }
        Ok(project)
    }

    pub fn from_file(path: &Path) -> LoomResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| LoomError::Config {
            reason: format!("cannot read project file '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }
}
