//! Agent identity and its opaque token form.
//!
//! Agents reference each other everywhere through a single string token:
//! the standard base64 encoding of `component/projectId/projectRevision/agentId`
//! with empty segments preserved. Decoding right-aligns short tokens, so
//! `projectId/agentId` and `projectId/revision/agentId` are accepted too.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoomError, LoomResult};

const SEPARATOR: char = '/';

/// Immutable address of an agent.
///
/// `component` absent means "local to the current project".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_revision: Option<String>,
    pub agent_id: String,
}

impl AgentIdentity {
    /// A local identity: no component, no pinned revision.
    pub fn local(project_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            component: None,
            project_id: project_id.into(),
            project_revision: None,
            agent_id: agent_id.into(),
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = non_empty(component.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.project_revision = non_empty(revision.into());
        self
    }

    /// Encode this identity into its token form.
    ///
    /// Fails with `InvalidIdentity` when `project_id` or `agent_id` is empty,
    /// or when a leading segment contains the `/` separator.
    pub fn encode(&self) -> LoomResult<String> {
        if self.project_id.is_empty() {
            return Err(LoomError::InvalidIdentity {
                reason: "projectId is required".to_string(),
            });
        }
        if self.agent_id.is_empty() {
            return Err(LoomError::InvalidIdentity {
                reason: "agentId is required".to_string(),
            });
        }

        let component = self.component.as_deref().unwrap_or_default();
        let revision = self.project_revision.as_deref().unwrap_or_default();
        for (field, value) in [
            ("component", component),
            ("projectId", self.project_id.as_str()),
            ("projectRevision", revision),
        ] {
            if value.contains(SEPARATOR) {
                return Err(LoomError::InvalidIdentity {
                    reason: format!("{field} must not contain '{SEPARATOR}'"),
                });
            }
        }

        let joined = [component, &self.project_id, revision, &self.agent_id].join("/");
        Ok(STANDARD.encode(joined))
    }

    /// Decode a token produced by [`AgentIdentity::encode`].
    ///
    /// With `strict = false` a malformed token is logged and `Ok(None)` is
    /// returned; with `strict = true` it is an `InvalidIdentity` error.
    pub fn decode(token: &str, strict: bool) -> LoomResult<Option<Self>> {
        match Self::decode_inner(token) {
            Ok(identity) => Ok(Some(identity)),
            Err(reason) if strict => Err(LoomError::InvalidIdentity { reason }),
            Err(reason) => {
                warn!(token = %token, %reason, "ignoring malformed agent token");
                Ok(None)
            }
        }
    }

    fn decode_inner(token: &str) -> Result<Self, String> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| format!("token is not valid base64: {e}"))?;
        let text = String::from_utf8(bytes).map_err(|_| "token is not valid UTF-8".to_string())?;

        let segments: Vec<&str> = text.splitn(4, SEPARATOR).collect();
        let (component, project_id, revision, agent_id) = match segments.as_slice() {
            [c, p, r, a] => (*c, *p, *r, *a),
            [p, r, a] => ("", *p, *r, *a),
            [p, a] => ("", *p, "", *a),
            _ => return Err(format!("expected 2 to 4 segments, found {}", segments.len())),
        };

        if project_id.is_empty() || agent_id.is_empty() {
            return Err("projectId and agentId must be present".to_string());
        }

        Ok(Self {
            component: non_empty(component.to_string()),
            project_id: project_id.to_string(),
            project_revision: non_empty(revision.to_string()),
            agent_id: agent_id.to_string(),
        })
    }

    /// True when this identity lives in `project_id` and carries no component.
    pub fn is_local_to(&self, project_id: &str) -> bool {
        self.component.is_none() && self.project_id == project_id
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(token) => f.write_str(&token),
            Err(_) => write!(f, "{}/{}", self.project_id, self.agent_id),
        }
    }
}

impl FromStr for AgentIdentity {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s, true)?.ok_or_else(|| LoomError::InvalidIdentity {
            reason: "empty token".to_string(),
        })
    }
}

/// A reference from one agent to another, as written in definitions.
///
/// Either a full identity token or a bare agent id in the caller's project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRef {
    Identity(AgentIdentity),
    Local(String),
}

impl AgentRef {
    pub fn parse(reference: &str) -> Self {
        match AgentIdentity::decode_inner(reference) {
            Ok(identity) => AgentRef::Identity(identity),
            Err(_) => AgentRef::Local(reference.to_string()),
        }
    }

    /// Resolve to a full identity, anchoring local ids in `project_id`.
    pub fn into_identity(self, project_id: &str) -> AgentIdentity {
        match self {
            AgentRef::Identity(identity) => identity,
            AgentRef::Local(agent_id) => AgentIdentity::local(project_id, agent_id),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
