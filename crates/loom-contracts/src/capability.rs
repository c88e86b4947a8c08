//! Host capabilities a sandboxed script may be granted.
//!
//! Scripts get no ambient access to the host. Each host function exposed to
//! a script belongs to one `HostCapability`; only granted capabilities have
//! their functions registered in the interpreter.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LoomError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostCapability {
    /// `log(message)`: routed to a LOG event, never the host console.
    Log,
    /// `fetch(method, url, body)`: same-deployment HTTP only.
    Http,
    /// `run_agent(name, inputs[, options])`: recursive agent execution.
    RunAgent,
    /// `json(parts)` and `agent(name, inputs)`: validated object streaming.
    Json,
}

impl HostCapability {
    pub const ALL: [HostCapability; 4] = [
        HostCapability::Log,
        HostCapability::Http,
        HostCapability::RunAgent,
        HostCapability::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostCapability::Log => "log",
            HostCapability::Http => "http",
            HostCapability::RunAgent => "run_agent",
            HostCapability::Json => "json",
        }
    }
}

impl fmt::Display for HostCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostCapability {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostCapability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LoomError::Config {
                reason: format!("unknown host capability '{s}'"),
            })
    }
}

/// The set of capabilities granted to one sandbox run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    inner: BTreeSet<HostCapability>,
}

impl CapabilitySet {
    /// Every capability the runtime knows about.
    pub fn all() -> Self {
        HostCapability::ALL.into_iter().collect()
    }

    pub fn grant(&mut self, capability: HostCapability) {
        self.inner.insert(capability);
    }

    pub fn has(&self, capability: HostCapability) -> bool {
        self.inner.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = HostCapability> + '_ {
        self.inner.iter().copied()
    }
}

impl FromIterator<HostCapability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = HostCapability>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
