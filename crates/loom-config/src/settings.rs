//! Runtime configuration schema.
//!
//! Every section and field has a serde default, so an empty document is a
//! valid configuration.
//!
//! ```toml
//! max_retries = 2
//!
//! [sandbox]
//! memory_limit_bytes = 16777216
//! deadline_ms = 5000
//! max_operations = 1000000
//! allowed_modules = ["strings"]
//! capabilities = ["log", "http", "run_agent", "json"]
//!
//! [http]
//! allowed_base_urls = ["http://localhost:8080/"]
//! timeout_ms = 30000
//!
//! [extraction]
//! start = "```json"
//! end = "```"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use loom_contracts::capability::{CapabilitySet, HostCapability};

/// Top-level runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Retry budget for agents whose definition does not set one.
    pub max_retries: u32,

    /// Model used when an agent definition leaves its model blank.
    pub default_model: String,

    pub sandbox: SandboxConfig,
    pub http: HttpConfig,
    pub extraction: ExtractionConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            default_model: "default".to_string(),
            sandbox: SandboxConfig::default(),
            http: HttpConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

/// Limits and grants for the script sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Approximate ceiling on the memory a script may hold.
    pub memory_limit_bytes: u64,

    /// Hard wall-clock deadline for one script run.
    pub deadline_ms: u64,

    /// Maximum number of interpreter operations. `0` disables the check.
    pub max_operations: u64,

    /// Module names a script may `import`.
    pub allowed_modules: Vec<String>,

    /// Host functions registered in the interpreter.
    pub capabilities: Vec<HostCapability>,
}

impl SandboxConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn capability_set(&self) -> CapabilitySet {
        self.capabilities.iter().copied().collect()
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 16 * 1024 * 1024,
            deadline_ms: 5_000,
            max_operations: 1_000_000,
            allowed_modules: Vec::new(),
            capabilities: HostCapability::ALL.to_vec(),
        }
    }
}

/// Outbound HTTP settings shared by HTTP agents and the script `fetch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// URL prefixes a script's `fetch` may reach. Empty denies all.
    pub allowed_base_urls: Vec<String>,
    pub timeout_ms: u64,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            allowed_base_urls: Vec::new(),
            timeout_ms: 30_000,
        }
    }
}

/// Delimiters fencing the structured block in model text output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub start: String,
    pub end: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            start: "```json".to_string(),
            end: "```".to_string(),
        }
    }
}
