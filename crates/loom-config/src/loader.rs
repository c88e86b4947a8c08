//! Loading and validating `RuntimeConfig` from TOML.

use std::path::Path;

use tracing::debug;

use loom_contracts::error::{LoomError, LoomResult};

use crate::settings::RuntimeConfig;

impl RuntimeConfig {
    /// Parse `s` as TOML and validate the result.
    ///
    /// Returns `LoomError::Config` if the TOML is malformed, does not match
    /// the schema, or carries out-of-range values.
    pub fn from_toml_str(s: &str) -> LoomResult<Self> {
        let config: RuntimeConfig = toml::from_str(s).map_err(|e| LoomError::Config {
            reason: format!("failed to parse runtime config TOML: {e}"),
        })?;
        config.validate()?;
        debug!(
            max_retries = config.max_retries,
            deadline_ms = config.sandbox.deadline_ms,
            capabilities = config.sandbox.capabilities.len(),
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Read the file at `path` and parse it as runtime configuration.
    pub fn from_file(path: &Path) -> LoomResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| LoomError::Config {
            reason: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> LoomResult<()> {
        if self.sandbox.deadline_ms == 0 {
            return Err(LoomError::Config {
                reason: "sandbox.deadline_ms must be greater than zero".to_string(),
            });
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(LoomError::Config {
                reason: "sandbox.memory_limit_bytes must be greater than zero".to_string(),
            });
        }
        if let Some(bad) = self
            .http
            .allowed_base_urls
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(LoomError::Config {
                reason: format!("http.allowed_base_urls entry '{bad}' is not an http(s) URL"),
            });
        }
        Ok(())
    }
}
