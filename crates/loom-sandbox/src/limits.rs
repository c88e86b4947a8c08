//! Resource limits for one script run.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, ImmutableString};

use loom_config::SandboxConfig;
use loom_contracts::capability::CapabilitySet;

/// Termination token raised by the progress callback past the deadline.
pub(crate) const DEADLINE_TOKEN: &str = "deadline exceeded";

// Rough per-element footprint of arrays and maps, used to turn the byte
// ceiling into element-count limits.
const ARRAY_ELEMENT_BYTES: u64 = 16;
const MAP_ENTRY_BYTES: u64 = 48;

const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
const MAX_MODULES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    pub memory_limit_bytes: u64,
    pub deadline: Duration,
    /// `0` disables the operation count check.
    pub max_operations: u64,
    pub allowed_modules: Vec<String>,
    pub capabilities: CapabilitySet,
}

impl SandboxLimits {
    /// A short deadline with every capability granted, for tests and tools.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::from(&SandboxConfig::default())
        }
    }

    pub(crate) fn apply(&self, engine: &mut Engine, deadline: Instant) {
        let bytes = usize::try_from(self.memory_limit_bytes).unwrap_or(usize::MAX);
        let elements = |per: u64| usize::try_from((self.memory_limit_bytes / per).max(1)).unwrap_or(usize::MAX);

        engine.set_max_string_size(bytes);
        engine.set_max_array_size(elements(ARRAY_ELEMENT_BYTES));
        engine.set_max_map_size(elements(MAP_ENTRY_BYTES));
        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        engine.set_max_modules(MAX_MODULES);
        engine.set_max_operations(self.max_operations);

        engine.on_progress(move |_| {
            (Instant::now() >= deadline).then(|| Dynamic::from(ImmutableString::from(DEADLINE_TOKEN)))
        });
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            deadline: config.deadline(),
            max_operations: config.max_operations,
            allowed_modules: config.allowed_modules.clone(),
            capabilities: config.capability_set(),
        }
    }
}
