//! # loom-config
//!
//! TOML-driven runtime configuration for the LOOM runtime.
//!
//! ```rust,ignore
//! use std::path::Path;
//! use loom_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_file(Path::new("loom.toml"))?;
//! ```
//!
//! Missing sections fall back to their defaults: two retries, a 5 s sandbox
//! deadline, 16 MiB of script memory, every host capability granted, no
//! reachable `fetch` targets, and "```json" / "```" extraction fences.

pub mod loader;
pub mod settings;

pub use settings::{ExtractionConfig, HttpConfig, RuntimeConfig, SandboxConfig};

// ── Tests ─────────────────────────────────────────────────────────────────────
