//! # loom-verify
//!
//! Output verification for the LOOM runtime.
//!
//! [`engine::SchemaVerifier`] validates agent outputs in two phases:
//!
//! 1. **Structural** — JSON Schema validation via the `jsonschema` crate,
//!    against the schema derived from the agent's declared outputs.
//! 2. **Semantic** — `RequiredField`, `AllowedValues`, `ForbiddenPattern`
//!    and `Custom` rules attached to the agent definition.
//!
//! ```rust,ignore
//! use loom_verify::{SchemaVerifier, Verifier};
//!
//! let verifier = SchemaVerifier::new();
//! verifier.ensure_valid(&outputs, &OutputSchema::for_agent(&definition))?;
//! ```

pub mod engine;

pub use engine::{CustomVerifierFn, SchemaVerifier, Verifier};
