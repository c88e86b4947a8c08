//! Schema-based output verifier for the LOOM runtime.
//!
//! Verification runs in two phases:
//!
//! 1. **Structural** — the output object is validated against
//!    `OutputSchema::json_schema` using the `jsonschema` crate.
//! 2. **Semantic** — each `VerificationRule` in `OutputSchema::rules` is
//!    evaluated in order. All failures are collected before returning.
//!
//! Custom rules delegate to named functions registered via `register_rule`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use loom_contracts::{
    error::{LoomError, LoomResult},
    verify::{OutputSchema, VerificationFailure, VerificationReport, VerificationRuleType},
};

/// The output verifier seam used by every executor.
pub trait Verifier: Send + Sync {
    /// Check `output` against `schema` and report every failure found.
    fn verify(&self, output: &Value, schema: &OutputSchema) -> LoomResult<VerificationReport>;

    /// Like [`Verifier::verify`], but a failing report becomes
    /// `LoomError::OutputValidation`.
    fn ensure_valid(&self, output: &Value, schema: &OutputSchema) -> LoomResult<()> {
        let report = self.verify(output, schema)?;
        if report.passed {
            Ok(())
        } else {
            Err(LoomError::OutputValidation {
                reason: report.summary(),
            })
        }
    }
}

/// A caller-supplied verification function.
///
/// Returns `Some(message)` when the check fails, `None` on success.
pub type CustomVerifierFn = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// JSON Schema + semantic rule verifier.
#[derive(Default)]
pub struct SchemaVerifier {
    custom_rules: HashMap<String, CustomVerifierFn>,
}

impl SchemaVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom verification function under `name`.
    ///
    /// Registering the same name twice replaces the previous function.
    pub fn register_rule(&mut self, name: impl Into<String>, f: CustomVerifierFn) {
        self.custom_rules.insert(name.into(), f);
    }

    /// Resolve a dotted path (e.g. `"summary.title"`). Missing or null ⇒ `None`.
    fn resolve_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
        path.split('.').try_fold(value, |current, segment| {
            current.get(segment).filter(|v| !v.is_null())
        })
    }

    fn structural_failures(output: &Value, schema: &OutputSchema) -> Vec<VerificationFailure> {
        if schema.json_schema.is_null() {
            return Vec::new();
        }

        match jsonschema::validator_for(&schema.json_schema) {
            Ok(validator) => validator
                .iter_errors(output)
                .map(|error| {
                    let message = format!("JSON Schema violation at '{}': {}", error.instance_path, error);
                    debug!(schema_id = %schema.schema_id, %message, "structural validation failure");
                    VerificationFailure {
                        rule_id: "json-schema".to_string(),
                        message,
                    }
                })
                .collect(),
            Err(e) => {
                // A broken schema is reported as a failure rather than a crash
                // so the executor surfaces it like any other invalid output.
                let message = format!("invalid JSON Schema document: {e}");
                warn!(schema_id = %schema.schema_id, %message, "schema compilation failure");
                vec![VerificationFailure {
                    rule_id: "json-schema".to_string(),
                    message,
                }]
            }
        }
    }

    fn rule_failure(&self, output: &Value, rule_type: &VerificationRuleType) -> Option<String> {
        match rule_type {
            VerificationRuleType::RequiredField { field_path } => Self::resolve_path(output, field_path)
                .is_none()
                .then(|| format!("required field '{field_path}' is missing or null")),

            VerificationRuleType::AllowedValues { field_path, allowed } => {
                match Self::resolve_path(output, field_path) {
                    None => Some(format!("field '{field_path}' is missing; cannot check allowed values")),
                    Some(actual) if allowed.contains(actual) => None,
                    Some(actual) => Some(format!(
                        "field '{field_path}' has value {actual} which is not in the allowed set"
                    )),
                }
            }

            // Only string values can carry a forbidden pattern.
            VerificationRuleType::ForbiddenPattern { field_path, pattern } => {
                Self::resolve_path(output, field_path)
                    .and_then(Value::as_str)
                    .filter(|s| s.contains(pattern.as_str()))
                    .map(|_| format!("field '{field_path}' contains forbidden pattern '{pattern}'"))
            }

            VerificationRuleType::Custom { function_name } => match self.custom_rules.get(function_name) {
                Some(f) => f(output),
                None => Some(format!(
                    "no custom rule registered for function name '{function_name}'"
                )),
            },
        }
    }
}

impl Verifier for SchemaVerifier {
    fn verify(&self, output: &Value, schema: &OutputSchema) -> LoomResult<VerificationReport> {
        let mut failures = Self::structural_failures(output, schema);

        for rule in &schema.rules {
            if let Some(message) = self.rule_failure(output, &rule.rule_type) {
                warn!(rule_id = %rule.rule_id, %message, "semantic rule failed");
                failures.push(VerificationFailure {
                    rule_id: rule.rule_id.clone(),
                    message,
                });
            }
        }

        let passed = failures.is_empty();
        debug!(
            schema_id = %schema.schema_id,
            passed,
            failure_count = failures.len(),
            "verification complete"
        );

        Ok(VerificationReport { passed, failures })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
