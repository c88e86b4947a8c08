//! Run fingerprints for the output cache.

use serde_json::Value;
use sha2::{Digest, Sha256};

use loom_contracts::identity::AgentIdentity;

/// SHA-256 over the agent token and the canonical JSON of its inputs.
///
/// Object keys serialize in sorted order, so two input maps with the same
/// entries always produce the same fingerprint.
pub fn fingerprint(identity: &AgentIdentity, inputs: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(inputs.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
