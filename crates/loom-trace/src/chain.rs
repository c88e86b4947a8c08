//! Hash-chain primitives for recorded run events.
//!
//! Hash input layout (bytes, in order):
//!   1. run_id as UTF-8 bytes
//!   2. sequence as 8-byte little-endian
//!   3. prev_hash as UTF-8 bytes (64 ASCII hex chars)
//!   4. compact JSON of the event

use sha2::{Digest, Sha256};

use loom_contracts::{error::LoomResult, event::StreamEvent};

use crate::event::RecordedEvent;

/// Compute the SHA-256 hash of one recorded event.
///
/// Returns a lowercase 64-character hex string.
pub fn hash_event(run_id: &str, sequence: u64, event: &StreamEvent, prev_hash: &str) -> LoomResult<String> {
    let event_json = serde_json::to_vec(event)?;

    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(&event_json);

    Ok(hex::encode(hasher.finalize()))
}

/// Verify prev-hash linkage and hash correctness of every event.
///
/// An empty chain is valid.
pub fn verify_chain(events: &[RecordedEvent]) -> bool {
    let mut expected_prev = RecordedEvent::GENESIS_HASH.to_string();

    for event in events {
        if event.prev_hash != expected_prev {
            return false;
        }

        match hash_event(&event.run_id, event.sequence, &event.event, &event.prev_hash) {
            Ok(recomputed) if recomputed == event.this_hash => {}
            _ => return false,
        }

        expected_prev = event.this_hash.clone();
    }

    true
}
