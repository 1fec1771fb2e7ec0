use sha2::{Digest, Sha256};

/// Hash a user identifier for use in feed storage keys.
///
/// Feed keys are enumerable by any reader with access to the table, so the
/// raw identifier must never appear in them. The hash is deterministic so
/// that redeliveries of the same event address the same key.
pub fn subject_token(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    format!("{:x}", hasher.finalize())
}
