//! Record identifiers.

use chrono::{DateTime, Utc};
use rand::RngCore;

/// Generate a record ID: hex of a Blake3 hash over a kind tag, the creation
/// time and 16 random bytes, truncated to 32 characters.
pub fn generate_id(kind: &str, now: DateTime<Utc>) -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(&now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(&nonce);
    let mut id = hex::encode(hasher.finalize().as_bytes());
    id.truncate(32);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_hex() {
        let now = Utc::now();
        let a = generate_id("loan", now);
        let b = generate_id("loan", now);
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
