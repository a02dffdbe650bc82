//! Entity id generation

use sha2::{Digest, Sha256};

/// Generate a 64-char lowercase hex id for containers and sandboxes.
///
/// Derived from a fresh UUID so ids are process-unique without coordination.
pub fn new_entity_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a 32-char image id from the reference and the content digest
pub fn new_image_id(reference: &str, content_digest: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hasher.update(content_digest);
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Abbreviate an id for logs and listings
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_shape() {
        let id = new_entity_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_entity_id());
    }

    #[test]
    fn test_image_id_deterministic() {
        let a = new_image_id("alpine:latest", b"digest");
        let b = new_image_id("alpine:latest", b"digest");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = new_image_id("alpine:3.19", b"digest");
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
