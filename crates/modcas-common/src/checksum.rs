//! Content digests used for deterministic content identifiers

use sha2::{Digest, Sha256};

/// Prefix of identifiers produced by [`content_id`].
pub const CONTENT_ID_PREFIX: &str = "sha256-";

/// Compute the hex SHA-256 digest of bytes
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic content identifier for bytes.
///
/// Identical input always yields the identical identifier, which is what makes
/// re-addressing a re-delivered release idempotent.
pub fn content_id(data: &[u8]) -> String {
    format!("{CONTENT_ID_PREFIX}{}", sha256_hex(data))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_content_id_is_deterministic() {
        assert_eq!(content_id(b"module zip"), content_id(b"module zip"));
        assert_ne!(content_id(b"module zip"), content_id(b"module zip 2"));
        assert!(content_id(b"").starts_with(CONTENT_ID_PREFIX));
    }
}
