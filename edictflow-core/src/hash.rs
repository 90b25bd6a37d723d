//! Content hashing for managed files

use sha2::{Digest, Sha256};

/// SHA-256 over the full byte string, hex encoded
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash of the empty input; the baseline of a file that does not exist yet
pub fn empty_hash() -> String {
    content_hash(b"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        // SHA256 of "hello world"
        assert_eq!(
            content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            empty_hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
