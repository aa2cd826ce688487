//! SHA-256 helpers.
//!
//! Used for the configuration fingerprint that the orchestrator compares
//! against the value captured when the rules were last validated.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Fingerprint a configuration source on disk.
///
/// Returns the hex digest of the file contents. Any read failure is
/// propagated so the caller can decide how to treat an unreadable source.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_tracks_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        std::fs::write(&path, b"[]").unwrap();
        let first = fingerprint_file(&path).unwrap();
        assert_eq!(first, sha256_hex(b"[]"));

        std::fs::write(&path, b"[ ]").unwrap();
        assert_ne!(fingerprint_file(&path).unwrap(), first);
    }

    #[test]
    fn fingerprint_of_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fingerprint_file(&dir.path().join("absent.json")).is_err());
    }
}
