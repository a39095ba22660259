//! Streamed SHA-256 content hashing.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read buffer size for streamed hashing.
const CHUNK_SIZE: usize = 4096;

/// Compute the SHA-256 of a file as 64 lowercase hex characters.
///
/// The file is streamed in [`CHUNK_SIZE`] chunks so arbitrarily large
/// artefacts can be sealed without loading them into memory. Returns an
/// empty string when the file cannot be opened or read.
#[must_use]
pub fn sha256_file(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => hasher.update(&buffer[..read]),
            Err(_) => return String::new(),
        }
    }

    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 of an in-memory buffer as lowercase hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const HELLO_SHA256: &str =
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_file_known_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(sha256_file(file.path()), HELLO_SHA256);
    }

    #[test]
    fn test_sha256_file_missing_returns_empty() {
        assert_eq!(sha256_file(Path::new("/nonexistent/artefact.bin")), "");
    }

    #[test]
    fn test_sha256_file_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            sha256_file(file.path()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_file_larger_than_chunk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let content = vec![0xA5u8; CHUNK_SIZE * 3 + 17];
        file.write_all(&content).unwrap();
        assert_eq!(sha256_file(file.path()), sha256_hex(&content));
    }

    #[test]
    fn test_sha256_hex_matches_file_variant() {
        assert_eq!(sha256_hex(b"hello"), HELLO_SHA256);
    }
}
