//! Agent binary self-integrity check.

use std::path::Path;

use crate::crypto::sha256_file;

/// Verify the running binary against an expected SHA-256.
///
/// An empty `expected_hash` disables the check. Otherwise the binary is
/// hashed and compared case-insensitively; an unreadable binary fails
/// closed.
#[must_use]
pub fn verify_self_integrity(executable: &Path, expected_hash: &str) -> bool {
    if expected_hash.is_empty() {
        return true;
    }
    let actual = sha256_file(executable);
    !actual.is_empty() && actual.eq_ignore_ascii_case(expected_hash.trim())
}
