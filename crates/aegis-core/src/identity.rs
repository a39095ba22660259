//! Persistent agent identity.
//!
//! The identity file is three lines: `uuid`, `public_key_pem`,
//! `encrypted_private_key_blob`. It is written once on first start and
//! reused verbatim afterwards. Only the uuid is generated locally; key
//! material is provisioned by the enrolment flow and treated as opaque
//! text here.

use std::io::Write;
use std::path::Path;

/// The agent's stable identity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Stable per-install identifier.
    pub uuid: String,
    /// Public key in PEM form; empty until enrolled.
    pub public_key_pem: String,
    /// Platform-protected private key blob; empty until enrolled.
    pub encrypted_private_key_blob: String,
}

impl AgentIdentity {
    /// Generate a fresh identity with a new uuid and unprovisioned key
    /// material.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            public_key_pem: String::new(),
            encrypted_private_key_blob: String::new(),
        }
    }
}

/// Load the identity at `path`, generating and persisting one if the
/// file does not exist or is unreadable as an identity record.
///
/// # Errors
///
/// I/O errors while writing a freshly generated identity.
pub fn load_or_generate(path: &Path) -> std::io::Result<AgentIdentity> {
    if let Some(identity) = read_identity(path) {
        return Ok(identity);
    }

    let identity = AgentIdentity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", identity.uuid)?;
    writeln!(file, "{}", identity.public_key_pem)?;
    writeln!(file, "{}", identity.encrypted_private_key_blob)?;
    tracing::info!(uuid = %identity.uuid, path = %path.display(), "agent identity generated");
    Ok(identity)
}

fn read_identity(path: &Path) -> Option<AgentIdentity> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let uuid = lines.next()?.trim().to_string();
    if uuid.is_empty() {
        return None;
    }
    Some(AgentIdentity {
        uuid,
        public_key_pem: lines.next().unwrap_or("").trim().to_string(),
        encrypted_private_key_blob: lines.next().unwrap_or("").trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reuse() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent_identity.txt");

        let first = load_or_generate(&path).unwrap();
        assert!(!first.uuid.is_empty());
        assert!(path.exists());

        let second = load_or_generate(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_identity_preserved() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent_identity.txt");
        std::fs::write(&path, "stable-uuid\npem-data\nblob-data\n").unwrap();

        let identity = load_or_generate(&path).unwrap();
        assert_eq!(identity.uuid, "stable-uuid");
        assert_eq!(identity.public_key_pem, "pem-data");
        assert_eq!(identity.encrypted_private_key_blob, "blob-data");
    }

    #[test]
    fn test_corrupt_file_regenerated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agent_identity.txt");
        std::fs::write(&path, "\n\n\n").unwrap();

        let identity = load_or_generate(&path).unwrap();
        assert!(!identity.uuid.is_empty());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state/identity/agent_identity.txt");
        load_or_generate(&path).unwrap();
        assert!(path.exists());
    }
}
