//! Evidence broker.
//!
//! Artefacts produced along the command and defence paths become
//! [`EvidenceItem`]s: content-addressed records that are *sealed* (their
//! SHA-256 computed and fixed), packaged into a per-item directory with a
//! `metadata.txt`, and queued for durable uplink through the spool.
//!
//! The broker owns its item map under a single mutex. The lock is held
//! only for map access, never across hashing or packaging I/O; sealing
//! and packaging of the same item are nevertheless serialised because
//! both re-check map state under the lock before committing.
//!
//! A sealed item is immutable: `sha256_hex` equals the SHA-256 of the
//! artefact at seal time, and the broker never rewrites artefact content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::sha256_file;
use crate::uplink::{SpoolWriter, UplinkError, UplinkKind};

/// Ingestion path evidence envelopes are shipped to.
const EVIDENCE_TARGET_PATH: &str = "rmm/evidence";

/// Evidence failure modes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvidenceError {
    /// No item with that identifier.
    #[error("evidence {evidence_id} not found")]
    NotFound {
        /// The unknown identifier.
        evidence_id: String,
    },

    /// The artefact file was gone (or unreadable) at seal time. The item
    /// stays unsealed.
    #[error("evidence {evidence_id} artefact missing: {path}")]
    MissingArtifact {
        /// The affected item.
        evidence_id: String,
        /// The missing artefact path.
        path: PathBuf,
    },

    /// Upload requires a sealed item.
    #[error("evidence {evidence_id} is not sealed")]
    NotSealed {
        /// The affected item.
        evidence_id: String,
    },

    /// An item with this identifier is already sealed; sealed items are
    /// immutable.
    #[error("evidence {evidence_id} is already sealed")]
    AlreadySealed {
        /// The affected item.
        evidence_id: String,
    },

    /// Packaging I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The spool rejected the uplink envelope.
    #[error(transparent)]
    Spool(#[from] UplinkError),
}

/// One evidence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Unique evidence identifier.
    pub evidence_id: String,
    /// Producing subsystem (`defence`, `patch`, ...).
    pub source: String,
    /// Evidence type label.
    #[serde(rename = "type")]
    pub evidence_type: String,
    /// Identifier of the object this evidence belongs to.
    pub related_id: String,
    /// Path of the artefact on disk.
    pub storage_path: PathBuf,
    /// SHA-256 of the artefact, fixed at seal time. Empty until sealed.
    pub sha256_hex: String,
    /// Capture time, seconds since epoch.
    pub captured_at: i64,
    /// Whether the item has been sealed.
    pub sealed: bool,
}

impl EvidenceItem {
    /// Create an unsealed item captured now.
    #[must_use]
    pub fn new(
        evidence_id: impl Into<String>,
        source: impl Into<String>,
        evidence_type: impl Into<String>,
        related_id: impl Into<String>,
        storage_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            evidence_id: evidence_id.into(),
            source: source.into(),
            evidence_type: evidence_type.into(),
            related_id: related_id.into(),
            storage_path: storage_path.into(),
            sha256_hex: String::new(),
            captured_at: chrono::Utc::now().timestamp(),
            sealed: false,
        }
    }
}

/// The evidence broker.
pub struct EvidenceBroker {
    items: Mutex<HashMap<String, EvidenceItem>>,
    tenant_id: String,
    asset_id: String,
    package_root: PathBuf,
    spool: SpoolWriter,
}

impl EvidenceBroker {
    /// Create a broker packaging under `package_root` and queueing into
    /// `spool`.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        asset_id: impl Into<String>,
        package_root: impl Into<PathBuf>,
        spool: SpoolWriter,
    ) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            tenant_id: tenant_id.into(),
            asset_id: asset_id.into(),
            package_root: package_root.into(),
            spool,
        }
    }

    /// Store a new item. The stored record is always unsealed with an
    /// empty hash regardless of the fields passed in; sealing is the only
    /// way to fix a hash.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::AlreadySealed`] when a sealed item with the same
    /// identifier exists — sealed items are never replaced.
    pub fn add(&self, mut item: EvidenceItem) -> Result<(), EvidenceError> {
        item.sealed = false;
        item.sha256_hex = String::new();

        let mut items = self.lock();
        if items
            .get(&item.evidence_id)
            .is_some_and(|existing| existing.sealed)
        {
            return Err(EvidenceError::AlreadySealed {
                evidence_id: item.evidence_id,
            });
        }
        items.insert(item.evidence_id.clone(), item);
        Ok(())
    }

    /// Seal an item: stream the artefact's SHA-256 and fix it.
    ///
    /// Sealing an already-sealed item is a no-op returning the existing
    /// hash. A missing artefact leaves the item unsealed.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::NotFound`] and [`EvidenceError::MissingArtifact`].
    pub fn seal(&self, evidence_id: &str) -> Result<String, EvidenceError> {
        let storage_path = {
            let items = self.lock();
            let item = items.get(evidence_id).ok_or_else(|| EvidenceError::NotFound {
                evidence_id: evidence_id.to_string(),
            })?;
            if item.sealed {
                return Ok(item.sha256_hex.clone());
            }
            item.storage_path.clone()
        };

        // Hash outside the lock; artefacts can be large.
        let hash = sha256_file(&storage_path);
        if hash.is_empty() {
            warn!(evidence_id, path = %storage_path.display(), "artefact missing at seal time");
            return Err(EvidenceError::MissingArtifact {
                evidence_id: evidence_id.to_string(),
                path: storage_path,
            });
        }

        let mut items = self.lock();
        let item = items.get_mut(evidence_id).ok_or_else(|| EvidenceError::NotFound {
            evidence_id: evidence_id.to_string(),
        })?;
        if item.sealed {
            return Ok(item.sha256_hex.clone());
        }
        item.sha256_hex = hash.clone();
        item.sealed = true;
        info!(evidence_id, hash = %hash, "evidence sealed");
        Ok(hash)
    }

    /// Package a sealed item and queue it for uplink.
    ///
    /// The package directory `<package_root>/<evidence_id>/` receives a
    /// copy of the artefact and a `metadata.txt` of `key=value` lines;
    /// one envelope referencing the package is then spooled.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::NotFound`], [`EvidenceError::NotSealed`],
    /// packaging I/O errors, and spool failures.
    pub fn upload(&self, evidence_id: &str) -> Result<PathBuf, EvidenceError> {
        let item = {
            let items = self.lock();
            let item = items.get(evidence_id).ok_or_else(|| EvidenceError::NotFound {
                evidence_id: evidence_id.to_string(),
            })?;
            if !item.sealed {
                return Err(EvidenceError::NotSealed {
                    evidence_id: evidence_id.to_string(),
                });
            }
            item.clone()
        };

        let package_dir = self.package_root.join(&item.evidence_id);
        std::fs::create_dir_all(&package_dir)?;

        if item.storage_path.exists() {
            if let Some(file_name) = item.storage_path.file_name() {
                std::fs::copy(&item.storage_path, package_dir.join(file_name))?;
            }
        }

        let absolute_dir = std::path::absolute(&package_dir)?;
        let storage_uri = format!("file://{}", absolute_dir.display());
        let related_id = if item.related_id.is_empty() {
            &item.evidence_id
        } else {
            &item.related_id
        };

        let metadata = format!(
            "tenant_id={}\nasset_id={}\nevidence_id={}\nsource={}\ntype={}\nrelated_id={}\nhash={}\nstorage_uri={}\ncaptured_at={}\n",
            self.tenant_id,
            self.asset_id,
            item.evidence_id,
            item.source,
            item.evidence_type,
            related_id,
            item.sha256_hex,
            storage_uri,
            item.captured_at,
        );
        std::fs::write(package_dir.join("metadata.txt"), metadata)?;

        let payload = json!({
            "evidence_id": item.evidence_id,
            "tenant_id": self.tenant_id,
            "asset_id": self.asset_id,
            "source": item.source,
            "type": item.evidence_type,
            "related_id": related_id,
            "hash": item.sha256_hex,
            "storage_uri": storage_uri,
            "captured_at": item.captured_at.to_string(),
        });
        self.spool.enqueue(
            UplinkKind::Evidence,
            &item.evidence_id,
            EVIDENCE_TARGET_PATH,
            payload.to_string(),
        )?;

        info!(evidence_id, package = %package_dir.display(), "evidence package queued");
        Ok(package_dir)
    }

    /// Snapshot of all items.
    #[must_use]
    pub fn list(&self) -> Vec<EvidenceItem> {
        self.lock().values().cloned().collect()
    }

    /// Look up a single item.
    #[must_use]
    pub fn get(&self, evidence_id: &str) -> Option<EvidenceItem> {
        self.lock().get(evidence_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EvidenceItem>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::uplink::UplinkEnvelope;

    const HELLO_SHA256: &str =
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    struct Fixture {
        _root: TempDir,
        broker: EvidenceBroker,
        spool_dir: PathBuf,
        artefact: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let spool_dir = root.path().join("uplink_queue");
        let artefact = root.path().join("tmp.bin");
        let mut file = std::fs::File::create(&artefact).unwrap();
        file.write_all(b"hello").unwrap();

        let broker = EvidenceBroker::new(
            "tenant-1",
            "asset-1",
            root.path().join("evidence_packages"),
            SpoolWriter::new(&spool_dir),
        );
        Fixture {
            _root: root,
            broker,
            spool_dir,
            artefact,
        }
    }

    #[test]
    fn test_add_seal_fixes_known_hash() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact))
            .unwrap();

        let hash = fx.broker.seal("e1").unwrap();
        assert_eq!(hash, HELLO_SHA256);

        let item = fx.broker.get("e1").unwrap();
        assert!(item.sealed);
        assert_eq!(item.sha256_hex, HELLO_SHA256);
    }

    #[test]
    fn test_seal_is_idempotent() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact))
            .unwrap();
        let first = fx.broker.seal("e1").unwrap();

        // Mutating the artefact after sealing must not change the hash.
        std::fs::write(&fx.artefact, b"tampered").unwrap();
        let second = fx.broker.seal("e1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_seal_missing_artefact_leaves_unsealed() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new(
                "e1",
                "defence",
                "finding",
                "det-1",
                fx.artefact.with_extension("gone"),
            ))
            .unwrap();

        let result = fx.broker.seal("e1");
        assert!(matches!(result, Err(EvidenceError::MissingArtifact { .. })));
        assert!(!fx.broker.get("e1").unwrap().sealed);
    }

    #[test]
    fn test_seal_unknown_id() {
        let fx = fixture();
        assert!(matches!(
            fx.broker.seal("missing"),
            Err(EvidenceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_upload_requires_seal() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact))
            .unwrap();
        assert!(matches!(
            fx.broker.upload("e1"),
            Err(EvidenceError::NotSealed { .. })
        ));
    }

    #[test]
    fn test_upload_packages_and_spools() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact))
            .unwrap();
        fx.broker.seal("e1").unwrap();

        let package_dir = fx.broker.upload("e1").unwrap();

        // Artefact copy and metadata are in place.
        assert!(package_dir.join("tmp.bin").exists());
        let metadata = std::fs::read_to_string(package_dir.join("metadata.txt")).unwrap();
        assert!(metadata.contains(&format!("hash={HELLO_SHA256}")));
        assert!(metadata.contains("tenant_id=tenant-1"));
        assert!(metadata.contains("asset_id=asset-1"));
        assert!(metadata.contains("related_id=det-1"));
        assert!(metadata.contains("storage_uri=file://"));

        // Exactly one envelope referencing the package.
        let envelopes: Vec<PathBuf> = std::fs::read_dir(&fx.spool_dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        assert_eq!(envelopes.len(), 1);
        let envelope: UplinkEnvelope =
            serde_json::from_slice(&std::fs::read(&envelopes[0]).unwrap()).unwrap();
        assert_eq!(envelope.target_path, "rmm/evidence");
        let payload: serde_json::Value =
            serde_json::from_str(&envelope.payload_json).unwrap();
        assert_eq!(payload["hash"], HELLO_SHA256);
        assert_eq!(payload["evidence_id"], "e1");
    }

    #[test]
    fn test_add_normalises_sealed_flag() {
        let fx = fixture();
        let mut item = EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact);
        item.sealed = true;
        item.sha256_hex = "bogus".to_string();
        fx.broker.add(item).unwrap();

        let stored = fx.broker.get("e1").unwrap();
        assert!(!stored.sealed);
        assert!(stored.sha256_hex.is_empty());
    }

    #[test]
    fn test_add_never_replaces_sealed_item() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "det-1", &fx.artefact))
            .unwrap();
        fx.broker.seal("e1").unwrap();

        let result =
            fx.broker.add(EvidenceItem::new("e1", "other", "other", "x", &fx.artefact));
        assert!(matches!(result, Err(EvidenceError::AlreadySealed { .. })));
    }

    #[test]
    fn test_list_snapshot() {
        let fx = fixture();
        fx.broker
            .add(EvidenceItem::new("e1", "defence", "finding", "a", &fx.artefact))
            .unwrap();
        fx.broker
            .add(EvidenceItem::new("e2", "patch", "result", "b", &fx.artefact))
            .unwrap();
        let mut ids: Vec<String> =
            fx.broker.list().into_iter().map(|item| item.evidence_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["e1".to_string(), "e2".to_string()]);
    }
}
