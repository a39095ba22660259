//! RMM telemetry and inventory reporting.
//!
//! Typed records posted to the control plane's telemetry endpoints
//! (`/mtls/rmm/<kind>`) and inventory snapshot endpoints
//! (`/mtls/inventory/<section>`). Collection of the underlying facts is
//! the platform boundary's job; this module owns the record shapes, the
//! scoping envelope (tenant, asset, correlation id), and delivery.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::transport::{SignedTransport, TransportError, expect_success, generate_nonce};

/// Telemetry record kinds and their endpoint paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    /// Configuration profile application records.
    ConfigProfiles,
    /// Known-patch catalog snapshots.
    PatchCatalog,
    /// Patch job progress records.
    PatchJobs,
    /// Script execution results.
    ScriptResults,
    /// Remote session audit records.
    RemoteSessions,
    /// Evidence references.
    Evidence,
    /// Device inventory summaries.
    DeviceInventory,
}

impl TelemetryKind {
    /// Endpoint path segment under `/mtls/rmm/`.
    #[must_use]
    pub const fn as_path(self) -> &'static str {
        match self {
            Self::ConfigProfiles => "config-profiles",
            Self::PatchCatalog => "patch-catalog",
            Self::PatchJobs => "patch-jobs",
            Self::ScriptResults => "script-results",
            Self::RemoteSessions => "remote-sessions",
            Self::Evidence => "evidence",
            Self::DeviceInventory => "device-inventory",
        }
    }
}

/// Inventory snapshot sections and their endpoint paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventorySection {
    /// Hardware facts.
    Hardware,
    /// Operating system facts.
    Os,
    /// Installed software list.
    Software,
    /// Local user accounts.
    Users,
    /// Local groups.
    Groups,
}

impl InventorySection {
    /// Endpoint path segment under `/mtls/inventory/`.
    #[must_use]
    pub const fn as_path(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Os => "os",
            Self::Software => "software",
            Self::Users => "users",
            Self::Groups => "groups",
        }
    }
}

/// A configuration profile application record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmConfigProfile {
    /// Profile identifier.
    pub profile_id: String,
    /// Human-readable name.
    pub name: String,
    /// Profile version label.
    pub version: String,
    /// Application status (`applied`, `failed`, ...).
    pub status: String,
    /// Profile content checksum.
    pub checksum: String,
    /// When the profile was applied, ISO-8601 UTC.
    pub applied_at: String,
}

/// One entry of the known-patch catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmPatchCatalogItem {
    /// Vendor-scoped patch identifier.
    pub patch_id: String,
    /// Patch title.
    pub title: String,
    /// Issuing vendor.
    pub vendor: String,
    /// Severity label.
    pub severity: String,
    /// Knowledge-base reference.
    pub kb: String,
    /// Release date, ISO-8601.
    pub released_at: String,
}

/// A catalog snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmPatchCatalog {
    /// Catalog entries.
    pub items: Vec<RmmPatchCatalogItem>,
}

/// Patch-job progress telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmPatchJob {
    /// Job identifier.
    pub job_id: String,
    /// Patch being applied.
    pub patch_id: String,
    /// Job status.
    pub status: String,
    /// Job result label.
    pub result: String,
    /// Scheduled instant, ISO-8601 UTC.
    pub scheduled_at: String,
    /// Application instant, ISO-8601 UTC.
    pub applied_at: String,
}

/// Script execution result telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmScriptResult {
    /// Script job identifier.
    pub job_id: String,
    /// Interpreter kind.
    pub script_type: String,
    /// Process exit code.
    pub exit_code: i32,
    /// Truncated stdout capture.
    pub stdout_summary: String,
    /// Truncated stderr capture.
    pub stderr_summary: String,
    /// Execution start, ISO-8601 UTC.
    pub started_at: String,
    /// Execution end, ISO-8601 UTC.
    pub completed_at: String,
}

/// Remote session audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmRemoteSession {
    /// Session identifier.
    pub session_id: String,
    /// Operator identity.
    pub operator_id: String,
    /// Session status.
    pub status: String,
    /// Session start, ISO-8601 UTC.
    pub started_at: String,
    /// Session end, ISO-8601 UTC.
    pub ended_at: String,
}

/// Evidence reference telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmmEvidenceRecord {
    /// Evidence identifier.
    pub evidence_id: String,
    /// Evidence type label.
    pub evidence_type: String,
    /// Related object identifier.
    pub related_id: String,
    /// Sealed content hash.
    pub hash: String,
    /// Package location.
    pub storage_uri: String,
}

/// Hardware inventory facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareInventory {
    /// System manufacturer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// System model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Chassis serial number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// CPU model string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    /// Logical core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// Physical memory in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Primary storage in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_gb: Option<u64>,
}

/// Operating system inventory facts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsInventory {
    /// OS name.
    pub os_name: String,
    /// OS version string.
    pub os_version: String,
    /// Kernel version, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    /// CPU architecture.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// One installed software entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareItem {
    /// Package or product name.
    pub name: String,
    /// Vendor, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    /// Version, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Install date, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_date: Option<String>,
    /// Discovery source (package manager, registry, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Installed software snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftwareInventory {
    /// Discovered entries.
    pub items: Vec<SoftwareItem>,
}

/// A local user account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalUser {
    /// Account name.
    pub username: String,
    /// Display name, when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Numeric identifier, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Whether the account has administrative rights.
    pub is_admin: bool,
}

/// Local users snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsersInventory {
    /// Discovered accounts.
    pub items: Vec<LocalUser>,
}

/// A local group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalGroup {
    /// Group name.
    pub name: String,
    /// Numeric identifier, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    /// Member account names.
    pub members: Vec<String>,
}

/// Local groups snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupsInventory {
    /// Discovered groups.
    pub items: Vec<LocalGroup>,
}

/// Boundary for platform-specific inventory collection.
pub trait InventoryProvider: Send + Sync {
    /// Collect hardware facts.
    fn hardware(&self) -> HardwareInventory;
    /// Collect OS facts.
    fn os(&self) -> OsInventory;
    /// Collect installed software.
    fn software(&self) -> SoftwareInventory;
    /// Collect local users.
    fn users(&self) -> UsersInventory;
    /// Collect local groups.
    fn groups(&self) -> GroupsInventory;
}

/// Telemetry and inventory sender.
pub struct RmmTelemetryClient {
    transport: SignedTransport,
}

impl RmmTelemetryClient {
    /// Create a client over the given transport.
    #[must_use]
    pub fn new(transport: SignedTransport) -> Self {
        Self { transport }
    }

    /// Post one telemetry record. Returns the correlation id assigned to
    /// the record.
    ///
    /// # Errors
    ///
    /// Transport failures and non-2xx responses.
    pub async fn send<T: Serialize>(
        &self,
        kind: TelemetryKind,
        record: &T,
    ) -> Result<String, TransportError> {
        let correlation_id = generate_nonce();
        let body = self.envelope(record, &correlation_id);
        let path = format!("mtls/rmm/{}", kind.as_path());
        let response = self
            .transport
            .post_signed(&path, body.to_string().as_bytes())
            .await?;
        expect_success(response)?;
        debug!(kind = kind.as_path(), correlation_id = %correlation_id, "telemetry delivered");
        Ok(correlation_id)
    }

    /// Post one inventory snapshot section.
    ///
    /// # Errors
    ///
    /// Transport failures and non-2xx responses.
    pub async fn send_inventory<T: Serialize>(
        &self,
        section: InventorySection,
        snapshot: &T,
    ) -> Result<(), TransportError> {
        let correlation_id = generate_nonce();
        let body = self.envelope(snapshot, &correlation_id);
        let path = format!("mtls/inventory/{}", section.as_path());
        let response = self
            .transport
            .post_signed(&path, body.to_string().as_bytes())
            .await?;
        expect_success(response).map(|_| ())
    }

    /// Push every inventory section from a provider.
    ///
    /// # Errors
    ///
    /// The first transport failure; later sections are not attempted.
    pub async fn send_full_inventory(
        &self,
        provider: &dyn InventoryProvider,
    ) -> Result<(), TransportError> {
        self.send_inventory(InventorySection::Hardware, &provider.hardware()).await?;
        self.send_inventory(InventorySection::Os, &provider.os()).await?;
        self.send_inventory(InventorySection::Software, &provider.software()).await?;
        self.send_inventory(InventorySection::Users, &provider.users()).await?;
        self.send_inventory(InventorySection::Groups, &provider.groups()).await?;
        Ok(())
    }

    /// Wrap a record with the scoping envelope.
    fn envelope<T: Serialize>(&self, record: &T, correlation_id: &str) -> Value {
        let config = self.transport.config();
        let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
        if !value.is_object() {
            value = serde_json::json!({ "record": value });
        }
        if let Value::Object(map) = &mut value {
            map.insert("tenant_id".to_string(), Value::String(config.tenant_id.clone()));
            map.insert("asset_id".to_string(), Value::String(config.asset_id.clone()));
            map.insert(
                "correlation_id".to_string(),
                Value::String(correlation_id.to_string()),
            );
            map.insert(
                "sent_at".to_string(),
                Value::String(
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                ),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::tests::{MockExchange, test_config};

    fn client_with(exchange: Arc<MockExchange>) -> RmmTelemetryClient {
        RmmTelemetryClient::new(SignedTransport::new(test_config(), exchange))
    }

    #[tokio::test]
    async fn test_send_patch_job_record() {
        let exchange = Arc::new(MockExchange::new());
        let client = client_with(exchange.clone());

        let record = RmmPatchJob {
            job_id: "j1".to_string(),
            patch_id: "p1".to_string(),
            status: "completed".to_string(),
            result: "installed".to_string(),
            scheduled_at: "2026-08-01T12:00:00Z".to_string(),
            applied_at: "2026-08-01T12:01:30Z".to_string(),
        };
        let correlation_id = client.send(TelemetryKind::PatchJobs, &record).await.unwrap();
        assert_eq!(correlation_id.len(), 32);

        let request = &exchange.recorded()[0];
        assert!(request.url.ends_with("/mtls/rmm/patch-jobs"));
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["tenant_id"], "tenant-1");
        assert_eq!(body["asset_id"], "asset-1");
        assert_eq!(body["correlation_id"], correlation_id.as_str());
        assert_eq!(body["job_id"], "j1");
        assert_eq!(body["result"], "installed");
    }

    #[tokio::test]
    async fn test_send_catalog_snapshot() {
        let exchange = Arc::new(MockExchange::new());
        let client = client_with(exchange.clone());

        let catalog = RmmPatchCatalog {
            items: vec![RmmPatchCatalogItem {
                patch_id: "p1".to_string(),
                title: "Security update".to_string(),
                vendor: "Vendor".to_string(),
                severity: "critical".to_string(),
                kb: "KB5010001".to_string(),
                released_at: "2026-07-01".to_string(),
            }],
        };
        client.send(TelemetryKind::PatchCatalog, &catalog).await.unwrap();

        let request = &exchange.recorded()[0];
        assert!(request.url.ends_with("/mtls/rmm/patch-catalog"));
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["items"][0]["patch_id"], "p1");
    }

    #[tokio::test]
    async fn test_send_inventory_sections() {
        struct StaticProvider;

        impl InventoryProvider for StaticProvider {
            fn hardware(&self) -> HardwareInventory {
                HardwareInventory {
                    cpu_cores: Some(8),
                    ..HardwareInventory::default()
                }
            }
            fn os(&self) -> OsInventory {
                OsInventory {
                    os_name: "linux".to_string(),
                    os_version: "6.8".to_string(),
                    ..OsInventory::default()
                }
            }
            fn software(&self) -> SoftwareInventory {
                SoftwareInventory::default()
            }
            fn users(&self) -> UsersInventory {
                UsersInventory::default()
            }
            fn groups(&self) -> GroupsInventory {
                GroupsInventory::default()
            }
        }

        let exchange = Arc::new(MockExchange::new());
        let client = client_with(exchange.clone());
        client.send_full_inventory(&StaticProvider).await.unwrap();

        let urls: Vec<String> = exchange
            .recorded()
            .iter()
            .map(|request| request.url.clone())
            .collect();
        assert_eq!(urls.len(), 5);
        for section in ["hardware", "os", "software", "users", "groups"] {
            assert!(
                urls.iter().any(|url| url.ends_with(&format!("/mtls/inventory/{section}"))),
                "missing {section}"
            );
        }

        let os_request = exchange
            .recorded()
            .into_iter()
            .find(|request| request.url.ends_with("/mtls/inventory/os"))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&os_request.body).unwrap();
        assert_eq!(body["os_name"], "linux");
        assert_eq!(body["asset_id"], "asset-1");
    }

    #[test]
    fn test_kind_paths() {
        assert_eq!(TelemetryKind::ConfigProfiles.as_path(), "config-profiles");
        assert_eq!(TelemetryKind::DeviceInventory.as_path(), "device-inventory");
        assert_eq!(InventorySection::Users.as_path(), "users");
    }
}
