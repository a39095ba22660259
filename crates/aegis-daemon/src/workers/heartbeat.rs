//! Heartbeat worker: liveness reporting, stall watchdog, and startup
//! inventory.

use std::time::Duration;

use aegis_core::config::Config;
use aegis_core::heartbeat::{HeartbeatLoop, Watchdog};
use aegis_core::inventory::{
    GroupsInventory, HardwareInventory, InventoryProvider, OsInventory, RmmTelemetryClient,
    SoftwareInventory, UsersInventory,
};
use aegis_core::transport::SignedTransport;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Minimal host-facts provider. Full collection (package lists, local
/// accounts) is platform glue behind [`InventoryProvider`]; this default
/// reports what the process can see without privileges.
struct BasicInventoryProvider;

impl InventoryProvider for BasicInventoryProvider {
    fn hardware(&self) -> HardwareInventory {
        HardwareInventory {
            cpu_cores: std::thread::available_parallelism()
                .ok()
                .map(|count| u32::try_from(count.get()).unwrap_or(u32::MAX)),
            ..HardwareInventory::default()
        }
    }

    fn os(&self) -> OsInventory {
        OsInventory {
            os_name: std::env::consts::OS.to_string(),
            os_version: std::fs::read_to_string("/proc/sys/kernel/osrelease")
                .map(|release| release.trim().to_string())
                .unwrap_or_default(),
            kernel_version: None,
            architecture: Some(std::env::consts::ARCH.to_string()),
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

/// Run the heartbeat worker until cancelled.
pub async fn run(transport: SignedTransport, config: &Config, cancel: CancellationToken) {
    let watchdog = Watchdog::new(Duration::from_secs(config.watchdog_timeout_seconds));
    tokio::spawn(watchdog.clone().run(cancel.clone()));

    // One inventory push at startup; refresh rides on later reloads.
    let telemetry = RmmTelemetryClient::new(transport.clone());
    if let Err(error) = telemetry.send_full_inventory(&BasicInventoryProvider).await {
        warn!(%error, "startup inventory push failed");
    }

    HeartbeatLoop::new(transport, watchdog).run(cancel).await;
}
