//! Shipper worker: drains the uplink spool to the ingestion endpoints.

use std::time::Duration;

use aegis_core::config::Config;
use aegis_core::transport::SignedTransport;
use aegis_core::uplink::Shipper;
use tokio_util::sync::CancellationToken;

/// Pause between spool-draining cycles.
const SHIP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the shipper worker until cancelled.
pub async fn run(transport: SignedTransport, config: &Config, cancel: CancellationToken) {
    Shipper::new(transport, config.uplink_queue_dir.clone())
        .run(SHIP_INTERVAL, cancel)
        .await;
}
