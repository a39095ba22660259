//! Signed heartbeat loop and stall watchdog.
//!
//! The heartbeat worker signs and POSTs a liveness record on a cadence.
//! Consecutive failures stretch the cadence with the doubling schedule in
//! [`crate::retry::heartbeat_interval_seconds`]; a success snaps it back
//! to the base interval and feeds the watchdog.
//!
//! The watchdog is a background task holding only the last-beat
//! timestamp. Every `timeout / 2` it checks for a stall and emits a
//! single-line alert — it never kills anything; restarts are the
//! supervisor's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::retry::heartbeat_interval_seconds;
use crate::transport::{SignedTransport, expect_success};

/// Heartbeat endpoint path.
const HELLO_PATH: &str = "mtls/hello";

/// One liveness record. Field order is the canonical signing order; the
/// serialised JSON is the exact byte sequence the signature covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Tenant scope.
    pub tenant_id: String,
    /// Asset scope.
    pub asset_id: String,
    /// Identity scope.
    pub identity_id: String,
    /// Unique id for this attempt, 128-bit hex.
    pub event_id: String,
    /// Agent build version.
    pub agent_version: String,
    /// Host name.
    pub hostname: String,
    /// Operating system name.
    pub os: String,
    /// Seconds since the agent process started.
    pub uptime_seconds: u64,
    /// Trust state label.
    pub trust_state: String,
    /// Send time, ISO-8601 UTC.
    pub sent_at: String,
}

/// Build a heartbeat payload for one attempt.
#[must_use]
pub fn build_payload(config: &Config, event_id: &str, uptime_seconds: u64) -> HeartbeatPayload {
    HeartbeatPayload {
        tenant_id: config.tenant_id.clone(),
        asset_id: config.asset_id.clone(),
        identity_id: config.identity_id.clone(),
        event_id: event_id.to_string(),
        agent_version: config.agent_version.clone(),
        hostname: config.hostname.clone(),
        os: config.os_name.clone(),
        uptime_seconds,
        trust_state: config.trust_state.clone(),
        sent_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }
}

/// Generate a fresh heartbeat event id (128-bit hex).
#[must_use]
pub fn generate_event_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Tracks process uptime from construction.
#[derive(Debug, Clone, Copy)]
pub struct UptimeTracker {
    started: Instant,
}

impl Default for UptimeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UptimeTracker {
    /// Start tracking now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Whole seconds since tracking started.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Heartbeat stall monitor.
///
/// Clone handles share the last-beat timestamp; one clone runs
/// [`Watchdog::run`] in the background while the heartbeat loop calls
/// [`Watchdog::notify`] on every success.
#[derive(Debug, Clone)]
pub struct Watchdog {
    last_beat_epoch: Arc<AtomicI64>,
    timeout: Duration,
}

impl Watchdog {
    /// Create a watchdog with the given stall threshold.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_beat_epoch: Arc::new(AtomicI64::new(chrono::Utc::now().timestamp())),
            timeout,
        }
    }

    /// Record a successful heartbeat.
    pub fn notify(&self) {
        self.last_beat_epoch
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Whether the last beat is older than the timeout at `now_epoch`.
    #[must_use]
    pub fn is_stalled(&self, now_epoch: i64) -> bool {
        let last = self.last_beat_epoch.load(Ordering::Relaxed);
        #[allow(clippy::cast_possible_wrap)] // timeouts are far below i64::MAX seconds
        let timeout = self.timeout.as_secs() as i64;
        now_epoch - last > timeout
    }

    /// Check every `timeout / 2` until cancelled, alerting on stalls.
    pub async fn run(self, cancel: CancellationToken) {
        let check_interval = self.timeout / 2;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(check_interval) => {},
            }
            if self.is_stalled(chrono::Utc::now().timestamp()) {
                error!(
                    timeout_s = self.timeout.as_secs(),
                    "heartbeat stalled beyond watchdog timeout"
                );
            }
        }
    }
}

/// The heartbeat sender loop.
pub struct HeartbeatLoop {
    transport: SignedTransport,
    watchdog: Watchdog,
    uptime: UptimeTracker,
    failure_count: i64,
}

impl HeartbeatLoop {
    /// Create a loop reporting successes to `watchdog`.
    #[must_use]
    pub fn new(transport: SignedTransport, watchdog: Watchdog) -> Self {
        Self {
            transport,
            watchdog,
            uptime: UptimeTracker::new(),
            failure_count: 0,
        }
    }

    /// Send heartbeats until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let interval = self.run_cycle().await;
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(interval.unsigned_abs())) => {},
            }
        }
    }

    /// One send attempt; returns the seconds to sleep before the next.
    pub async fn run_cycle(&mut self) -> i64 {
        let config = self.transport.config().clone();
        let payload = build_payload(&config, &generate_event_id(), self.uptime.uptime_seconds());

        match self.send(&payload).await {
            Ok(()) => {
                self.failure_count = 0;
                self.watchdog.notify();
                debug!(event_id = %payload.event_id, "heartbeat delivered");
            },
            Err(error) => {
                self.failure_count = self.failure_count.saturating_add(1);
                warn!(failures = self.failure_count, %error, "heartbeat failed");
            },
        }

        heartbeat_interval_seconds(
            config.heartbeat_interval_seconds,
            self.failure_count,
            config.max_heartbeat_interval_seconds,
        )
    }

    async fn send(&self, payload: &HeartbeatPayload) -> Result<(), crate::transport::TransportError> {
        let body = serde_json::to_vec(payload).unwrap_or_default();
        let response = self.transport.post_legacy_signed(HELLO_PATH, &body).await?;
        expect_success(response).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{MockExchange, test_config};
    use crate::transport::{HttpResponse, TransportError};

    #[test]
    fn test_payload_shape() {
        let config = test_config();
        let payload = build_payload(&config, "a".repeat(32).as_str(), 17);
        let encoded = serde_json::to_string(&payload).unwrap();

        // Canonical field order is preserved by serialisation.
        let tenant_pos = encoded.find("tenant_id").unwrap();
        let sent_pos = encoded.find("sent_at").unwrap();
        assert!(tenant_pos < sent_pos);
        assert!(encoded.contains(r#""uptime_seconds":17"#));
        assert!(encoded.contains(r#""trust_state":"bootstrap""#));
        assert!(payload.sent_at.ends_with('Z'));
    }

    #[test]
    fn test_event_id_is_128_bit_hex() {
        let id = generate_event_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_event_id());
    }

    #[test]
    fn test_watchdog_stall_detection() {
        let watchdog = Watchdog::new(Duration::from_secs(120));
        let now = chrono::Utc::now().timestamp();

        watchdog.notify();
        assert!(!watchdog.is_stalled(now));
        assert!(!watchdog.is_stalled(now + 120));
        assert!(watchdog.is_stalled(now + 121));

        // A fresh beat clears the stall.
        watchdog.notify();
        assert!(!watchdog.is_stalled(chrono::Utc::now().timestamp() + 60));
    }

    #[tokio::test]
    async fn test_cycle_success_resets_failures() {
        let exchange = std::sync::Arc::new(MockExchange::new());
        let transport = SignedTransport::new(test_config(), exchange.clone());
        let watchdog = Watchdog::new(Duration::from_secs(120));
        let mut heartbeat = HeartbeatLoop::new(transport, watchdog.clone());
        heartbeat.failure_count = 3;

        let interval = heartbeat.run_cycle().await;

        assert_eq!(heartbeat.failure_count, 0);
        assert_eq!(interval, 45);
        let request = &exchange.recorded()[0];
        assert!(request.url.ends_with("/mtls/hello"));
    }

    #[tokio::test]
    async fn test_cycle_failures_back_off() {
        let exchange = std::sync::Arc::new(MockExchange::new());
        for _ in 0..4 {
            exchange.push_response(Err(TransportError::TransportUnavailable(
                "connection refused".to_string(),
            )));
        }
        let transport = SignedTransport::new(test_config(), exchange);
        let mut heartbeat =
            HeartbeatLoop::new(transport, Watchdog::new(Duration::from_secs(120)));

        // base=45, cap=300: failures 1..4 give 90, 180, 300, 300.
        assert_eq!(heartbeat.run_cycle().await, 90);
        assert_eq!(heartbeat.run_cycle().await, 180);
        assert_eq!(heartbeat.run_cycle().await, 300);
        assert_eq!(heartbeat.run_cycle().await, 300);
    }

    #[tokio::test]
    async fn test_cycle_non_2xx_is_failure() {
        let exchange = std::sync::Arc::new(MockExchange::new());
        exchange.push_response(Ok(HttpResponse {
            status: 502,
            body: Vec::new(),
        }));
        let transport = SignedTransport::new(test_config(), exchange);
        let mut heartbeat =
            HeartbeatLoop::new(transport, Watchdog::new(Duration::from_secs(120)));

        heartbeat.run_cycle().await;
        assert_eq!(heartbeat.failure_count, 1);
    }
}
