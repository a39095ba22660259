//! Durable uplink queue.
//!
//! Producers never talk to ingestion endpoints directly; they enqueue
//! JSON envelopes into a spool directory and an out-of-band shipper
//! drains it. The spool is the process boundary: writes are atomic
//! (write to a temporary name, then rename), so the shipper only ever
//! observes complete envelopes, and a crash on either side leaves the
//! queue consistent without locking.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::transport::{SignedTransport, TransportError, expect_success};

/// Default maximum envelopes shipped per cycle.
pub const DEFAULT_MAX_ITEMS_PER_CYCLE: usize = 64;

/// Uplink failure modes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UplinkError {
    /// The spool directory or an envelope could not be written.
    #[error("uplink queue failure: {0}")]
    QueueWrite(#[from] std::io::Error),

    /// An envelope on disk is not valid JSON.
    #[error("invalid envelope {path}: {message}")]
    InvalidEnvelope {
        /// Offending file.
        path: PathBuf,
        /// Parse failure description.
        message: String,
    },

    /// The ingestion endpoint could not be reached or refused the
    /// payload after all retries.
    #[error("delivery failed: {0}")]
    Delivery(#[from] TransportError),
}

/// Envelope kinds, mapped to ingestion endpoints by `target_path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkKind {
    /// Evidence package reference.
    Evidence,
    /// RMM telemetry record.
    Rmm,
    /// Patch-job result for the PSA sidechannel.
    PatchResult,
}

impl UplinkKind {
    /// Filename prefix for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Evidence => "evidence",
            Self::Rmm => "rmm",
            Self::PatchResult => "patch_result",
        }
    }
}

/// One spool entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkEnvelope {
    /// Envelope kind.
    pub kind: UplinkKind,
    /// Ingestion path the payload is POSTed to, relative to the
    /// ingestion base URL.
    #[serde(rename = "path")]
    pub target_path: String,
    /// The payload, as a JSON document encoded into a string.
    pub payload_json: String,
}

/// Writes envelopes into the spool directory.
#[derive(Debug, Clone)]
pub struct SpoolWriter {
    dir: PathBuf,
}

impl SpoolWriter {
    /// Create a writer for the given spool directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The spool directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Enqueue an envelope. Creates the spool directory if missing; the
    /// write is atomic via rename. Returns the envelope path.
    ///
    /// # Errors
    ///
    /// [`UplinkError::QueueWrite`] when the directory or file cannot be
    /// written (disk full, permissions).
    pub fn enqueue(
        &self,
        kind: UplinkKind,
        category: &str,
        target_path: &str,
        payload_json: String,
    ) -> Result<PathBuf, UplinkError> {
        std::fs::create_dir_all(&self.dir)?;

        let envelope = UplinkEnvelope {
            kind,
            target_path: target_path.to_string(),
            payload_json,
        };
        let encoded = serde_json::to_vec(&envelope)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;

        let epoch = chrono::Utc::now().timestamp();
        let category = crate::ipc::sanitise_name(category);
        let final_path = self.unique_path(kind.as_str(), &category, epoch);
        let tmp_path = final_path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &encoded)?;
        std::fs::rename(&tmp_path, &final_path)?;

        debug!(path = %final_path.display(), "uplink envelope queued");
        Ok(final_path)
    }

    /// Pick `<kind>_<category>_<epoch>.json`, suffixing a counter when
    /// several envelopes land in the same second.
    fn unique_path(&self, kind: &str, category: &str, epoch: i64) -> PathBuf {
        let base = self.dir.join(format!("{kind}_{category}_{epoch}.json"));
        if !base.exists() {
            return base;
        }
        let mut counter = 1u32;
        loop {
            let candidate = self
                .dir
                .join(format!("{kind}_{category}_{epoch}_{counter}.json"));
            if !candidate.exists() {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// Summary of one shipper cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShipperSummary {
    /// Envelopes examined this cycle.
    pub processed: usize,
    /// Envelopes delivered and removed.
    pub succeeded: usize,
    /// Envelopes left in place for retry.
    pub failed: usize,
}

/// Drains the spool directory to the ingestion endpoints.
pub struct Shipper {
    transport: SignedTransport,
    dir: PathBuf,
    retry: RetryPolicy,
    max_items_per_cycle: usize,
}

impl Shipper {
    /// Create a shipper for the given spool directory.
    #[must_use]
    pub fn new(transport: SignedTransport, dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            dir: dir.into(),
            retry: RetryPolicy::default(),
            max_items_per_cycle: DEFAULT_MAX_ITEMS_PER_CYCLE,
        }
    }

    /// Override the per-cycle item cap.
    #[must_use]
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items_per_cycle = max_items;
        self
    }

    /// Process one cycle: scan in filename order, deliver, delete on
    /// success. Failures leave the envelope in place for the next cycle.
    pub async fn run_once(&self) -> ShipperSummary {
        let mut summary = ShipperSummary::default();

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension().and_then(|ext| ext.to_str()) == Some("json")
                })
                .collect(),
            Err(error) => {
                debug!(%error, dir = %self.dir.display(), "spool directory not readable");
                return summary;
            },
        };
        paths.sort();

        for path in paths.into_iter().take(self.max_items_per_cycle) {
            summary.processed += 1;
            match self.ship_one(&path).await {
                Ok(()) => {
                    summary.succeeded += 1;
                    if let Err(error) = std::fs::remove_file(&path) {
                        warn!(%error, path = %path.display(), "failed to remove shipped envelope");
                    }
                },
                Err(error) => {
                    summary.failed += 1;
                    warn!(%error, path = %path.display(), "envelope delivery failed");
                },
            }
        }

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "uplink cycle complete"
            );
        }
        summary
    }

    /// Run until cancelled, one cycle per `interval`.
    pub async fn run(
        &self,
        interval: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        info!(dir = %self.dir.display(), interval_s = interval.as_secs(), "uplink shipper started");
        loop {
            self.run_once().await;
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("uplink shipper stopping");
                    return;
                },
                () = tokio::time::sleep(interval) => {},
            }
        }
    }

    async fn ship_one(&self, path: &Path) -> Result<(), UplinkError> {
        let raw = std::fs::read(path)?;
        let envelope: UplinkEnvelope =
            serde_json::from_slice(&raw).map_err(|error| UplinkError::InvalidEnvelope {
                path: path.to_path_buf(),
                message: error.to_string(),
            })?;

        self.retry
            .run(|| async {
                let response = self
                    .transport
                    .post_ingestion(&envelope.target_path, envelope.payload_json.as_bytes())
                    .await?;
                expect_success(response).map(|_| ())
            })
            .await
            .map_err(UplinkError::from)
    }
}
