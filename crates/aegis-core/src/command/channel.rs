//! Poll / acknowledge / report operations against the control plane.

use chrono::SecondsFormat;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    PatchJobAck, PatchJobCommand, PatchJobResult, RejectReason, validate_command,
};
use crate::command::{AckStatus, NonceCache};
use crate::transport::{SignedTransport, TransportError, expect_success};

/// Relative path of the next-job poll endpoint.
const POLL_PATH: &str = "mtls/rmm/patch-jobs/next";
/// Relative path of the acknowledgement endpoint.
const ACK_PATH: &str = "mtls/rmm/patch-jobs/ack";
/// Relative path of the result endpoint.
const RESULT_PATH: &str = "mtls/rmm/patch-jobs/result";

/// The signed command channel.
///
/// Stateless above its nonce cache: every verified command is handed to
/// the caller and forgotten. Validation failures are acknowledged as
/// `rejected` here so the control plane learns why a command was dropped
/// even though no job ever starts.
pub struct CommandChannel {
    transport: SignedTransport,
    nonces: NonceCache,
}

impl CommandChannel {
    /// Create a channel over the given transport.
    #[must_use]
    pub fn new(transport: SignedTransport) -> Self {
        Self {
            transport,
            nonces: NonceCache::default(),
        }
    }

    /// The transport this channel reports through.
    #[must_use]
    pub fn transport(&self) -> &SignedTransport {
        &self.transport
    }

    /// Poll for the next patch job.
    ///
    /// Returns `Ok(None)` when no job is pending (HTTP 204) and when a
    /// delivered command fails validation — the rejection is acknowledged
    /// inline and the command dropped.
    ///
    /// # Errors
    ///
    /// Transport-level failures only; validation failures are not errors
    /// to the caller.
    pub async fn poll_next_patch_job(
        &self,
    ) -> Result<Option<PatchJobCommand>, TransportError> {
        let config = self.transport.config().clone();
        let path = format!("{POLL_PATH}?asset_id={}", config.asset_id);
        let response = self.transport.get_signed(&path).await?;

        if response.status == 204 {
            debug!("no patch job pending");
            return Ok(None);
        }
        let response = expect_success(response)?;

        let command: PatchJobCommand = match serde_json::from_slice(&response.body) {
            Ok(command) => command,
            Err(error) => {
                warn!(%error, "malformed patch-job command");
                self.reject_unparsed(&response.body).await;
                return Ok(None);
            },
        };

        if command.job_id.is_empty() {
            warn!("patch-job command without job_id");
            return Ok(None);
        }

        let now_epoch = chrono::Utc::now().timestamp();
        if let Err(reason) = validate_command(&config, &self.nonces, &command, now_epoch) {
            warn!(job_id = %command.job_id, %reason, "patch-job command rejected");
            self.acknowledge_rejection(&command.job_id, reason).await;
            return Ok(None);
        }

        debug!(job_id = %command.job_id, patches = command.patches.len(), "patch job verified");
        Ok(Some(command))
    }

    /// Send one acknowledgement.
    ///
    /// # Errors
    ///
    /// Transport failures and non-2xx responses.
    pub async fn acknowledge(&self, ack: &PatchJobAck) -> Result<(), TransportError> {
        let config = self.transport.config();
        let body = json!({
            "tenant_id": config.tenant_id,
            "asset_id": config.asset_id,
            "job_id": ack.job_id,
            "status": ack.status.as_str(),
            "detail": ack.detail,
            "acknowledged_at": ack
                .acknowledged_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let response = self
            .transport
            .post_signed(ACK_PATH, body.to_string().as_bytes())
            .await?;
        expect_success(response).map(|_| ())
    }

    /// Report a terminal job result to the control plane.
    ///
    /// # Errors
    ///
    /// Transport failures and non-2xx responses.
    pub async fn report_result(&self, result: &PatchJobResult) -> Result<(), TransportError> {
        let body = result_wire_body(self.transport.config(), result);
        let response = self
            .transport
            .post_signed(RESULT_PATH, body.to_string().as_bytes())
            .await?;
        expect_success(response).map(|_| ())
    }

    /// Emit a `rejected` ack for a parsed-but-invalid command. Delivery is
    /// best-effort: the command is dropped either way.
    pub async fn acknowledge_rejection(&self, job_id: &str, reason: RejectReason) {
        let ack = PatchJobAck::new(job_id, AckStatus::Rejected, reason.as_detail());
        if let Err(error) = self.acknowledge(&ack).await {
            warn!(job_id, %reason, %error, "failed to deliver rejection ack");
        }
    }

    /// Try to extract a `job_id` from an unparseable body so the rejection
    /// is at least attributable.
    async fn reject_unparsed(&self, body: &[u8]) {
        let job_id = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("job_id")
                    .and_then(|id| id.as_str())
                    .map(ToString::to_string)
            });
        if let Some(job_id) = job_id {
            self.acknowledge_rejection(&job_id, RejectReason::Malformed).await;
        }
    }
}

/// Build the wire body shared by the control-plane result report and the
/// ingestion sidechannel.
#[must_use]
pub fn result_wire_body(
    config: &crate::config::Config,
    result: &PatchJobResult,
) -> serde_json::Value {
    json!({
        "tenant_id": config.tenant_id,
        "asset_id": config.asset_id,
        "job_id": result.job_id,
        "status": result.status.as_str(),
        "result": result.result.as_str(),
        "exit_code": result.exit_code,
        "stdout_summary": result.stdout_summary,
        "stderr_summary": result.stderr_summary,
        "reboot_required": result.reboot_required,
        "started_at": result.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "completed_at": result.completed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}
