//! Signed patch-job command channel.
//!
//! The control plane delivers patch jobs as signed command objects. This
//! module owns the wire types, the canonical signing payload, and the
//! four-step validation every received command passes before it reaches
//! the job state machine:
//!
//! 1. asset scoping (`asset_id` must match this agent)
//! 2. issue-time skew window (±[`SKEW_SECONDS`], inclusive)
//! 3. issuer signature over the canonical payload, constant-time
//! 4. nonce replay detection against a bounded cache
//!
//! A failure at any step drops the command and emits a `rejected`
//! acknowledgement carrying the [`RejectReason`]. The channel itself is
//! stateless above the nonce cache; job progress lives in
//! [`crate::job`].

mod channel;
mod nonce;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use channel::{CommandChannel, result_wire_body};
pub use nonce::NonceCache;

use crate::config::Config;
use crate::crypto;

/// Accepted clock skew between issuer and agent, in seconds.
pub const SKEW_SECONDS: i64 = 300;

/// How the executor should handle reboots after patch application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootPolicy {
    /// Never reboot.
    #[default]
    None,
    /// Reboot only when the installer requires it.
    IfRequired,
    /// Always reboot after application.
    Required,
}

impl RebootPolicy {
    /// Canonical wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::IfRequired => "if_required",
            Self::Required => "required",
        }
    }
}

/// A single patch within a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchDescriptor {
    /// Vendor-scoped patch identifier. Non-empty.
    pub patch_id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Issuing vendor.
    #[serde(default)]
    pub vendor: String,
    /// Severity label.
    #[serde(default)]
    pub severity: String,
    /// Knowledge-base reference.
    #[serde(default)]
    pub kb: String,
}

/// A signed patch-job command as received from the control plane.
///
/// `scheduled_at` is kept as the raw wire text: the signature covers the
/// exact bytes the issuer serialised, so reformatting before verification
/// would break it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchJobCommand {
    /// Job identifier, unique per tenant.
    pub job_id: String,
    /// Target asset; must equal this agent's `asset_id`.
    pub asset_id: String,
    /// Scheduled execution instant, ISO-8601 UTC, verbatim.
    pub scheduled_at: String,
    /// Reboot handling instruction.
    #[serde(default)]
    pub reboot_policy: RebootPolicy,
    /// Issue time, seconds since epoch.
    #[serde(rename = "issued_at")]
    pub issued_at_epoch: i64,
    /// Issuer nonce for replay detection.
    pub nonce: String,
    /// Issuer signature over [`canonical_signing_payload`].
    pub signature: String,
    /// Patches to apply, in order.
    #[serde(default)]
    pub patches: Vec<PatchDescriptor>,
}

impl PatchJobCommand {
    /// Parse `scheduled_at`; an empty or malformed value schedules
    /// immediately.
    #[must_use]
    pub fn scheduled_time(&self) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&self.scheduled_at)
            .map_or_else(|_| Utc::now(), |parsed| parsed.with_timezone(&Utc))
    }
}

/// Acknowledgement states, monotone per job:
/// `received → scheduled* → running → (completed | failed)`, with
/// `rejected` terminal from validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Command verified and accepted.
    Received,
    /// Waiting for the scheduled instant.
    Scheduled,
    /// Executor invoked.
    Running,
    /// Executor finished without failure. Terminal.
    Completed,
    /// Executor failed or the agent shut down mid-job. Terminal.
    Failed,
    /// Command dropped during validation. Terminal.
    Rejected,
}

impl AckStatus {
    /// Canonical wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One acknowledgement, emitted on every state change of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchJobAck {
    /// Acknowledged job.
    pub job_id: String,
    /// New state.
    pub status: AckStatus,
    /// Free-form detail (reject reason, shutdown cause, ...).
    pub detail: String,
    /// When the transition happened.
    pub acknowledged_at: DateTime<Utc>,
}

impl PatchJobAck {
    /// Build an acknowledgement stamped now.
    #[must_use]
    pub fn new(job_id: impl Into<String>, status: AckStatus, detail: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            detail: detail.into(),
            acknowledged_at: Utc::now(),
        }
    }
}

/// Aggregate outcome of an executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Every patch applied.
    Installed,
    /// Nothing to apply.
    NoPatches,
    /// Some patches applied, some failed.
    Partial,
    /// Application failed.
    Failed,
}

impl PatchOutcome {
    /// Canonical wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::NoPatches => "no_patches",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Result record produced once per executed job and reported to both the
/// control plane and the ingestion sidechannel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchJobResult {
    /// The executed job.
    pub job_id: String,
    /// Terminal state (`completed` or `failed`).
    pub status: AckStatus,
    /// Aggregate outcome.
    pub result: PatchOutcome,
    /// Executor exit code.
    pub exit_code: i32,
    /// Whether a reboot is still pending.
    pub reboot_required: bool,
    /// Truncated stdout capture.
    pub stdout_summary: String,
    /// Truncated stderr capture.
    pub stderr_summary: String,
    /// Execution start.
    pub started_at: DateTime<Utc>,
    /// Execution end; never before `started_at`.
    pub completed_at: DateTime<Utc>,
}

/// Why a command was dropped during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Command addressed to a different asset.
    AssetMismatch,
    /// Issue time outside the skew window.
    StaleOrFuture,
    /// Issuer signature did not verify.
    InvalidSignature,
    /// Nonce already seen.
    Replay,
    /// Scheduled instant before issue time or more than 7 days out.
    InvalidSchedule,
    /// Command could not be parsed.
    Malformed,
}

impl RejectReason {
    /// Wire detail string carried in the `rejected` acknowledgement.
    #[must_use]
    pub const fn as_detail(self) -> &'static str {
        match self {
            Self::AssetMismatch => "asset_mismatch",
            Self::StaleOrFuture => "stale_or_future",
            Self::InvalidSignature => "invalid_signature",
            Self::Replay => "replay",
            Self::InvalidSchedule => "invalid_schedule",
            Self::Malformed => "malformed",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_detail())
    }
}

/// Serialise the fields covered by the issuer signature, in the fixed
/// order the issuer signs them, with no insignificant whitespace.
///
/// Field order: `job_id, asset_id, scheduled_at, reboot_policy,
/// issued_at, nonce, patches[]`; each patch in order `patch_id, title,
/// vendor, severity, kb`.
#[must_use]
pub fn canonical_signing_payload(command: &PatchJobCommand) -> String {
    let mut payload = String::with_capacity(256);
    payload.push('{');
    push_string_field(&mut payload, "job_id", &command.job_id);
    payload.push(',');
    push_string_field(&mut payload, "asset_id", &command.asset_id);
    payload.push(',');
    push_string_field(&mut payload, "scheduled_at", &command.scheduled_at);
    payload.push(',');
    push_string_field(&mut payload, "reboot_policy", command.reboot_policy.as_str());
    payload.push(',');
    payload.push_str("\"issued_at\":");
    payload.push_str(&command.issued_at_epoch.to_string());
    payload.push(',');
    push_string_field(&mut payload, "nonce", &command.nonce);
    payload.push(',');
    payload.push_str("\"patches\":[");
    for (index, patch) in command.patches.iter().enumerate() {
        if index > 0 {
            payload.push(',');
        }
        payload.push('{');
        push_string_field(&mut payload, "patch_id", &patch.patch_id);
        payload.push(',');
        push_string_field(&mut payload, "title", &patch.title);
        payload.push(',');
        push_string_field(&mut payload, "vendor", &patch.vendor);
        payload.push(',');
        push_string_field(&mut payload, "severity", &patch.severity);
        payload.push(',');
        push_string_field(&mut payload, "kb", &patch.kb);
        payload.push('}');
    }
    payload.push_str("]}");
    payload
}

fn push_string_field(payload: &mut String, key: &str, value: &str) {
    payload.push('"');
    payload.push_str(key);
    payload.push_str("\":\"");
    push_json_escaped(payload, value);
    payload.push('"');
}

/// Escape a string for embedding in the canonical payload. The escape set
/// matches the issuer's: backslash, quote, and the common control
/// characters.
fn push_json_escaped(payload: &mut String, value: &str) {
    for character in value.chars() {
        match character {
            '"' => payload.push_str("\\\""),
            '\\' => payload.push_str("\\\\"),
            '\n' => payload.push_str("\\n"),
            '\r' => payload.push_str("\\r"),
            '\t' => payload.push_str("\\t"),
            other => payload.push(other),
        }
    }
}

/// Run the §-ordered receipt validation against a parsed command.
///
/// `now_epoch` is injected for testability. The nonce cache records the
/// nonce as a side effect when all earlier steps pass.
///
/// # Errors
///
/// The [`RejectReason`] for the first failing step.
pub fn validate_command(
    config: &Config,
    nonces: &NonceCache,
    command: &PatchJobCommand,
    now_epoch: i64,
) -> Result<(), RejectReason> {
    if command.asset_id != config.asset_id {
        return Err(RejectReason::AssetMismatch);
    }

    if command.issued_at_epoch == 0
        || (now_epoch - command.issued_at_epoch).abs() > SKEW_SECONDS
    {
        return Err(RejectReason::StaleOrFuture);
    }

    let payload = canonical_signing_payload(command);
    let verified = crypto::verify_payload(
        secrecy::ExposeSecret::expose_secret(&config.shared_key),
        payload.as_bytes(),
        command.issued_at_epoch,
        &command.signature,
    );
    if !verified {
        return Err(RejectReason::InvalidSignature);
    }

    if !nonces.observe(&command.nonce) {
        return Err(RejectReason::Replay);
    }

    Ok(())
}
