//! Patch-job state machine.
//!
//! A verified command progresses through
//! `received → scheduled* → running → (completed | failed)`, with
//! `rejected` terminal from precondition checks. One acknowledgement is
//! emitted per transition, sequentially from the job task, so the control
//! plane observes a monotone prefix of that sequence.
//!
//! While waiting for the scheduled instant the machine re-emits
//! `scheduled` acks so the control plane sees liveness; on shutdown an
//! in-flight job fails with detail `agent_shutdown` after a short grace
//! for the executor. After execution the result is delivered to the
//! control plane, the ingestion sidechannel, and the terminal ack — each
//! retried independently with bounded backoff. The result is never
//! re-sent once the terminal ack has succeeded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{
    AckStatus, CommandChannel, PatchJobAck, PatchJobCommand, PatchJobResult, PatchOutcome,
    RejectReason, result_wire_body,
};
use crate::retry::RetryPolicy;
use crate::uplink::{SpoolWriter, UplinkKind};

/// Ingestion path for the patch-result sidechannel.
const PATCH_RESULT_TARGET_PATH: &str = "patch-results";

/// Detail string for shutdown-cancelled jobs.
const SHUTDOWN_DETAIL: &str = "agent_shutdown";

/// Grace given to an in-flight executor on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the executor did with a job.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Aggregate outcome.
    pub result: PatchOutcome,
    /// Process-style exit code.
    pub exit_code: i32,
    /// Whether a reboot is still pending.
    pub reboot_required: bool,
    /// Truncated stdout capture.
    pub stdout_summary: String,
    /// Truncated stderr capture.
    pub stderr_summary: String,
}

/// The patch execution boundary. Concrete back-ends (package managers,
/// installers) live behind this trait.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Apply the patches named by the command and report what happened.
    async fn execute(&self, command: &PatchJobCommand) -> ExecutionOutcome;
}

/// Drives one command at a time through the state machine.
pub struct JobRunner {
    channel: CommandChannel,
    spool: SpoolWriter,
    retry: RetryPolicy,
    reack_interval: Duration,
    cancel: CancellationToken,
}

impl JobRunner {
    /// Create a runner.
    ///
    /// `poll_interval` is the command-channel poll cadence; `scheduled`
    /// re-acks are emitted at most every `poll_interval * 2`.
    #[must_use]
    pub fn new(
        channel: CommandChannel,
        spool: SpoolWriter,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            spool,
            retry: RetryPolicy::default(),
            reack_interval: poll_interval * 2,
            cancel,
        }
    }

    /// The command channel this runner acknowledges through.
    #[must_use]
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Run one verified command to completion.
    ///
    /// Returns the result when the executor ran, `None` when the job was
    /// rejected by precondition checks or cancelled by shutdown.
    pub async fn run(
        &self,
        command: &PatchJobCommand,
        executor: &dyn Executor,
    ) -> Option<PatchJobResult> {
        if let Err(reason) = check_schedule(command) {
            warn!(job_id = %command.job_id, %reason, "patch job precondition failed");
            self.channel.acknowledge_rejection(&command.job_id, reason).await;
            return None;
        }

        self.ack(command, AckStatus::Received, "").await;

        if !self.wait_until_scheduled(command).await {
            self.ack(command, AckStatus::Failed, SHUTDOWN_DETAIL).await;
            return None;
        }

        self.ack(command, AckStatus::Running, "").await;
        let started_at = Utc::now();

        let Some(outcome) = self.execute_with_grace(command, executor).await else {
            self.ack(command, AckStatus::Failed, SHUTDOWN_DETAIL).await;
            return None;
        };

        let status = if outcome.result == PatchOutcome::Failed {
            AckStatus::Failed
        } else {
            AckStatus::Completed
        };
        let result = PatchJobResult {
            job_id: command.job_id.clone(),
            status,
            result: outcome.result,
            exit_code: outcome.exit_code,
            reboot_required: outcome.reboot_required,
            stdout_summary: outcome.stdout_summary,
            stderr_summary: outcome.stderr_summary,
            started_at,
            completed_at: Utc::now().max(started_at),
        };

        self.report(&result).await;
        info!(job_id = %result.job_id, status = %result.status, "patch job finished");
        Some(result)
    }

    /// Wait for the scheduled instant, re-acking `scheduled` each cycle.
    /// Returns `false` when shutdown interrupted the wait.
    async fn wait_until_scheduled(&self, command: &PatchJobCommand) -> bool {
        let mut remaining = (command.scheduled_time() - Utc::now())
            .to_std()
            .unwrap_or_default();

        while !remaining.is_zero() {
            self.ack(command, AckStatus::Scheduled, "").await;
            let step = remaining.min(self.reack_interval);
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = tokio::time::sleep(step) => {},
            }
            remaining -= step;
        }
        true
    }

    /// Run the executor, giving it [`SHUTDOWN_GRACE`] to finish when
    /// shutdown arrives mid-run. `None` means the grace expired.
    async fn execute_with_grace(
        &self,
        command: &PatchJobCommand,
        executor: &dyn Executor,
    ) -> Option<ExecutionOutcome> {
        let execution = executor.execute(command);
        tokio::pin!(execution);

        tokio::select! {
            outcome = &mut execution => Some(outcome),
            () = self.cancel.cancelled() => {
                warn!(job_id = %command.job_id, "shutdown during patch execution");
                tokio::select! {
                    outcome = &mut execution => Some(outcome),
                    () = tokio::time::sleep(SHUTDOWN_GRACE) => None,
                }
            },
        }
    }

    /// Deliver the result to the control plane and the ingestion
    /// sidechannel, then emit the terminal ack. Each step retries
    /// independently; a step that exhausts its retries is logged and the
    /// remaining steps still run.
    async fn report(&self, result: &PatchJobResult) {
        let delivery = self
            .retry
            .run(|| async { self.channel.report_result(result).await })
            .await;
        if let Err(error) = delivery {
            warn!(job_id = %result.job_id, %error, "result delivery to control plane failed");
        }

        let payload = result_wire_body(self.channel.transport().config(), result).to_string();
        let spooled = self
            .retry
            .run(|| {
                let payload = payload.clone();
                async move {
                    self.spool
                        .enqueue(
                            UplinkKind::PatchResult,
                            &result.job_id,
                            PATCH_RESULT_TARGET_PATH,
                            payload,
                        )
                        .map(|_| ())
                }
            })
            .await;
        if let Err(error) = spooled {
            warn!(job_id = %result.job_id, %error, "result spooling for ingestion failed");
        }

        let ack = PatchJobAck::new(result.job_id.clone(), result.status, "");
        let terminal = self
            .retry
            .run(|| async { self.channel.acknowledge(&ack).await })
            .await;
        if let Err(error) = terminal {
            warn!(job_id = %result.job_id, %error, "terminal ack delivery failed");
        }
    }

    /// Emit one non-terminal ack, best-effort. Acks are sequential from
    /// this task, which is what keeps the observed order monotone.
    async fn ack(&self, command: &PatchJobCommand, status: AckStatus, detail: &str) {
        let ack = PatchJobAck::new(command.job_id.clone(), status, detail);
        if let Err(error) = self.channel.acknowledge(&ack).await {
            warn!(job_id = %command.job_id, %status, %error, "ack delivery failed");
        }
    }
}

/// Time-travel protection: a schedule before the issue time or more than
/// seven days out is rejected.
fn check_schedule(command: &PatchJobCommand) -> Result<(), RejectReason> {
    let scheduled = command.scheduled_time();
    let issued = chrono::DateTime::from_timestamp(command.issued_at_epoch, 0)
        .unwrap_or_else(Utc::now);

    if scheduled < issued || scheduled > Utc::now() + chrono::Duration::days(7) {
        return Err(RejectReason::InvalidSchedule);
    }
    Ok(())
}
