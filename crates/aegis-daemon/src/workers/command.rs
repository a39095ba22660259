//! Command worker: polls the signed command channel and drives verified
//! patch jobs through the state machine.

use std::time::Duration;

use aegis_core::command::{CommandChannel, PatchJobCommand, PatchOutcome};
use aegis_core::config::Config;
use aegis_core::job::{ExecutionOutcome, Executor, JobRunner};
use aegis_core::transport::SignedTransport;
use aegis_core::uplink::SpoolWriter;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Placeholder patch back-end. Reports every named patch as installed
/// without touching the host; real installers plug in behind
/// [`Executor`].
struct StubPatchExecutor;

#[async_trait]
impl Executor for StubPatchExecutor {
    async fn execute(&self, command: &PatchJobCommand) -> ExecutionOutcome {
        if command.patches.is_empty() {
            return ExecutionOutcome {
                result: PatchOutcome::NoPatches,
                exit_code: 0,
                reboot_required: false,
                stdout_summary: "no patches in job".to_string(),
                stderr_summary: String::new(),
            };
        }
        ExecutionOutcome {
            result: PatchOutcome::Installed,
            exit_code: 0,
            reboot_required: false,
            stdout_summary: format!("{} patch(es) recorded as installed", command.patches.len()),
            stderr_summary: String::new(),
        }
    }
}

/// Run the command worker until cancelled.
pub async fn run(transport: SignedTransport, config: &Config, cancel: CancellationToken) {
    let poll_interval = Duration::from_secs(config.patch_poll_interval_seconds.max(1));
    let channel = CommandChannel::new(transport);
    let runner = JobRunner::new(
        channel,
        SpoolWriter::new(config.uplink_queue_dir.clone()),
        poll_interval,
        cancel.clone(),
    );
    let executor = StubPatchExecutor;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match runner.channel().poll_next_patch_job().await {
            Ok(Some(command)) => {
                // Jobs are driven one at a time; acks stay ordered.
                runner.run(&command, &executor).await;
                continue;
            },
            Ok(None) => {},
            Err(error) => warn!(%error, "patch-job poll failed"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(poll_interval) => {},
        }
    }
}
