//! Worker process entry points.
//!
//! A worker connects back to the supervisor's control socket, announces
//! itself, and then runs its loop until the supervisor broadcasts
//! `shutdown` (clean exit) or `reload` (exit with
//! [`RELOAD_EXIT_CODE`] so the supervisor restarts it against the new
//! configuration).

pub mod command;
pub mod heartbeat;
pub mod shipper;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aegis_core::config::Config;
use aegis_core::ipc::{self, IpcMessage};
use aegis_core::transport::SignedTransport;
use anyhow::{Context, Result};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::CONTROL_ENDPOINT;
use crate::exchange::ReqwestExchange;
use crate::supervisor::WorkerKind;

/// Exit code a worker uses to request a restart after `reload`.
pub const RELOAD_EXIT_CODE: u8 = 75;

/// Delay between control-socket connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Cadence of worker status lines over IPC.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Run one worker to completion.
///
/// # Errors
///
/// Control-socket connection failures and transport construction
/// failures; loop-level errors are handled inside the loops.
pub async fn run(
    kind: WorkerKind,
    config: Arc<Config>,
    runtime_dir: &Path,
) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let reload_requested = Arc::new(AtomicBool::new(false));

    let socket_path = ipc::endpoint_path(runtime_dir, CONTROL_ENDPOINT);
    let stream = connect_control(&socket_path, &cancel).await?;
    let (mut reader, mut writer) = stream.into_split();

    ipc::write_typed(
        &mut writer,
        &IpcMessage::Hello {
            worker: kind.as_str().to_string(),
            pid: std::process::id(),
        },
    )
    .await
    .context("failed to announce worker")?;
    info!(worker = %kind, "connected to supervisor");

    // Control listener: shutdown/reload directives end the worker.
    {
        let cancel = cancel.clone();
        let reload_requested = Arc::clone(&reload_requested);
        let worker = kind.as_str();
        tokio::spawn(async move {
            loop {
                match ipc::read_typed(&mut reader).await {
                    Ok(Some(IpcMessage::Shutdown)) => {
                        info!(worker, "shutdown directive received");
                        cancel.cancel();
                        return;
                    },
                    Ok(Some(IpcMessage::Reload)) => {
                        info!(worker, "reload directive received; restarting");
                        reload_requested.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    },
                    Ok(Some(other)) => debug!(worker, message = ?other, "ignoring directive"),
                    Ok(None) => {
                        // Supervisor went away; stop rather than run
                        // unsupervised.
                        warn!(worker, "control connection closed; stopping");
                        cancel.cancel();
                        return;
                    },
                    Err(error) => {
                        warn!(worker, %error, "control connection failed; stopping");
                        cancel.cancel();
                        return;
                    },
                }
            }
        });
    }

    // Status ticker keeps the supervisor's view fresh.
    {
        let cancel = cancel.clone();
        let worker = kind.as_str().to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(STATUS_INTERVAL) => {},
                }
                let status = IpcMessage::Status {
                    worker: worker.clone(),
                    detail: "ok".to_string(),
                };
                if ipc::write_typed(&mut writer, &status).await.is_err() {
                    return;
                }
            }
        });
    }

    let exchange = Arc::new(ReqwestExchange::new().context("failed to build HTTP exchange")?);
    let transport = SignedTransport::new(Arc::clone(&config), exchange);

    match kind {
        WorkerKind::Heartbeat => heartbeat::run(transport, &config, cancel.clone()).await,
        WorkerKind::Command => command::run(transport, &config, cancel.clone()).await,
        WorkerKind::Shipper => shipper::run(transport, &config, cancel.clone()).await,
    }

    info!(worker = %kind, "worker loop finished");
    Ok(if reload_requested.load(Ordering::SeqCst) {
        ExitCode::from(RELOAD_EXIT_CODE)
    } else {
        ExitCode::SUCCESS
    })
}

/// Connect to the supervisor's control socket, retrying until it is
/// available. The supervisor may bind after its workers start.
async fn connect_control(
    socket_path: &Path,
    cancel: &CancellationToken,
) -> Result<UnixStream> {
    let mut attempts = 0u32;
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                attempts += 1;
                if attempts % 20 == 0 {
                    warn!(
                        attempts,
                        path = %socket_path.display(),
                        %error,
                        "control socket not yet available"
                    );
                }
            },
        }
        tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("cancelled while connecting to supervisor"),
            () = tokio::time::sleep(CONNECT_RETRY_DELAY) => {},
        }
    }
}
