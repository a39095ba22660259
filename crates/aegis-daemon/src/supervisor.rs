//! Worker supervision.
//!
//! The supervisor spawns each worker as a child process (the same binary
//! re-exec'd with `--worker <name>`), restarts crashed workers with
//! bounded backoff, and routes lifecycle signals: TERM/INT stop the tree
//! gracefully, HUP reloads configuration and fans `reload` out over IPC.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_core::config::Config;
use aegis_core::defence::{DefenceModule, DefencePolicy};
use aegis_core::evidence::EvidenceBroker;
use aegis_core::ipc::{self, IpcMessage};
use aegis_core::retry::RetryPolicy;
use aegis_core::uplink::SpoolWriter;
use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::CONTROL_ENDPOINT;
use crate::ipc_server::ControlServer;
use crate::workers::RELOAD_EXIT_CODE;

/// Grace period between the shutdown directive and force-termination.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Uptime after which a worker's restart backoff resets.
const CLEAN_UPTIME: Duration = Duration::from_secs(60);

/// The worker processes the supervisor maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerKind {
    /// Signed liveness reporting.
    Heartbeat,
    /// Patch-job command channel and executor.
    Command,
    /// Uplink spool shipper.
    Shipper,
}

impl WorkerKind {
    /// All workers, in start order.
    pub const ALL: [Self; 3] = [Self::Heartbeat, Self::Command, Self::Shipper];

    /// Stable worker name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Command => "command",
            Self::Shipper => "shipper",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restart bookkeeping for one worker: exponential backoff on crash
/// loops, reset once the worker stays up for [`CLEAN_UPTIME`].
#[derive(Debug)]
pub struct RestartTracker {
    attempt: u32,
    policy: RetryPolicy,
    min_clean_uptime: Duration,
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CLEAN_UPTIME)
    }
}

impl RestartTracker {
    /// Create a tracker with explicit parameters.
    #[must_use]
    pub const fn new(policy: RetryPolicy, min_clean_uptime: Duration) -> Self {
        Self {
            attempt: 0,
            policy,
            min_clean_uptime,
        }
    }

    /// Record an abnormal exit after `uptime`; returns the delay to wait
    /// before the restart.
    pub fn on_abnormal_exit(&mut self, uptime: Duration) -> Duration {
        if uptime >= self.min_clean_uptime {
            self.attempt = 0;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.policy.delay_for_attempt(self.attempt)
    }

    /// Clear the backoff state (reload-requested restarts are not
    /// failures).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current consecutive-failure attempt count.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// The supervisor process.
pub struct Supervisor {
    config: Arc<Config>,
    runtime_dir: PathBuf,
    cancel: CancellationToken,
    control: Arc<ControlServer>,
}

impl Supervisor {
    /// Wire up the supervisor: spool, evidence broker, defence engine,
    /// and the control server (not yet bound).
    #[must_use]
    pub fn new(config: Arc<Config>, runtime_dir: PathBuf) -> Self {
        let spool = SpoolWriter::new(config.uplink_queue_dir.clone());
        let evidence = Arc::new(EvidenceBroker::new(
            config.tenant_id.clone(),
            config.asset_id.clone(),
            PathBuf::from("evidence_packages"),
            spool,
        ));
        let defence = DefenceModule::new(DefencePolicy::from_env());
        let control = ControlServer::new(
            defence,
            evidence,
            ipc::endpoint_path(&runtime_dir, CONTROL_ENDPOINT),
            runtime_dir.join("captures"),
        );

        Self {
            config,
            runtime_dir,
            cancel: CancellationToken::new(),
            control,
        }
    }

    /// Run the supervision tree until a stop signal arrives.
    ///
    /// # Errors
    ///
    /// Control-socket binding failures and signal-handler registration
    /// failures. Worker crashes are handled, not propagated.
    pub async fn run(&self) -> Result<()> {
        info!(
            asset_id = %self.config.asset_id,
            version = %self.config.agent_version,
            "supervisor starting"
        );
        info!(defence = %self.control.defence_summary(), "defence engine ready");

        let control_task = tokio::spawn(
            Arc::clone(&self.control).run(self.cancel.clone()),
        );

        let monitors: Vec<_> = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let supervisor = self.clone_refs();
                tokio::spawn(async move { supervisor.monitor_worker(kind).await })
            })
            .collect();

        self.signal_loop().await?;

        for monitor in monitors {
            if let Err(error) = monitor.await {
                warn!(%error, "worker monitor panicked");
            }
        }
        match control_task.await {
            Ok(Ok(())) => {},
            Ok(Err(error)) => error!(%error, "control server failed"),
            Err(error) => warn!(%error, "control server task panicked"),
        }

        info!("supervisor stopped");
        Ok(())
    }

    /// Route lifecycle signals until shutdown.
    async fn signal_loop(&self) -> Result<()> {
        let mut term = signal(SignalKind::terminate()).context("cannot install SIGTERM")?;
        let mut int = signal(SignalKind::interrupt()).context("cannot install SIGINT")?;
        let mut hup = signal(SignalKind::hangup()).context("cannot install SIGHUP")?;

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("stop requested (SIGTERM)");
                    self.shutdown();
                    return Ok(());
                },
                _ = int.recv() => {
                    info!("stop requested (SIGINT)");
                    self.shutdown();
                    return Ok(());
                },
                _ = hup.recv() => self.reload(),
                () = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Broadcast shutdown and cancel every loop.
    fn shutdown(&self) {
        self.control.broadcast(IpcMessage::Shutdown);
        self.cancel.cancel();
    }

    /// Re-read configuration and fan `reload` out to the workers.
    /// Workers restart themselves to pick up the new process-immutable
    /// config; the defence policy swaps in place.
    fn reload(&self) {
        match Config::load() {
            Ok(_) => {
                self.control.set_policy(DefencePolicy::from_env());
                self.control.broadcast(IpcMessage::Reload);
                info!("configuration reloaded; workers restarting");
            },
            Err(error) => warn!(%error, "reload failed; keeping current configuration"),
        }
    }

    /// Spawn-and-restart loop for one worker.
    async fn monitor_worker(&self, kind: WorkerKind) {
        let mut tracker = RestartTracker::default();

        while !self.cancel.is_cancelled() {
            let mut child = match self.spawn_worker(kind) {
                Ok(child) => child,
                Err(error) => {
                    let delay = tracker.on_abnormal_exit(Duration::ZERO);
                    error!(worker = %kind, %error, delay_s = delay.as_secs(), "failed to spawn worker");
                    if self.sleep_or_cancel(delay).await {
                        return;
                    }
                    continue;
                },
            };
            let started = Instant::now();

            let status = tokio::select! {
                status = child.wait() => status,
                () = self.cancel.cancelled() => {
                    self.stop_child(kind, &mut child).await;
                    return;
                },
            };

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(error) => {
                    warn!(worker = %kind, %error, "failed to reap worker");
                    -1
                },
            };

            if self.cancel.is_cancelled() {
                return;
            }
            if code == 0 {
                info!(worker = %kind, "worker exited cleanly");
                return;
            }
            if code == i32::from(RELOAD_EXIT_CODE) {
                info!(worker = %kind, "worker restarting for reload");
                tracker.reset();
                continue;
            }

            let delay = tracker.on_abnormal_exit(started.elapsed());
            warn!(
                worker = %kind,
                exit_code = code,
                attempt = tracker.attempt(),
                delay_s = delay.as_secs(),
                "worker exited abnormally; restarting"
            );
            if self.sleep_or_cancel(delay).await {
                return;
            }
        }
    }

    /// Spawn one worker child process.
    fn spawn_worker(&self, kind: WorkerKind) -> Result<tokio::process::Child> {
        let exe = std::env::current_exe().context("cannot resolve executable path")?;
        let child = Command::new(exe)
            .arg("--worker")
            .arg(kind.as_str())
            .arg("--runtime-dir")
            .arg(&self.runtime_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
            .context("worker spawn failed")?;

        if let Some(pid) = child.id() {
            info!(worker = %kind, pid, "worker started");
        }
        Ok(child)
    }

    /// Give a child [`STOP_GRACE`] to honour the shutdown directive, then
    /// force-terminate it.
    async fn stop_child(&self, kind: WorkerKind, child: &mut tokio::process::Child) {
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(worker = %kind, code = ?status.code(), "worker stopped");
            },
            Ok(Err(error)) => warn!(worker = %kind, %error, "failed to reap worker on stop"),
            Err(_) => {
                warn!(worker = %kind, grace_s = STOP_GRACE.as_secs(), "worker ignored shutdown; killing");
                if let Err(error) = child.kill().await {
                    warn!(worker = %kind, %error, "failed to kill worker");
                }
            },
        }
    }

    /// Sleep for `delay`, returning `true` when cancelled first.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }

    /// Cheap handle for monitor tasks.
    fn clone_refs(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            runtime_dir: self.runtime_dir.clone(),
            cancel: self.cancel.clone(),
            control: Arc::clone(&self.control),
        }
    }
}
