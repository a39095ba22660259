//! Supervisor control server.
//!
//! Listens on a Unix socket for worker and sensor connections. Incoming
//! traffic is framed per `aegis_core::ipc`; behaviour signals are routed
//! to the defence engine and their decisions recorded as sealed evidence,
//! while `reload` / `shutdown` directives fan out to every connected
//! worker. A connection that violates the framing contract is closed and
//! the endpoint keeps accepting.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use aegis_core::defence::{BehaviourSignal, DefenceModule, DefencePolicy};
use aegis_core::evidence::{EvidenceBroker, EvidenceItem};
use aegis_core::ipc::{self, IpcMessage};
use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered control directives per subscriber.
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// The supervisor's IPC control server.
pub struct ControlServer {
    socket_path: PathBuf,
    captures_dir: PathBuf,
    defence: Mutex<DefenceModule>,
    evidence: Arc<EvidenceBroker>,
    control_tx: broadcast::Sender<IpcMessage>,
}

impl ControlServer {
    /// Create a server bound to `socket_path` once [`ControlServer::run`]
    /// starts.
    #[must_use]
    pub fn new(
        defence: DefenceModule,
        evidence: Arc<EvidenceBroker>,
        socket_path: PathBuf,
        captures_dir: PathBuf,
    ) -> Arc<Self> {
        let (control_tx, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
        Arc::new(Self {
            socket_path,
            captures_dir,
            defence: Mutex::new(defence),
            evidence,
            control_tx,
        })
    }

    /// Fan a control directive out to every connected worker.
    pub fn broadcast(&self, message: IpcMessage) {
        // No receivers is fine: workers may still be starting.
        let _ = self.control_tx.send(message);
    }

    /// Replace the defence policy (configuration reload).
    pub fn set_policy(&self, policy: DefencePolicy) {
        self.lock_defence().set_policy(policy);
    }

    /// One-line defence status for diagnostics.
    #[must_use]
    pub fn defence_summary(&self) -> String {
        self.lock_defence().status_summary()
    }

    /// Accept and serve connections until cancelled.
    ///
    /// # Errors
    ///
    /// Binding failures; per-connection errors are contained.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("failed to remove stale socket")?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind control socket")?;
        info!(path = %self.socket_path.display(), "control server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, cancel).await;
                            });
                        },
                        Err(error) => warn!(%error, "failed to accept control connection"),
                    }
                },
                () = cancel.cancelled() => break,
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("control server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, cancel: CancellationToken) {
        let (mut reader, writer) = stream.into_split();
        debug!("control connection opened");

        // Directive fan-out runs in its own task so an arriving broadcast
        // never aborts a half-read inbound frame.
        let writer_task = tokio::spawn(forward_directives(
            writer,
            self.control_tx.subscribe(),
            cancel.clone(),
        ));

        loop {
            tokio::select! {
                incoming = ipc::read_typed(&mut reader) => {
                    match incoming {
                        Ok(Some(message)) => self.dispatch(message),
                        Ok(None) => {
                            debug!("control connection closed");
                            break;
                        },
                        Err(error) => {
                            warn!(%error, "control connection protocol violation");
                            break;
                        },
                    }
                },
                () = cancel.cancelled() => break,
            }
        }

        if cancel.is_cancelled() {
            // Let the final directive (shutdown) drain before closing.
            let _ = writer_task.await;
        } else {
            writer_task.abort();
        }
    }

    fn dispatch(&self, message: IpcMessage) {
        match message {
            IpcMessage::Hello { worker, pid } => {
                info!(worker = %worker, pid, "worker connected");
            },
            IpcMessage::Status { worker, detail } => {
                debug!(worker = %worker, detail = %detail, "worker status");
            },
            IpcMessage::Signal(signal) => {
                if let Err(error) = self.handle_signal(&signal) {
                    warn!(%error, signal = %signal.name, "failed to process behaviour signal");
                }
            },
            IpcMessage::Reload | IpcMessage::Shutdown => {
                // Directives originate from the supervisor, not clients.
                debug!("ignoring client-sent control directive");
            },
        }
    }

    /// Evaluate a behaviour signal, apply the policy verdict, and seal
    /// the decision as evidence.
    fn handle_signal(&self, signal: &BehaviourSignal) -> Result<()> {
        let (finding, decision) = {
            let mut defence = self.lock_defence();
            let finding = defence.evaluate(signal);
            let decision = defence.apply(&finding);
            (finding, decision)
        };

        info!(
            detection_id = %finding.detection_id,
            action = ?decision.action,
            reason = %decision.decision_reason,
            "defence decision"
        );

        // Persist the decision record, then seal and queue it.
        std::fs::create_dir_all(&self.captures_dir)?;
        let evidence_id = format!("ev-{}", uuid::Uuid::new_v4().simple());
        let capture_path = self.captures_dir.join(format!("{evidence_id}.json"));
        let record = serde_json::json!({
            "finding": finding,
            "decision": decision,
        });
        std::fs::write(&capture_path, serde_json::to_vec_pretty(&record)?)?;

        self.evidence.add(EvidenceItem::new(
            evidence_id.clone(),
            "defence",
            "detection",
            finding.detection_id.clone(),
            capture_path,
        ))?;
        self.evidence.seal(&evidence_id)?;
        self.evidence.upload(&evidence_id)?;
        Ok(())
    }

    fn lock_defence(&self) -> std::sync::MutexGuard<'_, DefenceModule> {
        self.defence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Deliver broadcast directives to one connection until it closes or the
/// server stops.
async fn forward_directives(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut control_rx: broadcast::Receiver<IpcMessage>,
    cancel: CancellationToken,
) {
    loop {
        // Biased towards pending directives so a shutdown broadcast is
        // delivered even when cancellation lands in the same instant.
        let directive = tokio::select! {
            biased;
            directive = control_rx.recv() => directive,
            () = cancel.cancelled() => return,
        };
        match directive {
            Ok(message) => {
                if let Err(error) = ipc::write_typed(&mut writer, &message).await {
                    warn!(%error, "failed to deliver control directive");
                    return;
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "control subscriber lagged");
            },
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
