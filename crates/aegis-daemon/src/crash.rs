//! Crash handler.
//!
//! Records the fatal signal number into a marker file and exits with
//! `128 + signum`. The supervisor registers only abort/segfault (it owns
//! graceful TERM/INT handling itself); workers register the lifecycle
//! signals too, because their graceful shutdown path is the IPC
//! `shutdown` message rather than a signal.

use std::path::PathBuf;

use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tracing::warn;

/// Resolve the crash marker path (`AEGIS_CRASH_MARKER` override).
#[must_use]
pub fn marker_path() -> PathBuf {
    std::env::var("AEGIS_CRASH_MARKER").map_or_else(
        |_| std::env::temp_dir().join("aegis-agent-crash.marker"),
        PathBuf::from,
    )
}

extern "C" fn on_fatal_signal(signum: libc::c_int) {
    // Minimal work only: record the signal, then exit 128 + signum.
    let _ = std::fs::write(marker_path(), format!("signal={signum}\n"));
    std::process::exit(128 + signum);
}

/// Install the crash handler.
///
/// With `include_lifecycle_signals`, TERM and INT are also routed to the
/// crash exit path.
pub fn install(include_lifecycle_signals: bool) {
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    let mut signals = vec![Signal::SIGABRT, Signal::SIGSEGV];
    if include_lifecycle_signals {
        signals.push(Signal::SIGTERM);
        signals.push(Signal::SIGINT);
    }

    for signal in signals {
        // Safety: the handler only calls async-signal-tolerant teardown
        // before _exit-style termination.
        if let Err(error) = unsafe { sigaction(signal, &action) } {
            warn!(%signal, %error, "failed to install crash handler");
        }
    }
}
