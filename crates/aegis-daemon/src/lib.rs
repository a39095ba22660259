//! # aegis-daemon
//!
//! Supervisor and worker processes of the Aegis endpoint management
//! agent. One binary serves both roles: launched bare it supervises,
//! launched with `--worker <name>` it becomes that worker and connects
//! back to the supervisor's IPC endpoint.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod crash;
pub mod exchange;
pub mod harness;
pub mod ipc_server;
pub mod supervisor;
pub mod workers;

/// Endpoint name of the supervisor's control socket.
pub const CONTROL_ENDPOINT: &str = "aegis-agent";

/// Resolve the runtime directory for sockets and state.
///
/// Precedence: explicit override, `AEGIS_RUNTIME_DIR`, then a fixed
/// directory under the system temp dir.
#[must_use]
pub fn runtime_dir(override_dir: Option<std::path::PathBuf>) -> std::path::PathBuf {
    if let Some(dir) = override_dir {
        return dir;
    }
    if let Ok(dir) = std::env::var("AEGIS_RUNTIME_DIR") {
        if !dir.is_empty() {
            return std::path::PathBuf::from(dir);
        }
    }
    std::env::temp_dir().join("aegis-agent")
}
