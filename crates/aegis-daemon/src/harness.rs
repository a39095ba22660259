//! Service lifecycle harness boundary.
//!
//! Platform service-manager registration is an external concern; the
//! launcher's `--install` / `--uninstall` flags land here. The harness
//! records the registration state next to the binary so repeated installs
//! are idempotent, and the platform glue (systemd unit, SCM entry)
//! consumes that state out-of-band.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

/// Name of the registration marker file.
const REGISTRATION_FILE: &str = "aegis-agent.service-registration";

fn registration_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot resolve executable path")?;
    let dir = exe
        .parent()
        .context("executable has no parent directory")?;
    Ok(dir.join(REGISTRATION_FILE))
}

/// Register the agent with the platform service manager.
///
/// # Errors
///
/// Fails when the registration state cannot be written.
pub fn install() -> Result<()> {
    let path = registration_path()?;
    let exe = std::env::current_exe().context("cannot resolve executable path")?;
    std::fs::write(
        &path,
        format!("service=aegis-agent\nexec={}\nauto_start=true\n", exe.display()),
    )
    .with_context(|| format!("cannot write {}", path.display()))?;
    info!(path = %path.display(), "service registration recorded");
    println!("Service installed.");
    Ok(())
}

/// Remove the agent's service registration.
///
/// # Errors
///
/// Fails when no registration exists or it cannot be removed.
pub fn uninstall() -> Result<()> {
    let path = registration_path()?;
    if !path.exists() {
        anyhow::bail!("service is not installed");
    }
    std::fs::remove_file(&path)
        .with_context(|| format!("cannot remove {}", path.display()))?;
    info!(path = %path.display(), "service registration removed");
    println!("Service removed.");
    Ok(())
}
