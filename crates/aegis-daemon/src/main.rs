//! aegis-daemon — endpoint management agent.
//!
//! One binary, two roles:
//!
//! - bare: the supervisor process. Binds the control socket, spawns the
//!   heartbeat/command/shipper workers, restarts crashed ones, routes
//!   lifecycle signals.
//! - `--worker <name>`: one worker process, connected back to the
//!   supervisor over the control socket.
//!
//! Startup gates run before anything else: canonical identifiers must be
//! present, and when `expected_binary_hash` is configured the binary's
//! own SHA-256 must match it.
//!
//! `main` stays synchronous and constructs the runtime explicitly: the
//! crash handler and lifecycle dispatch must be installed in a
//! single-threaded context, before any worker threads exist.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use aegis_core::config::{Config, ConfigError};
use aegis_core::identity;
use aegis_core::integrity::verify_self_integrity;
use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aegis_daemon::supervisor::{Supervisor, WorkerKind};
use aegis_daemon::{crash, harness, runtime_dir, workers};

/// Aegis endpoint management agent.
#[derive(Parser, Debug)]
#[command(name = "aegis-daemon", version, about, long_about = None)]
struct Args {
    /// Register the agent with the platform service manager and exit.
    #[arg(long)]
    install: bool,

    /// Remove the service registration and exit.
    #[arg(long)]
    uninstall: bool,

    /// Run as the named worker instead of the supervisor.
    #[arg(long, value_enum)]
    worker: Option<WorkerKind>,

    /// Runtime directory for sockets and decision captures.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.install {
        return exit_from(harness::install());
    }
    if args.uninstall {
        return exit_from(harness::uninstall());
    }

    // Workers route TERM/INT through the crash path; the supervisor owns
    // them for graceful shutdown.
    crash::install(args.worker.is_some());

    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::MissingIdentifiers) => {
            eprintln!("Missing canonical identifiers.");
            return ExitCode::from(1);
        },
        Err(error) => {
            eprintln!("Configuration error: {error}");
            return ExitCode::from(1);
        },
    };

    if !config.expected_binary_hash.is_empty() {
        let verified = std::env::current_exe()
            .map(|exe| verify_self_integrity(&exe, &config.expected_binary_hash))
            .unwrap_or(false);
        if !verified {
            eprintln!("Integrity verification failed.");
            return ExitCode::from(1);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::from(1);
        },
    };

    match runtime.block_on(async_main(args, Arc::new(config))) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "agent failed");
            ExitCode::from(1)
        },
    }
}

async fn async_main(args: Args, config: Arc<Config>) -> anyhow::Result<ExitCode> {
    let runtime_dir = runtime_dir(args.runtime_dir);

    if let Some(kind) = args.worker {
        return workers::run(kind, config, &runtime_dir).await;
    }

    let identity = identity::load_or_generate(&runtime_dir.join("agent_identity.txt"))
        .context("failed to load agent identity")?;
    info!(
        uuid = %identity.uuid,
        asset_id = %config.asset_id,
        "agent identity ready"
    );

    Supervisor::new(config, runtime_dir).run().await?;
    Ok(ExitCode::SUCCESS)
}

fn exit_from(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::from(1)
        },
    }
}
