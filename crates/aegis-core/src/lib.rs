//! # aegis-core
//!
//! Core library for the Aegis endpoint management agent.
//!
//! This crate provides the building blocks shared by the supervisor and
//! worker processes of the agent:
//!
//! - **Crypto**: HMAC-SHA256 request signing and streamed file hashing
//! - **Transport**: signed HTTP request construction over a pluggable
//!   exchange
//! - **Command channel**: the signed poll/acknowledge/report contract for
//!   patch jobs, with replay protection
//! - **Job state machine**: ack-per-transition execution of verified
//!   commands
//! - **Defence**: behaviour-signal evaluation under a response policy
//! - **Evidence**: hash-sealed artefact packaging and durable uplink
//! - **IPC**: length-prefixed framing between supervisor and workers
//!
//! The concrete HTTP client, the platform sensor, and the patch executor
//! are external collaborators behind the [`transport::HttpExchange`],
//! behaviour-signal, and [`job::Executor`] boundaries respectively.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aegis_core::config::Config;
//! use aegis_core::retry::heartbeat_interval_seconds;
//!
//! # fn example() -> Result<(), aegis_core::config::ConfigError> {
//! let config = Config::load()?;
//! let interval = heartbeat_interval_seconds(
//!     config.heartbeat_interval_seconds,
//!     0,
//!     config.max_heartbeat_interval_seconds,
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod config;
pub mod crypto;
pub mod defence;
pub mod evidence;
pub mod heartbeat;
pub mod identity;
pub mod integrity;
pub mod inventory;
pub mod ipc;
pub mod job;
pub mod retry;
pub mod transport;
pub mod uplink;

pub use config::Config;
pub use transport::SignedTransport;
