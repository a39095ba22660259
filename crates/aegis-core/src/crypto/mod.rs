//! Cryptographic primitives for the agent.
//!
//! Two concerns live here:
//!
//! - **Request signing**: HMAC-SHA256 over `"<timestamp>.<payload>"`,
//!   base64-encoded, with constant-time verification. Every outbound
//!   request to the control plane carries such a signature, and inbound
//!   patch-job commands are verified with the same construction.
//! - **Content hashing**: streamed SHA-256 of files, used for evidence
//!   sealing and self-integrity checks.
//!
//! The shared key is a tenant-scoped secret; the signing API refuses to
//! operate without one.

mod digest;
mod sign;

pub use digest::{sha256_file, sha256_hex};
pub use sign::{SignError, sign_payload, verify_payload};
