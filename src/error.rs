//! Error kinds for the server kernel (spec §7).
//!
//! [`CoreError`] is the typed surface for the failure modes spec §7 names;
//! `anyhow::Result` is used at task/binary boundaries the way the
//! teacher's `main.rs`/`server.rs` do. Socket-level failures are handled
//! by simply dropping the owning entity rather than unwinding an error
//! through the event loop, so most of the variants below are constructed
//! at the few call sites that validate before mutating state rather than
//! threaded pervasively through dispatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Socket read/write/close failed. The owning entity is dropped.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed or out-of-state command. Clients get a numeric reply and
    /// keep their connection; peers get a squit-equivalent notice and close.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Peer name/secret mismatch. The link closes without revealing which
    /// field failed.
    #[error("peer authentication failed")]
    Authentication,

    /// A slot table is full (spec §7 "resource" kind). The caller refuses
    /// the new connection with a transient error; no partial state survives.
    #[error("resource exhausted: {0}")]
    Resource(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
