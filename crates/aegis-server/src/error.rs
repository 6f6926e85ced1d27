//! Errors a [`crate::Server`] can surface to its caller, as distinct from the
//! `aegis_core::Error` kinds a session reports through the dispatcher's error sink.

use aegis_transport::transport::TransportError;
use thiserror::Error;

/// Failures that can occur setting up or tearing down a server, outside the
/// per-session error sink.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the underlying transport failed.
    #[error("failed to bind server transport: {0}")]
    Transport(#[from] TransportError),

    /// `maxConnections` was reached when a new `ClientHello` arrived.
    #[error("server at max connections ({0})")]
    ConnectionLimitReached(usize),

    /// A protocol-level failure sending to a specific session: queue overflow,
    /// oversized message (session closed), or the session no longer exists.
    #[error("protocol error: {0}")]
    Protocol(#[from] aegis_core::Error),
}
