//! Errors a [`crate::Client`] can surface to its caller, as distinct from the
//! `aegis_core::Error` kinds reported through the dispatcher's error sink once
//! connected.

use aegis_core::frame::DisconnectReason;
use aegis_transport::transport::TransportError;
use thiserror::Error;

/// Failures that can occur connecting to, sending on, or tearing down a
/// client, outside the post-connect error sink.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Binding the underlying transport failed.
    #[error("failed to bind client transport: {0}")]
    Transport(#[from] TransportError),

    /// A protocol-level failure: handshake version mismatch or forged/
    /// wrong-identity `ServerHello` (no session created), or a post-connect
    /// queue overflow / oversized message on `send` (session closed).
    #[error("protocol error: {0}")]
    Protocol(#[from] aegis_core::Error),

    /// A cryptographic primitive failed while establishing the session.
    #[error("cryptographic error: {0}")]
    Crypto(#[from] aegis_crypto::CryptoError),

    /// The server rejected the connection during the handshake.
    #[error("server rejected connection: {0:?}")]
    Rejected(DisconnectReason),

    /// No `ServerHello`/`ServerWelcome` arrived before the connect deadline.
    #[error("handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    /// A send was attempted after `close()`.
    #[error("client is not connected")]
    NotConnected,
}
