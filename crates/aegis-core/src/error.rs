//! Error kinds for the session transport core.

use thiserror::Error;

/// Core protocol errors.
///
/// These are the *kinds* named in the transport's error handling design, not raw
/// exception types: callers match on variant to decide how to react (tear down a
/// nascent handshake, close an established session, or just report to a sink).
#[derive(Debug, Error)]
pub enum Error {
    /// The handshake failed before a session was ever delivered to user code.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// The server's identity signature did not verify against the pinned public key.
    #[error("server identity signature did not verify")]
    SignatureInvalid,

    /// The peer's protocol version does not match.
    #[error("protocol version mismatch")]
    VersionMismatch,

    /// An AEAD body failed to authenticate.
    #[error("decryption failed")]
    DecryptFailure,

    /// A packet could not be parsed from its wire bytes.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// No handler is registered for a decoded message's type tag.
    #[error("no handler registered for message type {0}")]
    UnknownMessageType(u16),

    /// A reliable send would grow the pending-ack queue past its configured bound.
    #[error("reliable send queue overflow (max {max})")]
    QueueOverflow {
        /// Configured `maxReliableQueueSize`.
        max: usize,
    },

    /// A payload exceeded the configured maximum message size.
    #[error("message too large: {size} bytes exceeds max {max}")]
    MessageTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured `maxMessageSize`.
        max: usize,
    },

    /// An operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The session has already transitioned to `Closed`.
    #[error("session is closed")]
    SessionClosed,

    /// The underlying `Network` port reported an I/O failure.
    #[error("i/o failure: {0}")]
    IoFailure(String),

    /// A cryptographic primitive failed.
    #[error("cryptographic error: {0}")]
    Crypto(#[from] aegis_crypto::CryptoError),
}

impl Error {
    /// Whether this error, if observed on an established session, should end it.
    ///
    /// Handshake-stage failures and handler exceptions are excluded: the former
    /// never reach a live session, the latter are routed to the error sink and the
    /// session survives per the dispatcher's isolation contract.
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Error::DecryptFailure
                | Error::MalformedPacket(_)
                | Error::QueueOverflow { .. }
                | Error::MessageTooLarge { .. }
                | Error::Timeout
                | Error::SessionClosed
                | Error::IoFailure(_)
        )
    }
}
