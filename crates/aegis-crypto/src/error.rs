//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// A packet's nonce falls outside the receive replay window, or was already seen
    #[error("nonce replayed or too old")]
    ReplayedNonce,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// The ephemeral key exchange produced a low-order (contributorily non-unique) shared value
    #[error("key exchange produced a degenerate shared secret")]
    DegenerateSharedSecret,

    /// Ed25519 signature verification failed
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A signature value was malformed (wrong length) rather than simply invalid
    #[error("malformed signature")]
    InvalidSignature,

    /// A public key value did not decode to a valid curve point
    #[error("malformed public key")]
    InvalidPublicKey,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Nonce counter exhausted; mid-session rekeying is out of scope, so the session
    /// must be closed rather than rekeyed
    #[error("nonce counter exhausted")]
    NonceOverflow,
}
