//! # aegis-crypto
//!
//! Cryptographic primitives for the aegis session transport.
//!
//! This crate provides:
//! - X25519 ephemeral key agreement producing a per-session shared secret
//! - Ed25519 signatures binding a handshake transcript to a server's long-term identity
//! - BLAKE3-based KDF for deriving session send/receive keys
//! - ChaCha20-Poly1305 AEAD framing with a monotonic per-direction nonce and a
//!   sliding-window replay guard
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 / HKDF-BLAKE3 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size used internally (the wire carries only the 8-byte counter)
pub const AEAD_NONCE_SIZE: usize = 12;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// The two directional keys derived for a session, plus a handshake context
/// hash used to bind the connection's KDF info strings.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for the connection initiator (client) to use when sending
    pub client_to_server: [u8; 32],
    /// Key for the responder (server) to use when sending
    pub server_to_client: [u8; 32],
}
