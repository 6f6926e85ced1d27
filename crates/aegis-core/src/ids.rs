//! Session identity.

use std::fmt;

/// Server-assigned 128-bit session identifier.
///
/// Carried in cleartext in every post-handshake packet header so the I/O loop can
/// demultiplex datagrams to sessions without decrypting anything first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// The zero SessionId, used in the header of pre-session packets (`ClientHello`,
    /// and a cleartext `Disconnect` on version mismatch).
    pub const ZERO: SessionId = SessionId([0u8; 16]);

    /// Mint a fresh random SessionId.
    ///
    /// # Errors
    ///
    /// Propagates failure from the OS CSPRNG.
    pub fn generate() -> Result<Self, aegis_crypto::CryptoError> {
        let mut bytes = [0u8; 16];
        aegis_crypto::random::fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Wrap raw bytes as a SessionId.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether this is the reserved zero value used before a session exists.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_zero() {
        assert!(SessionId::ZERO.is_zero());
    }

    #[test]
    fn generate_is_not_zero() {
        let id = SessionId::generate().unwrap();
        assert!(!id.is_zero());
    }

    #[test]
    fn roundtrip_bytes() {
        let bytes = [9u8; 16];
        let id = SessionId::from_bytes(bytes);
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn distinct_generated_ids() {
        let a = SessionId::generate().unwrap();
        let b = SessionId::generate().unwrap();
        assert_ne!(a, b);
    }
}
