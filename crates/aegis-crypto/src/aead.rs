//! Per-session AEAD framing.
//!
//! Every post-handshake packet body is authenticated-encrypted with
//! ChaCha20-Poly1305 under a key derived for that session and direction. The
//! packet's 1-byte type tag and its 16-byte SessionId are carried as
//! associated data, so altering either invalidates the authentication tag
//! even though they travel in cleartext. A monotonically increasing 64-bit
//! nonce counter is carried on the wire (8 bytes) and expanded to the
//! cipher's 12-byte nonce by zero-extension.

use crate::CryptoError;
use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Width of the replay window, in packets, tracked behind the highest accepted nonce.
const REPLAY_WINDOW_BITS: u64 = 64;

/// A single directional AEAD key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }
}

/// Builds the 12-byte cipher nonce from the 8-byte wire counter.
fn expand_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Sliding-window replay guard, the standard IPsec/DTLS anti-replay algorithm: accepts
/// nonces up to `REPLAY_WINDOW_BITS` behind the highest one seen, rejects anything older
/// or already marked as seen.
#[derive(Default)]
struct ReplayWindow {
    highest: u64,
    seen: u64,
    initialized: bool,
}

impl ReplayWindow {
    fn check_and_update(&mut self, nonce: u64) -> Result<(), CryptoError> {
        if !self.initialized {
            self.initialized = true;
            self.highest = nonce;
            self.seen = 1;
            return Ok(());
        }

        if nonce > self.highest {
            let shift = nonce - self.highest;
            self.seen = if shift >= REPLAY_WINDOW_BITS {
                1
            } else {
                (self.seen << shift) | 1
            };
            self.highest = nonce;
            return Ok(());
        }

        let behind = self.highest - nonce;
        if behind >= REPLAY_WINDOW_BITS {
            return Err(CryptoError::ReplayedNonce);
        }
        let bit = 1u64 << behind;
        if self.seen & bit != 0 {
            return Err(CryptoError::ReplayedNonce);
        }
        self.seen |= bit;
        Ok(())
    }
}

/// Encrypts outbound packets and authenticates inbound ones for one session.
///
/// Holds independent send/receive keys (the handshake derives one key per
/// direction so a compromise of one direction's counter never helps an
/// attacker forge the other) plus the monotonic send counter and the
/// receiver's replay window.
#[derive(ZeroizeOnDrop)]
pub struct SessionCipher {
    send_key: AeadKey,
    recv_key: AeadKey,
    send_counter: u64,
    #[zeroize(skip)]
    replay: ReplayWindow,
}

impl SessionCipher {
    /// Build a session cipher from its two directional keys.
    #[must_use]
    pub fn new(send_key: AeadKey, recv_key: AeadKey) -> Self {
        Self {
            send_key,
            recv_key,
            send_counter: 0,
            replay: ReplayWindow::default(),
        }
    }

    fn associated_data(packet_type: u8, session_id: &[u8; 16]) -> [u8; 17] {
        let mut aad = [0u8; 17];
        aad[0] = packet_type;
        aad[1..].copy_from_slice(session_id);
        aad
    }

    /// Encrypt a packet body, returning the wire nonce counter alongside the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] once the 64-bit send counter is exhausted;
    /// mid-session rekeying is out of scope, so the caller must close the session instead.
    pub fn encrypt(
        &mut self,
        packet_type: u8,
        session_id: &[u8; 16],
        plaintext: &[u8],
    ) -> Result<(u64, Vec<u8>), CryptoError> {
        let counter = self
            .send_counter
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;
        let aad = Self::associated_data(packet_type, session_id);
        let ciphertext = self
            .send_key
            .cipher()
            .encrypt(
                &expand_nonce(counter).into(),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.send_counter = counter;
        Ok((counter, ciphertext))
    }

    /// Authenticate and decrypt an inbound packet body.
    ///
    /// Authentication is checked before the replay window is touched, so a forged
    /// packet with an invalid tag never perturbs session state (only successfully
    /// authenticated, but already-seen, packets are rejected as replays).
    ///
    /// # Errors
    ///
    /// [`CryptoError::DecryptionFailed`] on a bad tag, [`CryptoError::ReplayedNonce`]
    /// if the nonce is outside the acceptance window or already marked seen.
    pub fn decrypt(
        &mut self,
        packet_type: u8,
        session_id: &[u8; 16],
        nonce_counter: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aad = Self::associated_data(packet_type, session_id);
        let plaintext = self
            .recv_key
            .cipher()
            .decrypt(
                &expand_nonce(nonce_counter).into(),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        self.replay.check_and_update(nonce_counter)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (AeadKey, AeadKey) {
        (AeadKey::new([0x11; 32]), AeadKey::new([0x22; 32]))
    }

    #[test]
    fn roundtrip_between_two_peers() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (nonce, ct) = client.encrypt(0x10, &session_id, b"hello").unwrap();
        let pt = server.decrypt(0x10, &session_id, nonce, &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn tamper_detected() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (nonce, mut ct) = client.encrypt(0x10, &session_id, b"hello").unwrap();
        ct[0] ^= 0xff;
        assert!(server.decrypt(0x10, &session_id, nonce, &ct).is_err());
    }

    #[test]
    fn wrong_session_id_in_aad_rejected() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);

        let (nonce, ct) = client.encrypt(0x10, &[1u8; 16], b"hello").unwrap();
        assert!(server.decrypt(0x10, &[2u8; 16], nonce, &ct).is_err());
    }

    #[test]
    fn replayed_nonce_rejected_after_successful_decrypt() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (nonce, ct) = client.encrypt(0x10, &session_id, b"hello").unwrap();
        assert!(server.decrypt(0x10, &session_id, nonce, &ct).is_ok());
        assert!(matches!(
            server.decrypt(0x10, &session_id, nonce, &ct),
            Err(CryptoError::ReplayedNonce)
        ));
    }

    #[test]
    fn invalid_tag_does_not_consume_replay_window() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (nonce, mut forged) = client.encrypt(0x10, &session_id, b"hello").unwrap();
        forged[0] ^= 0xff;
        assert!(server.decrypt(0x10, &session_id, nonce, &forged).is_err());

        // A legitimate packet at the same nonce still decrypts: the forged
        // attempt above never touched replay state.
        let (nonce2, ct2) = client.encrypt(0x10, &session_id, b"hello").unwrap();
        assert_eq!(nonce2, nonce);
        assert!(server.decrypt(0x10, &session_id, nonce2, &ct2).is_ok());
    }

    #[test]
    fn out_of_order_within_window_accepted() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (n1, ct1) = client.encrypt(0x10, &session_id, b"one").unwrap();
        let (n2, ct2) = client.encrypt(0x10, &session_id, b"two").unwrap();

        // Deliver out of order: 2 before 1.
        assert!(server.decrypt(0x10, &session_id, n2, &ct2).is_ok());
        assert!(server.decrypt(0x10, &session_id, n1, &ct1).is_ok());
    }

    #[test]
    fn old_nonce_outside_window_rejected() {
        let (a, b) = keypair();
        let mut client = SessionCipher::new(a.clone(), b.clone());
        let mut server = SessionCipher::new(b, a);
        let session_id = [7u8; 16];

        let (n1, ct1) = client.encrypt(0x10, &session_id, b"first").unwrap();
        for _ in 0..100 {
            let (_, _) = client.encrypt(0x10, &session_id, b"filler").unwrap();
        }
        let (n_last, ct_last) = client.encrypt(0x10, &session_id, b"last").unwrap();
        assert!(server.decrypt(0x10, &session_id, n_last, &ct_last).is_ok());
        assert!(matches!(
            server.decrypt(0x10, &session_id, n1, &ct1),
            Err(CryptoError::ReplayedNonce)
        ));
    }
}
