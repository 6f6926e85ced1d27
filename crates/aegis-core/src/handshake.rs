//! The 4-message signed-ephemeral-DH handshake.
//!
//! `ClientHello -> ServerHello -> ClientFinish -> ServerWelcome`. Ties
//! together `aegis-crypto`'s X25519/Ed25519/KDF primitives with the wire
//! types in [`crate::frame`] to authenticate the server's long-term identity
//! and derive a fresh, per-direction session key pair. See spec section 4.1.

use crate::error::Error;
use crate::frame::{ClientHello, ServerHello, PROTOCOL_VERSION};
use crate::ids::SessionId;
use aegis_crypto::aead::{AeadKey, SessionCipher};
use aegis_crypto::hash::Kdf;
use aegis_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use aegis_crypto::x25519::{PrivateKey, PublicKey};
use rand_core::OsRng;

const SESSION_KEY_CONTEXT: &str = "aegis-session-key";

/// Build the transcript the server signs and the client verifies:
/// `clientRandom || serverRandom || clientEphemeralPub || serverEphemeralPub || SessionId`.
fn transcript(
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    client_ephemeral_pub: &[u8; 32],
    server_ephemeral_pub: &[u8; 32],
    session_id: &SessionId,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 32 + 32 + 32 + 16);
    out.extend_from_slice(client_random);
    out.extend_from_slice(server_random);
    out.extend_from_slice(client_ephemeral_pub);
    out.extend_from_slice(server_ephemeral_pub);
    out.extend_from_slice(session_id.as_bytes());
    out
}

/// Derive the two directional AEAD keys from the shared DH secret and the
/// handshake's two randoms. Client-to-server and server-to-client each get
/// an independently-derived key so a counter compromise in one direction
/// can't be used to forge the other.
fn derive_session_keys(
    shared_secret: &[u8; 32],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> (AeadKey, AeadKey) {
    let mut ikm = Vec::with_capacity(32 + 32 + 32);
    ikm.extend_from_slice(shared_secret);
    ikm.extend_from_slice(client_random);
    ikm.extend_from_slice(server_random);

    let client_to_server = Kdf::new(SESSION_KEY_CONTEXT).derive_key(&[&ikm[..], b"c2s"].concat());
    let server_to_client = Kdf::new(SESSION_KEY_CONTEXT).derive_key(&[&ikm[..], b"s2c"].concat());
    (AeadKey::new(client_to_server), AeadKey::new(server_to_client))
}

/// Client-side handshake state between sending `ClientHello` and receiving `ServerHello`.
pub struct ClientHandshake {
    ephemeral_private: PrivateKey,
    client_random: [u8; 32],
}

/// What the client has after a valid `ServerHello`: the session is cryptographically
/// established but `ClientFinish` has not yet been sent.
pub struct ClientEstablished {
    /// The minted SessionId from the packet header carrying `ServerHello`.
    pub session_id: SessionId,
    /// Cipher with client-to-server as the send key, server-to-client as the receive key.
    pub cipher: SessionCipher,
}

impl ClientHandshake {
    /// Begin a handshake, generating a fresh ephemeral keypair and client random.
    ///
    /// # Errors
    ///
    /// Propagates OS CSPRNG failure.
    pub fn start() -> Result<(Self, ClientHello), Error> {
        let ephemeral_private = PrivateKey::generate(&mut OsRng);
        let mut client_random = [0u8; 32];
        aegis_crypto::random::fill_random(&mut client_random)?;
        let hello = ClientHello {
            version: PROTOCOL_VERSION,
            client_ephemeral_pub: ephemeral_private.public_key().to_bytes(),
            client_random,
        };
        Ok((
            Self {
                ephemeral_private,
                client_random,
            },
            hello,
        ))
    }

    /// Process the server's `ServerHello`, verifying its signature and deriving
    /// the session keys.
    ///
    /// # Errors
    ///
    /// [`Error::SignatureInvalid`] if the server's signature does not verify.
    /// [`Error::HandshakeFailure`] if the DH exchange produces a degenerate secret.
    pub fn finish(
        self,
        session_id: SessionId,
        server_hello: &ServerHello,
        server_identity: &VerifyingKey,
    ) -> Result<ClientEstablished, Error> {
        let client_ephemeral_pub = self.ephemeral_private.public_key().to_bytes();
        let message = transcript(
            &self.client_random,
            &server_hello.server_random,
            &client_ephemeral_pub,
            &server_hello.server_ephemeral_pub,
            &session_id,
        );
        let signature = Signature::from_bytes(server_hello.signature);
        server_identity
            .verify(&message, &signature)
            .map_err(|_| Error::SignatureInvalid)?;

        let server_ephemeral_pub = PublicKey::from_bytes(server_hello.server_ephemeral_pub);
        let shared = self
            .ephemeral_private
            .exchange(&server_ephemeral_pub)
            .ok_or_else(|| Error::HandshakeFailure("degenerate shared secret".into()))?;

        let (c2s, s2c) =
            derive_session_keys(shared.as_bytes(), &self.client_random, &server_hello.server_random);
        Ok(ClientEstablished {
            session_id,
            cipher: SessionCipher::new(c2s, s2c),
        })
    }
}

/// Server-side response to a `ClientHello`: the `ServerHello` to send plus the
/// session state to hold once the client's `ClientFinish` is authenticated.
pub struct ServerResponse {
    /// The `ServerHello` body to send (in the clear, with the new SessionId as the
    /// packet header).
    pub server_hello: ServerHello,
    /// Established cipher, ready to decrypt the client's `ClientFinish`.
    pub cipher: SessionCipher,
}

/// Process a `ClientHello`, minting a session and signing the transcript with the
/// server's long-term identity key.
///
/// # Errors
///
/// [`Error::VersionMismatch`] if the client requested an unsupported protocol version.
/// Propagates OS CSPRNG failure.
pub fn respond_to_client_hello(
    session_id: SessionId,
    client_hello: &ClientHello,
    server_identity: &SigningKey,
) -> Result<ServerResponse, Error> {
    if client_hello.version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch);
    }

    let ephemeral_private = PrivateKey::generate(&mut OsRng);
    let mut server_random = [0u8; 32];
    aegis_crypto::random::fill_random(&mut server_random)?;

    let server_ephemeral_pub = ephemeral_private.public_key().to_bytes();
    let message = transcript(
        &client_hello.client_random,
        &server_random,
        &client_hello.client_ephemeral_pub,
        &server_ephemeral_pub,
        &session_id,
    );
    let signature = server_identity.sign(&message);

    let client_ephemeral_pub = PublicKey::from_bytes(client_hello.client_ephemeral_pub);
    let shared = ephemeral_private
        .exchange(&client_ephemeral_pub)
        .ok_or_else(|| Error::HandshakeFailure("degenerate shared secret".into()))?;

    let (c2s, s2c) =
        derive_session_keys(shared.as_bytes(), &client_hello.client_random, &server_random);
    // The server receives on c2s and sends on s2c — the mirror of the client's cipher.
    let cipher = SessionCipher::new(s2c, c2s);

    Ok(ServerResponse {
        server_hello: ServerHello {
            server_ephemeral_pub,
            server_random,
            signature: *signature.as_bytes(),
        },
        cipher,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_matching_keys() {
        let server_identity = SigningKey::generate(&mut OsRng);
        let server_verifying = server_identity.verifying_key();

        let (client_hs, client_hello) = ClientHandshake::start().unwrap();
        let session_id = SessionId::generate().unwrap();
        let response = respond_to_client_hello(session_id, &client_hello, &server_identity).unwrap();

        let mut client_established = client_hs
            .finish(session_id, &response.server_hello, &server_verifying)
            .unwrap();

        let mut server_cipher = response.cipher;
        let (nonce, ct) = client_established
            .cipher
            .encrypt(0x03, session_id.as_bytes(), b"finish")
            .unwrap();
        let pt = server_cipher
            .decrypt(0x03, session_id.as_bytes(), nonce, &ct)
            .unwrap();
        assert_eq!(pt, b"finish");
    }

    #[test]
    fn wrong_server_identity_rejected() {
        let server_identity = SigningKey::generate(&mut OsRng);
        let attacker_identity = SigningKey::generate(&mut OsRng);
        let attacker_verifying = attacker_identity.verifying_key();

        let (client_hs, client_hello) = ClientHandshake::start().unwrap();
        let session_id = SessionId::generate().unwrap();
        let response = respond_to_client_hello(session_id, &client_hello, &server_identity).unwrap();

        let result = client_hs.finish(session_id, &response.server_hello, &attacker_verifying);
        assert!(matches!(result, Err(Error::SignatureInvalid)));
    }

    #[test]
    fn version_mismatch_rejected() {
        let server_identity = SigningKey::generate(&mut OsRng);
        let (_client_hs, mut client_hello) = ClientHandshake::start().unwrap();
        client_hello.version = PROTOCOL_VERSION + 1;
        let session_id = SessionId::generate().unwrap();
        let result = respond_to_client_hello(session_id, &client_hello, &server_identity);
        assert!(matches!(result, Err(Error::VersionMismatch)));
    }

    #[test]
    fn tampered_session_id_breaks_signature() {
        let server_identity = SigningKey::generate(&mut OsRng);
        let server_verifying = server_identity.verifying_key();

        let (client_hs, client_hello) = ClientHandshake::start().unwrap();
        let session_id = SessionId::generate().unwrap();
        let response = respond_to_client_hello(session_id, &client_hello, &server_identity).unwrap();

        let wrong_session_id = SessionId::generate().unwrap();
        let result = client_hs.finish(wrong_session_id, &response.server_hello, &server_verifying);
        assert!(matches!(result, Err(Error::SignatureInvalid)));
    }
}
