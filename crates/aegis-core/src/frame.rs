//! Wire framing.
//!
//! A packet is `[1-byte type][16-byte SessionId or zero][body]`. Bodies of
//! `Data`, `Ack`, `Heartbeat`, `Disconnect`, `ServerWelcome`, and `ClientFinish`
//! are authenticated-encrypted with the session key once one exists; `ClientHello`
//! and `ServerHello` travel in the clear, as does a `Disconnect` sent before any
//! session key is derived (a version mismatch or a connection-limit rejection).
//! All multi-byte integers are big-endian.
//!
//! This module only encodes and parses bytes. It does not touch AEAD state or
//! session tables — see [`crate::handshake`] for the handshake transcript and
//! [`crate::session`] for what happens to a parsed body.

use crate::error::Error;
use crate::ids::SessionId;

/// Fixed header size: 1-byte type tag plus a 16-byte SessionId.
pub const HEADER_SIZE: usize = 17;

/// Nonce counter width carried on the wire ahead of every AEAD body.
pub const NONCE_SIZE: usize = 8;

/// Default maximum datagram size, chosen to fit a typical MTU without fragmentation.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Cap on selective-ack entries in a single `Ack` packet.
pub const MAX_SELECTIVE_ACKS: usize = 32;

/// Current wire protocol version, sent in the clear in `ClientHello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// `Data` bit set in [`DataBody::flags`] when the message was sent reliably.
const FLAG_RELIABLE: u8 = 0b0000_0001;

/// Packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Client -> Server, pre-session, cleartext.
    ClientHello = 0x01,
    /// Server -> Client, pre-session, cleartext.
    ServerHello = 0x02,
    /// Client -> Server, encrypted.
    ClientFinish = 0x03,
    /// Server -> Client, encrypted.
    ServerWelcome = 0x04,
    /// Data packet, encrypted.
    Data = 0x10,
    /// Acknowledgement, encrypted.
    Ack = 0x11,
    /// Heartbeat, encrypted.
    Heartbeat = 0x12,
    /// Graceful or rejecting close. Encrypted once a session exists, cleartext
    /// when rejecting a `ClientHello` (version mismatch, connection limit).
    Disconnect = 0x13,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::ClientHello),
            0x02 => Ok(PacketType::ServerHello),
            0x03 => Ok(PacketType::ClientFinish),
            0x04 => Ok(PacketType::ServerWelcome),
            0x10 => Ok(PacketType::Data),
            0x11 => Ok(PacketType::Ack),
            0x12 => Ok(PacketType::Heartbeat),
            0x13 => Ok(PacketType::Disconnect),
            other => Err(Error::MalformedPacket(format!(
                "unknown packet type 0x{other:02x}"
            ))),
        }
    }
}

/// The cleartext header every packet starts with.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Packet type tag.
    pub packet_type: PacketType,
    /// SessionId, or [`SessionId::ZERO`] for pre-session packets.
    pub session_id: SessionId,
}

impl PacketHeader {
    /// Encode the header's fixed bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.packet_type as u8;
        out[1..].copy_from_slice(self.session_id.as_bytes());
        out
    }

    /// Parse the header and return the remaining bytes (nonce + body, if any).
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] if the buffer is too short or the type byte
    /// is unrecognized.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket(format!(
                "packet too short: {} bytes, need at least {HEADER_SIZE}",
                bytes.len()
            )));
        }
        let packet_type = PacketType::try_from(bytes[0])?;
        let mut session_id_bytes = [0u8; 16];
        session_id_bytes.copy_from_slice(&bytes[1..HEADER_SIZE]);
        let header = PacketHeader {
            packet_type,
            session_id: SessionId::from_bytes(session_id_bytes),
        };
        Ok((header, &bytes[HEADER_SIZE..]))
    }
}

/// Prefix an AEAD body with its nonce counter and assemble the full packet.
#[must_use]
pub fn encode_encrypted_packet(
    packet_type: PacketType,
    session_id: SessionId,
    nonce: u64,
    ciphertext: &[u8],
) -> Vec<u8> {
    let header = PacketHeader {
        packet_type,
        session_id,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&nonce.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Split the nonce counter and ciphertext out of the bytes following a parsed header.
///
/// # Errors
///
/// [`Error::MalformedPacket`] if fewer than [`NONCE_SIZE`] bytes remain.
pub fn split_nonce(rest: &[u8]) -> Result<(u64, &[u8]), Error> {
    if rest.len() < NONCE_SIZE {
        return Err(Error::MalformedPacket("packet missing nonce".into()));
    }
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&rest[..NONCE_SIZE]);
    Ok((u64::from_be_bytes(nonce_bytes), &rest[NONCE_SIZE..]))
}

/// Cleartext `ClientHello` body.
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// Wire protocol version requested by the client.
    pub version: u16,
    /// Client's ephemeral X25519 public key.
    pub client_ephemeral_pub: [u8; 32],
    /// 32 bytes of client-chosen randomness, binding the transcript against replay.
    pub client_random: [u8; 32],
}

impl ClientHello {
    /// Encode the body (the caller prepends the cleartext header).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 32 + 32);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.client_ephemeral_pub);
        out.extend_from_slice(&self.client_random);
        out
    }

    /// Decode a body.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] if the body is the wrong length.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 66 {
            return Err(Error::MalformedPacket(format!(
                "ClientHello body wrong length: {}",
                bytes.len()
            )));
        }
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        let mut client_ephemeral_pub = [0u8; 32];
        client_ephemeral_pub.copy_from_slice(&bytes[2..34]);
        let mut client_random = [0u8; 32];
        client_random.copy_from_slice(&bytes[34..66]);
        Ok(Self {
            version,
            client_ephemeral_pub,
            client_random,
        })
    }
}

/// Cleartext `ServerHello` body. The minted SessionId travels in the packet header,
/// not duplicated here.
#[derive(Debug, Clone)]
pub struct ServerHello {
    /// Server's ephemeral X25519 public key.
    pub server_ephemeral_pub: [u8; 32],
    /// 32 bytes of server-chosen randomness.
    pub server_random: [u8; 32],
    /// Ed25519 signature over `clientRandom || serverRandom || bothEphemeralPubs || SessionId`,
    /// made with the server's long-term identity key.
    pub signature: [u8; 64],
}

impl ServerHello {
    /// Encode the body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 64);
        out.extend_from_slice(&self.server_ephemeral_pub);
        out.extend_from_slice(&self.server_random);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode a body.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] if the body is the wrong length.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 128 {
            return Err(Error::MalformedPacket(format!(
                "ServerHello body wrong length: {}",
                bytes.len()
            )));
        }
        let mut server_ephemeral_pub = [0u8; 32];
        server_ephemeral_pub.copy_from_slice(&bytes[0..32]);
        let mut server_random = [0u8; 32];
        server_random.copy_from_slice(&bytes[32..64]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[64..128]);
        Ok(Self {
            server_ephemeral_pub,
            server_random,
            signature,
        })
    }
}

/// Decrypted `Data` packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    /// Sequence number; zero for unreliable sends (unreliable consumes no sequence space).
    pub seq: u32,
    /// Whether this was sent reliably.
    pub reliable: bool,
    /// The `Protocol`-assigned stable tag of the message type this payload decodes to,
    /// carried alongside the opaque bytes so the dispatcher can route before the
    /// `Protocol` decodes the payload itself.
    pub message_tag: u16,
    /// Opaque payload bytes handed to the `Protocol` decoder.
    pub payload: Vec<u8>,
}

impl DataBody {
    /// Encode the plaintext body (the caller AEAD-encrypts it before sending).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 1 + 2 + self.payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.push(if self.reliable { FLAG_RELIABLE } else { 0 });
        out.extend_from_slice(&self.message_tag.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a plaintext body.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] if the body is shorter than the fixed prefix.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 7 {
            return Err(Error::MalformedPacket("Data body too short".into()));
        }
        let seq = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let reliable = bytes[4] & FLAG_RELIABLE != 0;
        let message_tag = u16::from_be_bytes([bytes[5], bytes[6]]);
        Ok(Self {
            seq,
            reliable,
            message_tag,
            payload: bytes[7..].to_vec(),
        })
    }
}

/// Decrypted `Ack` packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckBody {
    /// Cumulative ack: everything up to and including this sequence has been received in order.
    pub up_to: u32,
    /// Isolated sequence numbers received out of order, beyond `up_to`. Bounded to
    /// [`MAX_SELECTIVE_ACKS`] entries on encode.
    pub selective: Vec<u32>,
}

impl AckBody {
    /// Encode the plaintext body, silently truncating selective entries beyond the
    /// bound (the sender re-signals them on a later ack once the reorder buffer
    /// shifts them into range).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let n = self.selective.len().min(MAX_SELECTIVE_ACKS);
        let mut out = Vec::with_capacity(4 + 1 + 4 * n);
        out.extend_from_slice(&self.up_to.to_be_bytes());
        out.push(n as u8);
        for seq in self.selective.iter().take(n) {
            out.extend_from_slice(&seq.to_be_bytes());
        }
        out
    }

    /// Decode a plaintext body.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] if the declared count doesn't fit the buffer, or
    /// exceeds [`MAX_SELECTIVE_ACKS`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 5 {
            return Err(Error::MalformedPacket("Ack body too short".into()));
        }
        let up_to = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let n = bytes[4] as usize;
        if n > MAX_SELECTIVE_ACKS {
            return Err(Error::MalformedPacket(format!(
                "Ack selective count {n} exceeds bound {MAX_SELECTIVE_ACKS}"
            )));
        }
        if bytes.len() != 5 + 4 * n {
            return Err(Error::MalformedPacket("Ack body length mismatch".into()));
        }
        let mut selective = Vec::with_capacity(n);
        for i in 0..n {
            let start = 5 + 4 * i;
            selective.push(u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ]));
        }
        Ok(Self { up_to, selective })
    }
}

/// Typed reason a session ended, carried in the `Disconnect` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The underlying network reported a failure.
    NetworkError(String),
    /// The session was idle past `sessionTimeout` while reconnecting.
    Timeout,
    /// The server chose to evict the session.
    KickedByServer(String),
    /// A protocol-level violation was observed (bad signature, version mismatch, ...).
    ProtocolError(String),
    /// The server is shutting down.
    ServerShutdown,
}

impl DisconnectReason {
    fn tag(&self) -> u8 {
        match self {
            DisconnectReason::NetworkError(_) => 0,
            DisconnectReason::Timeout => 1,
            DisconnectReason::KickedByServer(_) => 2,
            DisconnectReason::ProtocolError(_) => 3,
            DisconnectReason::ServerShutdown => 4,
        }
    }

    fn detail(&self) -> &str {
        match self {
            DisconnectReason::NetworkError(s)
            | DisconnectReason::KickedByServer(s)
            | DisconnectReason::ProtocolError(s) => s,
            DisconnectReason::Timeout | DisconnectReason::ServerShutdown => "",
        }
    }

    /// Encode the plaintext body: `reasonTag:1 | detailLen:2 | detail:utf8`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let detail = self.detail().as_bytes();
        let mut out = Vec::with_capacity(1 + 2 + detail.len());
        out.push(self.tag());
        out.extend_from_slice(&(detail.len() as u16).to_be_bytes());
        out.extend_from_slice(detail);
        out
    }

    /// Decode a plaintext body.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPacket`] on a bad tag, truncated length prefix, or invalid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 3 {
            return Err(Error::MalformedPacket("Disconnect body too short".into()));
        }
        let tag = bytes[0];
        let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        if bytes.len() != 3 + len {
            return Err(Error::MalformedPacket(
                "Disconnect detail length mismatch".into(),
            ));
        }
        let detail = String::from_utf8(bytes[3..].to_vec())
            .map_err(|_| Error::MalformedPacket("Disconnect detail is not valid utf-8".into()))?;
        match tag {
            0 => Ok(DisconnectReason::NetworkError(detail)),
            1 => Ok(DisconnectReason::Timeout),
            2 => Ok(DisconnectReason::KickedByServer(detail)),
            3 => Ok(DisconnectReason::ProtocolError(detail)),
            4 => Ok(DisconnectReason::ServerShutdown),
            other => Err(Error::MalformedPacket(format!(
                "unknown disconnect reason tag {other}"
            ))),
        }
    }
}
