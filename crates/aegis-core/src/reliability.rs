//! Reliable and unreliable message delivery over one [`Session`].
//!
//! This is the heart of the transport: sequencing reliable sends, buffering
//! out-of-order arrivals, emitting cumulative + selective acks, and driving
//! exponential-backoff retransmission. Everything here operates on a single
//! session at a time; the server/client orchestration layer is responsible
//! for calling these functions for the right session as datagrams and timer
//! ticks arrive.

use crate::error::Error;
use crate::frame::{self, AckBody, DataBody, DisconnectReason, PacketType, MAX_SELECTIVE_ACKS};
use crate::session::Session;
use std::time::Instant;
use tracing::{trace, warn};

/// Delivery mode requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Strict send-order, exactly-once delivery, retransmitted until acked or abandoned.
    Reliable,
    /// Best-effort, unordered relative to other unreliable sends, never retransmitted.
    Unreliable,
}

/// An encrypted packet ready to hand to the `Network` port, plus where it goes.
pub struct OutboundPacket {
    /// Encrypted, fully framed bytes.
    pub bytes: Vec<u8>,
}

/// A decoded inbound message delivered to the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The `Protocol`-assigned stable tag of the message type.
    pub message_tag: u16,
    /// Opaque payload bytes for the `Protocol` decoder.
    pub payload: Vec<u8>,
}

/// Build and record a reliable `Data` send, returning the packet to transmit.
///
/// # Errors
///
/// [`Error::MessageTooLarge`] if `payload` exceeds `maxMessageSize`.
/// [`Error::QueueOverflow`] if the pending-ack queue is already full.
pub fn send_reliable(session: &mut Session, message_tag: u16, payload: &[u8]) -> Result<OutboundPacket, Error> {
    guard_sendable(session, payload)?;
    let seq = session.take_next_send_seq();
    let body = DataBody {
        seq,
        reliable: true,
        message_tag,
        payload: payload.to_vec(),
    }
    .encode();
    let session_id = session.id();
    let (nonce, ciphertext) = session
        .cipher_mut()
        .encrypt(PacketType::Data as u8, session_id.as_bytes(), &body)?;
    let bytes = frame::encode_encrypted_packet(PacketType::Data, session.id(), nonce, &ciphertext);
    session.enqueue_pending_ack(seq, bytes.clone())?;
    session.touch_sent();
    Ok(OutboundPacket { bytes })
}

/// Build an unreliable `Data` send. Consumes no sequence space and is never
/// recorded for retransmission.
///
/// # Errors
///
/// Same as [`send_reliable`] except queue overflow cannot occur.
pub fn send_unreliable(session: &mut Session, message_tag: u16, payload: &[u8]) -> Result<OutboundPacket, Error> {
    guard_sendable(session, payload)?;
    let body = DataBody {
        seq: 0,
        reliable: false,
        message_tag,
        payload: payload.to_vec(),
    }
    .encode();
    let session_id = session.id();
    let (nonce, ciphertext) = session
        .cipher_mut()
        .encrypt(PacketType::Data as u8, session_id.as_bytes(), &body)?;
    let bytes = frame::encode_encrypted_packet(PacketType::Data, session.id(), nonce, &ciphertext);
    session.touch_sent();
    Ok(OutboundPacket { bytes })
}

fn guard_sendable(session: &Session, payload: &[u8]) -> Result<(), Error> {
    if payload.len() > session.config().max_message_size {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: session.config().max_message_size,
        });
    }
    Ok(())
}

/// Outcome of processing an inbound `Data` body.
pub struct ReceiveOutcome {
    /// Messages now ready for dispatch, in ascending seq order (for reliable
    /// deliveries this is always a contiguous run ending at the new `last_in_seq`;
    /// unreliable deliveries are always a single-element vec).
    pub deliverable: Vec<InboundMessage>,
    /// The ack to send back, if this was a reliable `Data` packet. Unreliable
    /// sends are never acked (nothing to acknowledge: delivery is best-effort).
    pub ack: Option<AckBody>,
}

/// Handle a decrypted, authenticated `Data` body.
///
/// Implements spec's in-order/buffer/ignore-duplicate logic: a reliable packet
/// exactly at `last_in_seq + 1` is delivered immediately and then the reorder
/// buffer is drained for any now-contiguous run; a packet further ahead is
/// buffered; a packet at or behind `last_in_seq` is a duplicate and dropped
/// (but still acked, so the sender's retransmission eventually stops).
pub fn on_receive_data(session: &mut Session, body: DataBody) -> ReceiveOutcome {
    if !body.reliable {
        return ReceiveOutcome {
            deliverable: vec![InboundMessage {
                message_tag: body.message_tag,
                payload: body.payload,
            }],
            ack: None,
        };
    }

    let mut deliverable = Vec::new();
    let last_in_seq = session.last_in_seq();

    if body.seq <= last_in_seq {
        trace!(session = %session.id(), seq = body.seq, last_in_seq, "dropping duplicate reliable data");
    } else if body.seq == last_in_seq + 1 {
        deliverable.push(InboundMessage {
            message_tag: body.message_tag,
            payload: body.payload,
        });
        session.advance_last_in_seq(body.seq);
        drain_reorder_buffer(session, &mut deliverable);
    } else {
        session
            .reorder_buffer_mut()
            .entry(body.seq)
            .or_insert_with(|| encode_buffered(&body));
    }

    let ack = Some(build_ack(session));
    ReceiveOutcome { deliverable, ack }
}

fn encode_buffered(body: &DataBody) -> Vec<u8> {
    // Store message_tag:2 | payload so the drain loop can reconstruct an InboundMessage.
    let mut buf = Vec::with_capacity(2 + body.payload.len());
    buf.extend_from_slice(&body.message_tag.to_be_bytes());
    buf.extend_from_slice(&body.payload);
    buf
}

fn decode_buffered(bytes: &[u8]) -> InboundMessage {
    let message_tag = u16::from_be_bytes([bytes[0], bytes[1]]);
    InboundMessage {
        message_tag,
        payload: bytes[2..].to_vec(),
    }
}

fn drain_reorder_buffer(session: &mut Session, deliverable: &mut Vec<InboundMessage>) {
    loop {
        let next = session.last_in_seq() + 1;
        let Some(bytes) = session.reorder_buffer_mut().remove(&next) else {
            break;
        };
        deliverable.push(decode_buffered(&bytes));
        session.advance_last_in_seq(next);
    }
}

fn build_ack(session: &mut Session) -> AckBody {
    let up_to = session.last_in_seq();
    let selective: Vec<u32> = session
        .reorder_buffer_mut()
        .keys()
        .copied()
        .take(MAX_SELECTIVE_ACKS)
        .collect();
    AckBody { up_to, selective }
}

/// Encrypt and frame an `Ack` packet for the given body.
///
/// # Errors
///
/// Propagates AEAD encryption failure (nonce exhaustion).
pub fn encode_ack(session: &mut Session, ack: &AckBody) -> Result<OutboundPacket, Error> {
    let plaintext = ack.encode();
    let session_id = session.id();
    let (nonce, ciphertext) =
        session
            .cipher_mut()
            .encrypt(PacketType::Ack as u8, session_id.as_bytes(), &plaintext)?;
    let bytes = frame::encode_encrypted_packet(PacketType::Ack, session.id(), nonce, &ciphertext);
    session.touch_sent();
    Ok(OutboundPacket { bytes })
}

/// Apply an inbound `Ack`: remove acknowledged pending sends and reset their
/// retransmit backoff (removal is the reset — there is nothing left to back off).
pub fn on_receive_ack(session: &mut Session, ack: AckBody) {
    session.apply_ack(ack.up_to, &ack.selective);
}

/// Build a `Heartbeat` packet, for when nothing else has been sent within
/// `heartbeatInterval`.
///
/// # Errors
///
/// Propagates AEAD encryption failure.
pub fn build_heartbeat(session: &mut Session) -> Result<OutboundPacket, Error> {
    let session_id = session.id();
    let (nonce, ciphertext) =
        session
            .cipher_mut()
            .encrypt(PacketType::Heartbeat as u8, session_id.as_bytes(), &[])?;
    let bytes = frame::encode_encrypted_packet(PacketType::Heartbeat, session.id(), nonce, &ciphertext);
    session.touch_sent();
    Ok(OutboundPacket { bytes })
}

/// Result of one retransmission timer sweep over a session's pending-ack queue.
pub struct RetransmitOutcome {
    /// Packets that need to be resent verbatim.
    pub retransmits: Vec<OutboundPacket>,
    /// Set if a pending send exhausted `maxRetransmitAttempts`; the session
    /// should be closed with this reason.
    pub give_up: Option<DisconnectReason>,
}

/// Walk the pending-ack queue, resending anything whose backoff has elapsed and
/// doubling its backoff (capped), per spec section 4.2.
#[must_use]
pub fn retransmit_tick(session: &mut Session, now: Instant) -> RetransmitOutcome {
    let max_attempts = session.config().max_retransmit_attempts;
    let due_seqs: Vec<u32> = session
        .pending_acks()
        .iter()
        .filter(|(_, pending)| now.duration_since(pending.last_sent_at) >= pending.backoff)
        .map(|(&seq, _)| seq)
        .collect();

    let mut retransmits = Vec::new();
    let mut give_up = None;

    for seq in due_seqs {
        let Some(pending) = session.pending_acks_mut().get_mut(&seq) else {
            continue;
        };
        if pending.attempts >= max_attempts {
            warn!(session = %session.id(), seq, "reliable send abandoned after max retransmit attempts");
            give_up = Some(DisconnectReason::Timeout);
            break;
        }
        pending.attempts += 1;
        pending.last_sent_at = now;
        pending.backoff = (pending.backoff * 2).min(crate::session::MAX_RETRANSMIT_BACKOFF);
        retransmits.push(OutboundPacket {
            bytes: pending.payload.clone(),
        });
    }

    RetransmitOutcome {
        retransmits,
        give_up,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use crate::session::SessionConfig;
    use aegis_crypto::aead::{AeadKey, SessionCipher};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn pair() -> (Session, Session) {
        let id = SessionId::generate().unwrap();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let a = AeadKey::new([1; 32]);
        let b = AeadKey::new([2; 32]);
        let client = Session::new(id, addr, SessionCipher::new(a.clone(), b.clone()), SessionConfig::default());
        let server = Session::new(id, addr, SessionCipher::new(b, a), SessionConfig::default());
        (client, server)
    }

    fn decrypt_data(server: &mut Session, packet: &OutboundPacket) -> DataBody {
        let (header, rest) = frame::PacketHeader::parse(&packet.bytes).unwrap();
        let (nonce, ct) = frame::split_nonce(rest).unwrap();
        let pt = server
            .cipher_mut()
            .decrypt(header.packet_type as u8, header.session_id.as_bytes(), nonce, ct)
            .unwrap();
        DataBody::decode(&pt).unwrap()
    }

    #[test]
    fn reliable_send_assigns_sequential_seq_and_queues() {
        let (mut client, _server) = pair();
        let p1 = send_reliable(&mut client, 1, b"a").unwrap();
        let p2 = send_reliable(&mut client, 1, b"b").unwrap();
        assert_eq!(client.pending_acks().len(), 2);
        assert!(!p1.bytes.is_empty());
        assert!(!p2.bytes.is_empty());
    }

    #[test]
    fn unreliable_send_consumes_no_sequence_and_is_not_queued() {
        let (mut client, _server) = pair();
        send_unreliable(&mut client, 1, b"a").unwrap();
        assert_eq!(client.next_send_seq(), 1);
        assert!(client.pending_acks().is_empty());
    }

    #[test]
    fn message_too_large_rejected() {
        let (mut client, _server) = pair();
        client.config_mut().max_message_size = 4;
        assert!(matches!(
            send_reliable(&mut client, 1, b"too long"),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn in_order_delivery_and_ack() {
        let (mut client, mut server) = pair();
        let packet = send_reliable(&mut client, 1, b"hello").unwrap();
        let body = decrypt_data(&mut server, &packet);
        let outcome = on_receive_data(&mut server, body);
        assert_eq!(outcome.deliverable.len(), 1);
        assert_eq!(outcome.deliverable[0].payload, b"hello");
        assert_eq!(outcome.ack.unwrap().up_to, 1);
    }

    #[test]
    fn out_of_order_buffers_then_drains() {
        let (mut client, mut server) = pair();
        let p1 = send_reliable(&mut client, 1, b"one").unwrap();
        let p2 = send_reliable(&mut client, 1, b"two").unwrap();
        let p3 = send_reliable(&mut client, 1, b"three").unwrap();

        let b2 = decrypt_data(&mut server, &p2);
        let out2 = on_receive_data(&mut server, b2);
        assert!(out2.deliverable.is_empty());
        assert_eq!(out2.ack.unwrap().selective, vec![2]);

        let b3 = decrypt_data(&mut server, &p3);
        let out3 = on_receive_data(&mut server, b3);
        assert!(out3.deliverable.is_empty());

        let b1 = decrypt_data(&mut server, &p1);
        let out1 = on_receive_data(&mut server, b1);
        assert_eq!(out1.deliverable.len(), 3);
        assert_eq!(out1.deliverable[0].payload, b"one");
        assert_eq!(out1.deliverable[1].payload, b"two");
        assert_eq!(out1.deliverable[2].payload, b"three");
        assert_eq!(server.last_in_seq(), 3);
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let (mut client, mut server) = pair();
        let p1 = send_reliable(&mut client, 1, b"one").unwrap();
        let b1 = decrypt_data(&mut server, &p1);
        let out1 = on_receive_data(&mut server, b1.clone());
        assert_eq!(out1.deliverable.len(), 1);
        let out1_dup = on_receive_data(&mut server, b1);
        assert!(out1_dup.deliverable.is_empty());
    }

    #[test]
    fn ack_removes_pending_sends() {
        let (mut client, _server) = pair();
        send_reliable(&mut client, 1, b"one").unwrap();
        send_reliable(&mut client, 1, b"two").unwrap();
        on_receive_ack(&mut client, AckBody { up_to: 1, selective: vec![] });
        assert_eq!(client.pending_acks().len(), 1);
        assert!(client.pending_acks().contains_key(&2));
    }

    #[test]
    fn retransmit_tick_resends_after_backoff_and_doubles() {
        let (mut client, _server) = pair();
        send_reliable(&mut client, 1, b"one").unwrap();
        let immediate = retransmit_tick(&mut client, Instant::now());
        assert!(immediate.retransmits.is_empty());

        let later = Instant::now() + crate::session::DEFAULT_RETRANSMIT_TICK;
        let outcome = retransmit_tick(&mut client, later);
        assert_eq!(outcome.retransmits.len(), 1);
        assert_eq!(client.pending_acks().get(&1).unwrap().attempts, 2);
    }

    #[test]
    fn retransmit_gives_up_after_max_attempts() {
        let (mut client, _server) = pair();
        client.config_mut().max_retransmit_attempts = 1;
        send_reliable(&mut client, 1, b"one").unwrap();
        let later = Instant::now() + crate::session::MAX_RETRANSMIT_BACKOFF * 2;
        let outcome = retransmit_tick(&mut client, later);
        assert!(matches!(outcome.give_up, Some(DisconnectReason::Timeout)));
    }
}
