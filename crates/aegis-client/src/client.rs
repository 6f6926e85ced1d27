//! The client's single I/O task and independent timer task, driving the one
//! session a client owns through the same reliability and heartbeat logic as
//! the server side. Mirrors `aegis_server::server::Server`'s loop split; a
//! client just has one session instead of a session table, so a plain
//! `Mutex<Session>` stands in for the server's `DashMap`.

use aegis_core::dispatcher::Dispatcher;
use aegis_core::frame::{self, AckBody, DataBody, DisconnectReason, PacketHeader, PacketType, ServerHello};
use aegis_core::handshake::ClientHandshake;
use aegis_core::ids::SessionId;
use aegis_core::protocol::Protocol;
use aegis_core::reliability::{self, Delivery};
use aegis_core::session::{Session, SessionState, TimeoutOutcome};
use aegis_transport::transport::Transport;
use aegis_transport::udp_async::AsyncUdpTransport;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;

const RECV_BUFFER_SIZE: usize = 2048;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected client session bound to one server.
///
/// Generic over the transport backend so the same orchestration code runs
/// against real UDP ([`AsyncUdpTransport`]) or `aegis-transport`'s simulated
/// network under test. `connect`/`connect_over` only return once the 4-message
/// handshake has completed, so a live `Client` is always `Connected`.
pub struct Client<P: Protocol, T: Transport = AsyncUdpTransport> {
    transport: Arc<T>,
    protocol: Arc<P>,
    session_id: SessionId,
    session: Mutex<Session>,
    dispatcher: RwLock<Dispatcher<P::Message>>,
    shutdown: Notify,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Protocol> Client<P, AsyncUdpTransport> {
    /// Bind an ephemeral UDP socket and run the handshake against `config`'s
    /// server address.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] if the bind fails; see [`Self::connect_over`]
    /// for the handshake failure modes.
    pub async fn connect(config: ClientConfig<P>) -> Result<Arc<Self>, ClientError> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let transport = AsyncUdpTransport::bind(bind_addr).await?;
        Self::connect_over(Arc::new(transport), config).await
    }
}

impl<P: Protocol, T: Transport + 'static> Client<P, T> {
    /// Run the handshake over an already-bound transport, for tests running
    /// against `aegis_transport::simulated::SimulatedTransport`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] if the server declines with a cleartext
    /// `Disconnect` (e.g. version mismatch, connection limit).
    /// [`ClientError::Protocol`]`(`[`aegis_core::Error::SignatureInvalid`]`)`
    /// if `ServerHello` does not verify against the pinned server identity —
    /// per spec section 8's signature-attack scenario, no session is created
    /// on this path.
    /// [`ClientError::HandshakeTimeout`] if the server never replies.
    pub async fn connect_over(transport: Arc<T>, config: ClientConfig<P>) -> Result<Arc<Self>, ClientError> {
        let (handshake, hello) = ClientHandshake::start()?;
        let mut packet = PacketHeader {
            packet_type: PacketType::ClientHello,
            session_id: SessionId::ZERO,
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(&hello.encode());
        transport.send_to(&packet, config.server_addr()).await?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (session_id, server_hello) = loop {
            let (n, _from) = tokio::time::timeout(CONNECT_TIMEOUT, transport.recv_from(&mut buf))
                .await
                .map_err(|_| ClientError::HandshakeTimeout("ServerHello"))??;
            let Ok((header, rest)) = PacketHeader::parse(&buf[..n]) else {
                continue;
            };
            match header.packet_type {
                PacketType::ServerHello => {
                    let Ok(server_hello) = ServerHello::decode(rest) else {
                        continue;
                    };
                    break (header.session_id, server_hello);
                }
                PacketType::Disconnect => {
                    let reason = DisconnectReason::decode(rest)
                        .unwrap_or_else(|_| DisconnectReason::ProtocolError("malformed rejection".into()));
                    return Err(ClientError::Rejected(reason));
                }
                _ => continue,
            }
        };

        let established = handshake.finish(session_id, &server_hello, &config.server_identity)?;
        let mut cipher = established.cipher;

        let (nonce, ciphertext) = cipher.encrypt(PacketType::ClientFinish as u8, session_id.as_bytes(), &[])?;
        let finish_packet = frame::encode_encrypted_packet(PacketType::ClientFinish, session_id, nonce, &ciphertext);
        transport.send_to(&finish_packet, config.server_addr()).await?;

        let peer_addr = loop {
            let (n, from) = tokio::time::timeout(CONNECT_TIMEOUT, transport.recv_from(&mut buf))
                .await
                .map_err(|_| ClientError::HandshakeTimeout("ServerWelcome"))??;
            let Ok((header, rest)) = PacketHeader::parse(&buf[..n]) else {
                continue;
            };
            if header.session_id != session_id {
                continue;
            }
            match header.packet_type {
                PacketType::ServerWelcome => {
                    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
                        continue;
                    };
                    if cipher
                        .decrypt(PacketType::ServerWelcome as u8, session_id.as_bytes(), nonce, ct)
                        .is_err()
                    {
                        continue;
                    }
                    break from;
                }
                PacketType::Disconnect => {
                    let reason = DisconnectReason::decode(rest)
                        .unwrap_or_else(|_| DisconnectReason::ProtocolError("malformed rejection".into()));
                    return Err(ClientError::Rejected(reason));
                }
                _ => continue,
            }
        };

        let mut session = Session::new(session_id, peer_addr, cipher, config.session.clone());
        session.transition_to(SessionState::Connected);
        session.touch_activity();

        Ok(Arc::new(Self {
            transport,
            protocol: config.protocol,
            session_id,
            session: Mutex::new(session),
            dispatcher: RwLock::new(Dispatcher::new()),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// This client's session id, as minted by the server during the handshake.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session_id
    }

    /// Register the handler for a message tag.
    pub fn on_message(&self, tag: u16, handler: impl Fn(SessionId, &P::Message) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_message(tag, handler);
    }

    /// Register the single error sink.
    pub fn on_error(&self, sink: impl Fn(aegis_core::DispatchError) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_error(sink);
    }

    /// Register the `onDisconnected` callback (spec section 4.5).
    pub fn on_disconnected(&self, cb: impl Fn(SessionId, &DisconnectReason) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_disconnected(cb);
    }

    /// Register the `onReconnected` callback, fired once a reconnect's first
    /// authenticated packet restores `Connected` state.
    pub fn on_reconnected(&self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_reconnected(cb);
    }

    /// Register the `onExpired` callback, fired if the session goes silent
    /// past `sessionTimeout` while `Reconnecting`.
    pub fn on_expired(&self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_expired(cb);
    }

    /// Spawn the I/O loop and timer loop. Call once per client.
    pub fn start(self: &Arc<Self>) {
        let io_handle = tokio::spawn(self.clone().io_loop());
        let timer_handle = tokio::spawn(self.clone().timer_loop());
        self.tasks.lock().expect("tasks lock poisoned").extend([io_handle, timer_handle]);
    }

    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] wrapping [`aegis_core::Error::QueueOverflow`]
    /// or [`aegis_core::Error::MessageTooLarge`] if the send is rejected; per
    /// spec section 7 the session is marked for `NetworkError` disconnect in
    /// that case. Propagates transport send failures.
    pub async fn send(&self, message: &P::Message, delivery: Delivery) -> Result<(), ClientError> {
        let tag = self.protocol.tag_of(message);
        let payload = self.protocol.encode(message);

        let outcome = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let sent = match delivery {
                Delivery::Reliable => reliability::send_reliable(&mut session, tag, &payload),
                Delivery::Unreliable => reliability::send_unreliable(&mut session, tag, &payload),
            };
            match sent {
                Ok(packet) => Ok((packet.bytes, session.peer_addr())),
                Err(err @ (aegis_core::Error::QueueOverflow { .. } | aegis_core::Error::MessageTooLarge { .. })) => {
                    let reason = DisconnectReason::NetworkError(err.to_string());
                    let disconnect = encode_disconnect(&mut session, &reason);
                    let peer_addr = session.peer_addr();
                    session.close(&reason);
                    Err((err, disconnect.map(|bytes| (bytes, peer_addr)), reason))
                }
                Err(err) => {
                    let reason = DisconnectReason::NetworkError(err.to_string());
                    Err((err, None, reason))
                }
            }
        };

        match outcome {
            Ok((bytes, addr)) => {
                self.transport.send_to(&bytes, addr).await?;
                Ok(())
            }
            Err((err, disconnect, reason)) => {
                if let Some((bytes, addr)) = disconnect {
                    let _ = self.transport.send_to(&bytes, addr).await;
                }
                self.dispatcher
                    .read()
                    .expect("dispatcher lock poisoned")
                    .fire_session_disconnected(self.session_id, &reason);
                Err(ClientError::Protocol(err))
            }
        }
    }

    /// Close locally: flush a best-effort `Disconnect{ServerShutdown}`
    /// (single send, no retransmit) and stop the I/O and timer tasks.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();

        let packet = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let bytes = encode_disconnect(&mut session, &DisconnectReason::ServerShutdown);
            session.close(&DisconnectReason::ServerShutdown);
            bytes.map(|bytes| (bytes, session.peer_addr()))
        };
        if let Some((bytes, addr)) = packet {
            let _ = self.transport.send_to(&bytes, addr).await;
        }
        let _ = self.transport.close().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn io_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    debug!("client io loop shutting down");
                    break;
                }
                result = self.transport.recv_from(&mut buf) => {
                    match result {
                        Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                        Err(err) => {
                            warn!(%err, "transport recv failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let Ok((header, rest)) = PacketHeader::parse(bytes) else {
            trace!(%from, "malformed packet header dropped");
            return;
        };
        if header.session_id != self.session_id {
            trace!(%from, "packet for foreign session dropped");
            return;
        }

        let outcome = {
            let mut session = self.session.lock().expect("session lock poisoned");
            match header.packet_type {
                PacketType::Data => handle_data(&mut session, rest, from),
                PacketType::Ack => handle_ack(&mut session, rest, from),
                PacketType::Heartbeat => handle_heartbeat(&mut session, rest, from),
                PacketType::Disconnect => handle_disconnect(&mut session, rest),
                PacketType::ClientHello | PacketType::ServerHello | PacketType::ClientFinish | PacketType::ServerWelcome => {
                    warn!(packet_type = ?header.packet_type, "unexpected packet type for established session");
                    PacketOutcome::for_session(&session)
                }
            }
        };

        self.apply_outcome(outcome).await;
    }

    async fn apply_outcome(&self, outcome: PacketOutcome) {
        for bytes in &outcome.to_send {
            if let Err(err) = self.transport.send_to(bytes, outcome.peer_addr).await {
                warn!(%err, "reply send failed");
            }
        }
        if outcome.reconnected {
            self.dispatcher.read().expect("dispatcher lock poisoned").fire_session_reconnected(self.session_id);
        }
        for (tag, payload) in outcome.deliver {
            match self.protocol.decode(tag, &payload) {
                Ok(message) => self
                    .dispatcher
                    .read()
                    .expect("dispatcher lock poisoned")
                    .dispatch(self.session_id, tag, &message),
                Err(detail) => warn!(tag, detail, "protocol failed to decode payload"),
            }
        }
        if let Some(reason) = outcome.remove_with {
            self.dispatcher
                .read()
                .expect("dispatcher lock poisoned")
                .fire_session_disconnected(self.session_id, &reason);
        }
    }

    async fn timer_loop(self: Arc<Self>) {
        let tick = self.session.lock().expect("session lock poisoned").config().retransmit_tick;
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    debug!("client timer loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let Some(result) = self.sweep_session(now) else {
            return;
        };
        for bytes in &result.to_send {
            if let Err(err) = self.transport.send_to(bytes, result.peer_addr).await {
                warn!(%err, "timer send failed");
            }
        }
        if result.expire {
            self.dispatcher.read().expect("dispatcher lock poisoned").fire_session_expired(self.session_id);
        } else if let Some(reason) = result.give_up {
            if let Some(bytes) = &result.disconnect_packet {
                let _ = self.transport.send_to(bytes, result.peer_addr).await;
            }
            self.dispatcher
                .read()
                .expect("dispatcher lock poisoned")
                .fire_session_disconnected(self.session_id, &reason);
        }
    }

    fn sweep_session(&self, now: Instant) -> Option<SweepResult> {
        let mut session = self.session.lock().expect("session lock poisoned");
        if session.state() == SessionState::Closed || session.state() == SessionState::Expired {
            return None;
        }

        let mut expire = false;
        if let Some(outcome) = session.evaluate_timeout(now) {
            match outcome {
                TimeoutOutcome::BecomeReconnecting => session.transition_to(SessionState::Reconnecting),
                TimeoutOutcome::Expire => {
                    expire = true;
                    session.transition_to(SessionState::Expired);
                }
            }
        }

        let mut to_send = Vec::new();
        let mut give_up = None;
        let mut disconnect_packet = None;

        if !expire {
            let retransmit = reliability::retransmit_tick(&mut session, now);
            to_send.extend(retransmit.retransmits.into_iter().map(|pkt| pkt.bytes));
            if let Some(reason) = retransmit.give_up {
                disconnect_packet = encode_disconnect(&mut session, &reason);
                session.close(&reason);
                give_up = Some(reason);
            } else if session.state() == SessionState::Connected && session.heartbeat_due(now) {
                if let Ok(pkt) = reliability::build_heartbeat(&mut session) {
                    to_send.push(pkt.bytes);
                }
            }
        }

        Some(SweepResult {
            peer_addr: session.peer_addr(),
            to_send,
            expire,
            give_up,
            disconnect_packet,
        })
    }
}

struct SweepResult {
    peer_addr: SocketAddr,
    to_send: Vec<Vec<u8>>,
    expire: bool,
    give_up: Option<DisconnectReason>,
    disconnect_packet: Option<Vec<u8>>,
}

/// What happened processing one inbound packet, to be applied after the
/// session lock is released.
struct PacketOutcome {
    peer_addr: SocketAddr,
    to_send: Vec<Vec<u8>>,
    deliver: Vec<(u16, Vec<u8>)>,
    reconnected: bool,
    remove_with: Option<DisconnectReason>,
}

impl PacketOutcome {
    fn for_session(session: &Session) -> Self {
        Self {
            peer_addr: session.peer_addr(),
            to_send: Vec::new(),
            deliver: Vec::new(),
            reconnected: false,
            remove_with: None,
        }
    }
}

fn note_activity(session: &mut Session, from: SocketAddr, outcome: &mut PacketOutcome) {
    if session.state() == SessionState::Reconnecting {
        session.reconnect_from(from);
        outcome.reconnected = true;
        outcome.peer_addr = from;
    } else {
        session.touch_activity();
    }
}

fn handle_data(session: &mut Session, rest: &[u8], from: SocketAddr) -> PacketOutcome {
    let mut outcome = PacketOutcome::for_session(session);
    if !matches!(session.state(), SessionState::Connected | SessionState::Reconnecting) {
        return outcome;
    }
    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
        return outcome;
    };
    let session_id = session.id();
    match session
        .cipher_mut()
        .decrypt(PacketType::Data as u8, session_id.as_bytes(), nonce, ct)
    {
        Ok(plaintext) => {
            session.clear_decode_failures();
            note_activity(session, from, &mut outcome);
            let Ok(body) = DataBody::decode(&plaintext) else {
                return outcome;
            };
            let receive = reliability::on_receive_data(session, body);
            if let Some(ack) = receive.ack {
                if let Ok(pkt) = reliability::encode_ack(session, &ack) {
                    outcome.to_send.push(pkt.bytes);
                }
            }
            for msg in receive.deliverable {
                outcome.deliver.push((msg.message_tag, msg.payload));
            }
        }
        Err(_) => {
            if session.record_decode_failure() {
                outcome.remove_with = Some(DisconnectReason::ProtocolError("decrypt failure".into()));
                session.close(outcome.remove_with.as_ref().unwrap());
            }
        }
    }
    outcome
}

fn handle_ack(session: &mut Session, rest: &[u8], from: SocketAddr) -> PacketOutcome {
    let mut outcome = PacketOutcome::for_session(session);
    if !matches!(session.state(), SessionState::Connected | SessionState::Reconnecting) {
        return outcome;
    }
    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
        return outcome;
    };
    let session_id = session.id();
    match session
        .cipher_mut()
        .decrypt(PacketType::Ack as u8, session_id.as_bytes(), nonce, ct)
    {
        Ok(plaintext) => {
            session.clear_decode_failures();
            note_activity(session, from, &mut outcome);
            if let Ok(ack) = AckBody::decode(&plaintext) {
                reliability::on_receive_ack(session, ack);
            }
        }
        Err(_) => {
            if session.record_decode_failure() {
                outcome.remove_with = Some(DisconnectReason::ProtocolError("decrypt failure".into()));
                session.close(outcome.remove_with.as_ref().unwrap());
            }
        }
    }
    outcome
}

fn handle_heartbeat(session: &mut Session, rest: &[u8], from: SocketAddr) -> PacketOutcome {
    let mut outcome = PacketOutcome::for_session(session);
    if !matches!(session.state(), SessionState::Connected | SessionState::Reconnecting) {
        return outcome;
    }
    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
        return outcome;
    };
    let session_id = session.id();
    match session
        .cipher_mut()
        .decrypt(PacketType::Heartbeat as u8, session_id.as_bytes(), nonce, ct)
    {
        Ok(_) => {
            session.clear_decode_failures();
            note_activity(session, from, &mut outcome);
        }
        Err(_) => {
            if session.record_decode_failure() {
                outcome.remove_with = Some(DisconnectReason::ProtocolError("decrypt failure".into()));
                session.close(outcome.remove_with.as_ref().unwrap());
            }
        }
    }
    outcome
}

fn handle_disconnect(session: &mut Session, rest: &[u8]) -> PacketOutcome {
    let mut outcome = PacketOutcome::for_session(session);
    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
        return outcome;
    };
    let session_id = session.id();
    if let Ok(plaintext) =
        session
            .cipher_mut()
            .decrypt(PacketType::Disconnect as u8, session_id.as_bytes(), nonce, ct)
    {
        if let Ok(reason) = DisconnectReason::decode(&plaintext) {
            session.close(&reason);
            outcome.remove_with = Some(reason);
        }
    }
    outcome
}

/// Encrypt and frame a `Disconnect`, best-effort: a failure here just means
/// the peer times the session out locally instead of seeing an explicit close.
fn encode_disconnect(session: &mut Session, reason: &DisconnectReason) -> Option<Vec<u8>> {
    let plaintext = reason.encode();
    let session_id = session.id();
    let (nonce, ciphertext) = session
        .cipher_mut()
        .encrypt(PacketType::Disconnect as u8, session_id.as_bytes(), &plaintext)
        .ok()?;
    Some(frame::encode_encrypted_packet(PacketType::Disconnect, session.id(), nonce, &ciphertext))
}
