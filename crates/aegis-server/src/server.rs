//! The server's single I/O task and independent timer task.
//!
//! One [`Server`] owns a bound [`Transport`], a session table, and a
//! [`Dispatcher`]. `start()` spawns the I/O loop (accepts handshakes,
//! demultiplexes datagrams by [`SessionId`], drives the reliability engine)
//! and the timer loop (retransmission, heartbeats, idle/reconnect timeouts)
//! as two independent tasks, mirroring the relay server's
//! accept-loop-plus-cleanup-task split this crate's orchestration is
//! grounded on.

use aegis_core::dispatcher::Dispatcher;
use aegis_core::frame::{self, AckBody, ClientHello, DataBody, DisconnectReason, PacketHeader, PacketType};
use aegis_core::handshake;
use aegis_core::ids::SessionId;
use aegis_core::protocol::Protocol;
use aegis_core::reliability::{self, Delivery};
use aegis_core::session::{Session, SessionConfig, SessionState, TimeoutOutcome};
use aegis_crypto::signatures::SigningKey;
use aegis_transport::transport::Transport;
use aegis_transport::udp_async::AsyncUdpTransport;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;

const RECV_BUFFER_SIZE: usize = 2048;

/// A running (or not-yet-started) server bound to a [`Transport`].
///
/// Generic over the transport backend so the same orchestration code runs
/// against real UDP ([`AsyncUdpTransport`]) or `aegis-transport`'s simulated
/// network under test.
pub struct Server<P: Protocol, T: Transport = AsyncUdpTransport> {
    transport: Arc<T>,
    protocol: Arc<P>,
    private_key: SigningKey,
    max_connections: Option<usize>,
    session_config: SessionConfig,
    sessions: Arc<DashMap<SessionId, Session>>,
    dispatcher: RwLock<Dispatcher<P::Message>>,
    shutdown: Notify,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Protocol> Server<P, AsyncUdpTransport> {
    /// Bind a real UDP socket at the configured address and construct a server.
    ///
    /// # Errors
    ///
    /// [`ServerError::Transport`] if the bind fails.
    pub async fn bind(config: ServerConfig<P>) -> Result<Arc<Self>, ServerError> {
        let transport = AsyncUdpTransport::bind(config.bind_addr()).await?;
        Ok(Self::from_transport(Arc::new(transport), config))
    }
}

impl<P: Protocol, T: Transport + 'static> Server<P, T> {
    /// Construct a server over an already-bound transport, for tests running
    /// against `aegis_transport::simulated::SimulatedTransport`.
    #[must_use]
    pub fn from_transport(transport: Arc<T>, config: ServerConfig<P>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            protocol: config.protocol,
            private_key: config.private_key,
            max_connections: config.max_connections,
            session_config: config.session,
            sessions: Arc::new(DashMap::new()),
            dispatcher: RwLock::new(Dispatcher::new()),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the handler for a message tag.
    pub fn on_message(&self, tag: u16, handler: impl Fn(SessionId, &P::Message) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_message(tag, handler);
    }

    /// Register the single error sink.
    pub fn on_error(&self, sink: impl Fn(aegis_core::DispatchError) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_error(sink);
    }

    /// Register the `onSessionStarted` callback.
    pub fn on_session_started(&self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_started(cb);
    }

    /// Register the `onSessionDisconnected` callback.
    pub fn on_session_disconnected(&self, cb: impl Fn(SessionId, &DisconnectReason) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_disconnected(cb);
    }

    /// Register the `onSessionReconnected` callback.
    pub fn on_session_reconnected(&self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_reconnected(cb);
    }

    /// Register the `onSessionExpired` callback.
    pub fn on_session_expired(&self, cb: impl Fn(SessionId) + Send + Sync + 'static) {
        self.dispatcher.write().expect("dispatcher lock poisoned").on_session_expired(cb);
    }

    /// Spawn the I/O loop and timer loop. Idempotent only in the sense that
    /// calling it twice spawns two sets of loops racing on the same socket;
    /// callers should call this once per server.
    pub fn start(self: &Arc<Self>) {
        let io_handle = tokio::spawn(self.clone().io_loop());
        let timer_handle = tokio::spawn(self.clone().timer_loop());
        self.tasks.lock().expect("tasks lock poisoned").extend([io_handle, timer_handle]);
    }

    /// Snapshot of currently connected session ids. Sessions mid-handshake or
    /// mid-reconnect are excluded.
    #[must_use]
    pub fn connected_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Connected)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Send `message` to every connected session.
    pub async fn broadcast(&self, message: &P::Message, delivery: Delivery) {
        let tag = self.protocol.tag_of(message);
        let payload = self.protocol.encode(message);
        let targets: Vec<SessionId> = self.connected_sessions();
        for id in targets {
            let Some(mut entry) = self.sessions.get_mut(&id) else {
                continue;
            };
            let session = entry.value_mut();
            let sent = match delivery {
                Delivery::Reliable => reliability::send_reliable(session, tag, &payload),
                Delivery::Unreliable => reliability::send_unreliable(session, tag, &payload),
            };
            let peer_addr = session.peer_addr();
            drop(entry);
            match sent {
                Ok(packet) => {
                    if let Err(err) = self.transport.send_to(&packet.bytes, peer_addr).await {
                        warn!(session = %id, %err, "broadcast send failed");
                    }
                }
                Err(err) => warn!(session = %id, %err, "broadcast encode failed"),
            }
        }
    }

    /// Send `message` to one session.
    ///
    /// # Errors
    ///
    /// [`ServerError::Protocol`] wrapping [`aegis_core::Error::QueueOverflow`]
    /// or [`aegis_core::Error::MessageTooLarge`] if the send is rejected; per
    /// spec section 7 the session is closed with `NetworkError` in that case.
    /// [`ServerError::Protocol`]`(`[`aegis_core::Error::SessionClosed`]`)` if
    /// `session_id` is not a known, connected session.
    pub async fn send_to(&self, session_id: SessionId, message: &P::Message, delivery: Delivery) -> Result<(), ServerError> {
        let tag = self.protocol.tag_of(message);
        let payload = self.protocol.encode(message);

        let outcome = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return Err(ServerError::Protocol(aegis_core::Error::SessionClosed));
            };
            let session = entry.value_mut();
            let sent = match delivery {
                Delivery::Reliable => reliability::send_reliable(session, tag, &payload),
                Delivery::Unreliable => reliability::send_unreliable(session, tag, &payload),
            };
            match sent {
                Ok(packet) => Ok((packet.bytes, session.peer_addr())),
                Err(err @ (aegis_core::Error::QueueOverflow { .. } | aegis_core::Error::MessageTooLarge { .. })) => {
                    let reason = DisconnectReason::NetworkError(err.to_string());
                    let disconnect = encode_disconnect(session, &reason);
                    let peer_addr = session.peer_addr();
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
                self.sessions.remove(&session_id);
                self.dispatcher
                    .read()
                    .expect("dispatcher lock poisoned")
                    .fire_session_disconnected(session_id, &reason);
                Err(ServerError::Protocol(err))
            }
        }
    }

    /// Stop accepting traffic, flush a best-effort `Disconnect{ServerShutdown}`
    /// to every connected session (single send, no retransmit), and tear down
    /// all session state.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();

        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some(mut entry) = self.sessions.get_mut(&id) {
                let session = entry.value_mut();
                let peer_addr = session.peer_addr();
                let packet = encode_disconnect(session, &DisconnectReason::ServerShutdown);
                drop(entry);
                if let Some(bytes) = packet {
                    let _ = self.transport.send_to(&bytes, peer_addr).await;
                }
            }
        }
        self.sessions.clear();
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
                    debug!("server io loop shutting down");
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

        if header.session_id.is_zero() {
            if header.packet_type == PacketType::ClientHello {
                self.handle_client_hello(rest, from).await;
            } else {
                trace!(%from, packet_type = ?header.packet_type, "unexpected pre-session packet dropped");
            }
            return;
        }

        self.handle_session_packet(header, rest, from).await;
    }

    async fn handle_client_hello(&self, rest: &[u8], from: SocketAddr) {
        let Ok(client_hello) = ClientHello::decode(rest) else {
            trace!(%from, "malformed ClientHello dropped");
            return;
        };

        if let Some(max) = self.max_connections {
            if self.sessions.len() >= max {
                let packet = build_cleartext_disconnect(&DisconnectReason::ServerShutdown);
                let _ = self.transport.send_to(&packet, from).await;
                return;
            }
        }

        let Ok(session_id) = SessionId::generate() else {
            warn!("failed to mint session id from OS csprng");
            return;
        };

        let response = match handshake::respond_to_client_hello(session_id, &client_hello, &self.private_key) {
            Ok(response) => response,
            Err(aegis_core::Error::VersionMismatch) => {
                let packet = build_cleartext_disconnect(&DisconnectReason::ProtocolError("version".into()));
                let _ = self.transport.send_to(&packet, from).await;
                return;
            }
            Err(err) => {
                warn!(%err, %from, "failed to respond to ClientHello");
                return;
            }
        };

        let session = Session::new(session_id, from, response.cipher, self.session_config.clone());
        self.sessions.insert(session_id, session);

        let mut packet = PacketHeader {
            packet_type: PacketType::ServerHello,
            session_id,
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(&response.server_hello.encode());
        if self.transport.send_to(&packet, from).await.is_err() {
            self.sessions.remove(&session_id);
        }
    }

    async fn handle_session_packet(&self, header: PacketHeader, rest: &[u8], from: SocketAddr) {
        let Some(mut entry) = self.sessions.get_mut(&header.session_id) else {
            trace!(session = %header.session_id, "packet for unknown session dropped");
            return;
        };
        let session = entry.value_mut();
        let outcome = match header.packet_type {
            PacketType::ClientFinish => handle_client_finish(session, rest),
            PacketType::Data => handle_data(session, rest, from),
            PacketType::Ack => handle_ack(session, rest, from),
            PacketType::Heartbeat => handle_heartbeat(session, rest, from),
            PacketType::Disconnect => handle_disconnect(session, rest),
            PacketType::ClientHello | PacketType::ServerHello | PacketType::ServerWelcome => {
                warn!(session = %header.session_id, packet_type = ?header.packet_type, "unexpected packet type for established session");
                PacketOutcome::for_session(session)
            }
        };
        drop(entry);

        self.apply_outcome(header.session_id, outcome).await;
    }

    async fn apply_outcome(&self, session_id: SessionId, outcome: PacketOutcome) {
        for bytes in &outcome.to_send {
            if let Err(err) = self.transport.send_to(bytes, outcome.peer_addr).await {
                warn!(session = %session_id, %err, "reply send failed");
            }
        }
        if outcome.started {
            self.dispatcher.read().expect("dispatcher lock poisoned").fire_session_started(session_id);
        }
        if outcome.reconnected {
            self.dispatcher.read().expect("dispatcher lock poisoned").fire_session_reconnected(session_id);
        }
        for (tag, payload) in outcome.deliver {
            match self.protocol.decode(tag, &payload) {
                Ok(message) => self
                    .dispatcher
                    .read()
                    .expect("dispatcher lock poisoned")
                    .dispatch(session_id, tag, &message),
                Err(detail) => warn!(session = %session_id, tag, detail, "protocol failed to decode payload"),
            }
        }
        if let Some(reason) = outcome.remove_with {
            self.sessions.remove(&session_id);
            self.dispatcher
                .read()
                .expect("dispatcher lock poisoned")
                .fire_session_disconnected(session_id, &reason);
        }
    }

    async fn timer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.session_config.retransmit_tick);
        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    debug!("server timer loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_all().await;
                }
            }
        }
    }

    async fn sweep_all(&self) {
        let now = Instant::now();
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let Some(result) = self.sweep_session(id, now) else {
                continue;
            };
            for bytes in &result.to_send {
                if let Err(err) = self.transport.send_to(bytes, result.peer_addr).await {
                    warn!(session = %id, %err, "timer send failed");
                }
            }
            if result.expire {
                self.sessions.remove(&id);
                self.dispatcher.read().expect("dispatcher lock poisoned").fire_session_expired(id);
            } else if let Some(reason) = result.give_up {
                if let Some(bytes) = &result.disconnect_packet {
                    let _ = self.transport.send_to(bytes, result.peer_addr).await;
                }
                self.sessions.remove(&id);
                self.dispatcher
                    .read()
                    .expect("dispatcher lock poisoned")
                    .fire_session_disconnected(id, &reason);
            }
        }
    }

    fn sweep_session(&self, id: SessionId, now: Instant) -> Option<SweepResult> {
        let mut entry = self.sessions.get_mut(&id)?;
        let session = entry.value_mut();

        let mut expire = false;
        if let Some(outcome) = session.evaluate_timeout(now) {
            match outcome {
                TimeoutOutcome::BecomeReconnecting => session.transition_to(SessionState::Reconnecting),
                TimeoutOutcome::Expire => expire = true,
            }
        }

        let mut to_send = Vec::new();
        let mut give_up = None;
        let mut disconnect_packet = None;

        if !expire {
            let retransmit = reliability::retransmit_tick(session, now);
            to_send.extend(retransmit.retransmits.into_iter().map(|pkt| pkt.bytes));
            if let Some(reason) = retransmit.give_up {
                disconnect_packet = encode_disconnect(session, &reason);
                give_up = Some(reason);
            } else if session.state() == SessionState::Connected && session.heartbeat_due(now) {
                if let Ok(pkt) = reliability::build_heartbeat(session) {
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

/// What happened processing one inbound session-scoped packet, to be applied
/// after the session table lock is released.
struct PacketOutcome {
    peer_addr: SocketAddr,
    to_send: Vec<Vec<u8>>,
    deliver: Vec<(u16, Vec<u8>)>,
    started: bool,
    reconnected: bool,
    remove_with: Option<DisconnectReason>,
}

impl PacketOutcome {
    fn for_session(session: &Session) -> Self {
        Self {
            peer_addr: session.peer_addr(),
            to_send: Vec::new(),
            deliver: Vec::new(),
            started: false,
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

fn handle_client_finish(session: &mut Session, rest: &[u8]) -> PacketOutcome {
    let mut outcome = PacketOutcome::for_session(session);
    if session.state() != SessionState::Handshaking {
        return outcome;
    }
    let Ok((nonce, ct)) = frame::split_nonce(rest) else {
        return outcome;
    };
    let session_id = session.id();
    match session
        .cipher_mut()
        .decrypt(PacketType::ClientFinish as u8, session_id.as_bytes(), nonce, ct)
    {
        Ok(_) => {
            session.transition_to(SessionState::Connected);
            session.touch_activity();
            if let Some(bytes) = build_server_welcome(session) {
                outcome.to_send.push(bytes);
            }
            outcome.started = true;
        }
        Err(_) => {
            if session.record_decode_failure() {
                outcome.remove_with = Some(DisconnectReason::ProtocolError(
                    "handshake finish failed to authenticate".into(),
                ));
            }
        }
    }
    outcome
}

/// Encrypt and frame the empty-payload `ServerWelcome` confirming a `ClientFinish`.
fn build_server_welcome(session: &mut Session) -> Option<Vec<u8>> {
    let session_id = session.id();
    let (nonce, ciphertext) = session
        .cipher_mut()
        .encrypt(PacketType::ServerWelcome as u8, session_id.as_bytes(), &[])
        .ok()?;
    Some(frame::encode_encrypted_packet(PacketType::ServerWelcome, session.id(), nonce, &ciphertext))
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
            outcome.remove_with = Some(reason);
        }
    }
    outcome
}

fn build_cleartext_disconnect(reason: &DisconnectReason) -> Vec<u8> {
    let mut out = PacketHeader {
        packet_type: PacketType::Disconnect,
        session_id: SessionId::ZERO,
    }
    .encode()
    .to_vec();
    out.extend_from_slice(&reason.encode());
    out
}

/// Encrypt and frame a `Disconnect` for an already-established session,
/// best-effort: a failure here just means the peer times the session out
/// locally instead of seeing an explicit close.
fn encode_disconnect(session: &mut Session, reason: &DisconnectReason) -> Option<Vec<u8>> {
    let plaintext = reason.encode();
    let session_id = session.id();
    let (nonce, ciphertext) = session
        .cipher_mut()
        .encrypt(PacketType::Disconnect as u8, session_id.as_bytes(), &plaintext)
        .ok()?;
    Some(frame::encode_encrypted_packet(PacketType::Disconnect, session.id(), nonce, &ciphertext))
}
