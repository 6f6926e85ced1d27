//! Session state machine and per-session reliability state.
//!
//! A [`Session`] is a server- or client-side view of one peer connection: its
//! AEAD cipher, its place in the [`SessionState`] machine, its reliable-send
//! bookkeeping (`pending_acks`), its inbound reorder buffer, and the
//! opaque user attachment. The actual send/receive logic lives in
//! [`crate::reliability`]; this module owns the data and the state transitions.

use crate::error::Error;
use crate::frame::DisconnectReason;
use crate::ids::SessionId;
use aegis_crypto::aead::SessionCipher;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default session idle timeout: `Reconnecting` -> `Expired`.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default heartbeat cadence while `Connected`.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of missed heartbeat windows before `Connected` -> `Reconnecting`.
pub const DEFAULT_MISSED_HEARTBEAT_THRESHOLD: u32 = 3;

/// Default cap on the reliable pending-ack queue.
pub const DEFAULT_MAX_RELIABLE_QUEUE_SIZE: usize = 1024;

/// Default maximum accepted message payload, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default retransmission timer tick.
pub const DEFAULT_RETRANSMIT_TICK: Duration = Duration::from_millis(100);

/// Default cap on retransmission attempts before a reliable send is abandoned.
///
/// Not specified by the source material; chosen so the worst-case backoff
/// schedule (100, 200, 400, 800, 1600, 1600, 1600, 1600 ms) spans a little
/// under `sessionTimeout` at default settings. See `DESIGN.md`.
pub const DEFAULT_MAX_RETRANSMIT_ATTEMPTS: u32 = 8;

/// Ceiling the exponential retransmit backoff saturates at.
pub const MAX_RETRANSMIT_BACKOFF: Duration = Duration::from_millis(1600);

/// Consecutive post-handshake decrypt/parse failures tolerated before a session
/// is force-closed with `ProtocolError`.
pub const MAX_CONSECUTIVE_DECODE_FAILURES: u32 = 5;

/// Tunables governing one session's reliability and liveness behavior.
///
/// Cloned from the server/client builder config at session-creation time so a
/// session's behavior is fixed for its lifetime even if the owning config is
/// later rebuilt (it can't be: builders are consumed on `build()`, but this
/// keeps the session self-contained regardless).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// See [`DEFAULT_SESSION_TIMEOUT`].
    pub session_timeout: Duration,
    /// See [`DEFAULT_HEARTBEAT_INTERVAL`].
    pub heartbeat_interval: Duration,
    /// See [`DEFAULT_MISSED_HEARTBEAT_THRESHOLD`].
    pub missed_heartbeat_threshold: u32,
    /// See [`DEFAULT_MAX_RELIABLE_QUEUE_SIZE`].
    pub max_reliable_queue_size: usize,
    /// See [`DEFAULT_MAX_MESSAGE_SIZE`].
    pub max_message_size: usize,
    /// See [`DEFAULT_RETRANSMIT_TICK`].
    pub retransmit_tick: Duration,
    /// See [`DEFAULT_MAX_RETRANSMIT_ATTEMPTS`].
    pub max_retransmit_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            missed_heartbeat_threshold: DEFAULT_MISSED_HEARTBEAT_THRESHOLD,
            max_reliable_queue_size: DEFAULT_MAX_RELIABLE_QUEUE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retransmit_tick: DEFAULT_RETRANSMIT_TICK,
            max_retransmit_attempts: DEFAULT_MAX_RETRANSMIT_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    fn reconnect_deadline(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeat_threshold
    }
}

/// A session's place in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The 4-message handshake is in progress; no session is observable to user code yet.
    Handshaking,
    /// Fully established: the handshake completed and the peer is recently active.
    Connected,
    /// The peer has been silent past `heartbeatInterval * missedHeartbeatThreshold` but
    /// not yet past `sessionTimeout`. Server-side state (`pending_acks`, `last_in_seq`,
    /// the cipher) is retained; any datagram that authenticates under the session key,
    /// from any address, restores the session to `Connected`.
    Reconnecting,
    /// The peer was silent past `sessionTimeout` while `Reconnecting`. Terminal.
    Expired,
    /// Closed gracefully or locally. Terminal.
    Closed,
}

/// An outstanding reliable send awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingAck {
    /// Encoded `Data` packet payload the retransmit timer resends verbatim.
    pub payload: Vec<u8>,
    /// Wall-clock time this seq was first sent.
    pub first_sent_at: Instant,
    /// Wall-clock time of the most recent (re)transmission.
    pub last_sent_at: Instant,
    /// Current backoff before the next retransmission, per spec: starts at
    /// `retransmitTick` and doubles up to [`MAX_RETRANSMIT_BACKOFF`].
    pub backoff: Duration,
    /// Number of times this seq has been sent, including the original send.
    pub attempts: u32,
}

/// One peer connection.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    cipher: SessionCipher,
    state: SessionState,
    config: SessionConfig,

    next_send_seq: u32,
    last_in_seq: u32,
    pending_acks: BTreeMap<u32, PendingAck>,
    reorder_buffer: BTreeMap<u32, Vec<u8>>,

    last_activity: Instant,
    last_sent_at: Instant,
    consecutive_decode_failures: u32,

    attachment: Option<Box<dyn std::any::Any + Send + Sync>>,
}

impl Session {
    /// Construct a freshly handshaken session. Starts in [`SessionState::Handshaking`];
    /// the caller transitions it to `Connected` once `ClientFinish`/`ServerWelcome`
    /// has been exchanged.
    #[must_use]
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        cipher: SessionCipher,
        config: SessionConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr,
            cipher,
            state: SessionState::Handshaking,
            config,
            next_send_seq: 1,
            last_in_seq: 0,
            pending_acks: BTreeMap::new(),
            reorder_buffer: BTreeMap::new(),
            last_activity: now,
            last_sent_at: now,
            consecutive_decode_failures: 0,
            attachment: None,
        }
    }

    /// This session's id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The peer's current address. Updated on reconnect.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tunables this session was created with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mutable access to tunables, for builders and tests that need to override
    /// a default after construction.
    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    /// Mutable access to the AEAD cipher, for [`crate::reliability`] and [`crate::handshake`].
    pub fn cipher_mut(&mut self) -> &mut SessionCipher {
        &mut self.cipher
    }

    /// Next sequence number to assign to a reliable send, without consuming it.
    #[must_use]
    pub fn next_send_seq(&self) -> u32 {
        self.next_send_seq
    }

    /// Consume and advance the reliable send sequence counter.
    pub fn take_next_send_seq(&mut self) -> u32 {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        seq
    }

    /// Highest reliable sequence delivered to the application in order so far.
    #[must_use]
    pub fn last_in_seq(&self) -> u32 {
        self.last_in_seq
    }

    /// Advance `last_in_seq`. Callers must only call this with a strictly
    /// increasing value; the reliability engine enforces the monotonicity
    /// invariant by construction (see `DESIGN.md`, invariant I-3).
    pub fn advance_last_in_seq(&mut self, seq: u32) {
        debug_assert!(seq >= self.last_in_seq, "last_in_seq must not regress");
        self.last_in_seq = seq;
    }

    /// Outstanding reliable sends awaiting acknowledgement.
    pub fn pending_acks(&self) -> &BTreeMap<u32, PendingAck> {
        &self.pending_acks
    }

    /// Mutable access for the reliability engine.
    pub fn pending_acks_mut(&mut self) -> &mut BTreeMap<u32, PendingAck> {
        &mut self.pending_acks
    }

    /// Buffered out-of-order inbound reliable payloads, keyed by seq.
    pub fn reorder_buffer_mut(&mut self) -> &mut BTreeMap<u32, Vec<u8>> {
        &mut self.reorder_buffer
    }

    /// Queue this reliable send for retransmission tracking.
    ///
    /// # Errors
    ///
    /// [`Error::QueueOverflow`] if `pending_acks` is already at `maxReliableQueueSize`.
    pub fn enqueue_pending_ack(&mut self, seq: u32, payload: Vec<u8>) -> Result<(), Error> {
        if self.pending_acks.len() >= self.config.max_reliable_queue_size {
            return Err(Error::QueueOverflow {
                max: self.config.max_reliable_queue_size,
            });
        }
        let now = Instant::now();
        self.pending_acks.insert(
            seq,
            PendingAck {
                payload,
                first_sent_at: now,
                last_sent_at: now,
                backoff: self.config.retransmit_tick,
                attempts: 1,
            },
        );
        Ok(())
    }

    /// Remove all pending acks with `seq <= up_to`, plus any individually listed
    /// in `selective`, and reset their backoff state (there is nothing left to
    /// reset once removed — this simply drops them from the map).
    pub fn apply_ack(&mut self, up_to: u32, selective: &[u32]) {
        let to_remove: Vec<u32> = self
            .pending_acks
            .range(..=up_to)
            .map(|(&seq, _)| seq)
            .chain(selective.iter().copied())
            .collect();
        for seq in to_remove {
            self.pending_acks.remove(&seq);
        }
    }

    /// Record a consecutive post-handshake decode failure. Returns `true` once
    /// the threshold is crossed and the session should be force-closed.
    pub fn record_decode_failure(&mut self) -> bool {
        self.consecutive_decode_failures += 1;
        self.consecutive_decode_failures >= MAX_CONSECUTIVE_DECODE_FAILURES
    }

    /// Clear the consecutive decode-failure counter after a successful decode.
    pub fn clear_decode_failures(&mut self) {
        self.consecutive_decode_failures = 0;
    }

    /// Mark activity now (any authenticated packet from the peer).
    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Mark that we sent the peer something now (for heartbeat suppression).
    pub fn touch_sent(&mut self) {
        self.last_sent_at = Instant::now();
    }

    /// Whether a heartbeat is due: nothing has been sent in `heartbeatInterval`.
    #[must_use]
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_sent_at) >= self.config.heartbeat_interval
    }

    /// Attach an opaque user value to this session, replacing any previous one.
    pub fn set_attachment<T: std::any::Any + Send + Sync>(&mut self, value: T) {
        self.attachment = Some(Box::new(value));
    }

    /// Borrow the attachment, if one is set and matches `T`.
    #[must_use]
    pub fn attachment<T: std::any::Any + Send + Sync>(&self) -> Option<&T> {
        self.attachment.as_ref().and_then(|a| a.downcast_ref())
    }

    /// Attempt a state transition, logging and rejecting moves the state machine
    /// does not allow. See spec section 4.3 for the full transition table.
    pub fn transition_to(&mut self, target: SessionState) {
        let allowed = matches!(
            (self.state, target),
            (SessionState::Handshaking, SessionState::Connected)
                | (SessionState::Handshaking, SessionState::Closed)
                | (SessionState::Connected, SessionState::Reconnecting)
                | (SessionState::Connected, SessionState::Closed)
                | (SessionState::Reconnecting, SessionState::Connected)
                | (SessionState::Reconnecting, SessionState::Expired)
                | (SessionState::Reconnecting, SessionState::Closed)
        );
        if !allowed {
            warn!(
                session = %self.id,
                from = ?self.state,
                to = ?target,
                "rejected illegal session state transition"
            );
            return;
        }
        debug!(session = %self.id, from = ?self.state, to = ?target, "session state transition");
        self.state = target;
    }

    /// Re-home this session onto a new peer address, for a reconnect after a NAT
    /// rebinding or client IP change. Only valid while `Reconnecting`; the caller
    /// is expected to have already verified the inbound packet authenticates
    /// under this session's key before calling this.
    pub fn reconnect_from(&mut self, new_addr: SocketAddr) {
        self.peer_addr = new_addr;
        self.touch_activity();
        self.transition_to(SessionState::Connected);
    }

    /// Evaluate timers: returns the terminal transition this session should make,
    /// if any, given the current time. Does not mutate state itself — the caller
    /// applies the transition and fires the matching lifecycle callback so session
    /// teardown and user notification stay co-located in the dispatcher.
    #[must_use]
    pub fn evaluate_timeout(&self, now: Instant) -> Option<TimeoutOutcome> {
        let idle = now.duration_since(self.last_activity);
        match self.state {
            SessionState::Connected if idle >= self.config.reconnect_deadline() => {
                Some(TimeoutOutcome::BecomeReconnecting)
            }
            SessionState::Reconnecting if idle >= self.config.session_timeout => {
                Some(TimeoutOutcome::Expire)
            }
            _ => None,
        }
    }

    /// Close this session locally with a reason, transitioning to `Closed`.
    /// The caller is responsible for sending the corresponding `Disconnect`
    /// packet; this only updates local state.
    pub fn close(&mut self, reason: &DisconnectReason) {
        debug!(session = %self.id, ?reason, "closing session");
        self.transition_to(SessionState::Closed);
    }
}

/// What a timer sweep found should happen to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// `Connected` -> `Reconnecting`.
    BecomeReconnecting,
    /// `Reconnecting` -> `Expired`.
    Expire,
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_crypto::aead::AeadKey;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_session() -> Session {
        let cipher = SessionCipher::new(AeadKey::new([1; 32]), AeadKey::new([2; 32]));
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        Session::new(
            SessionId::generate().unwrap(),
            addr,
            cipher,
            SessionConfig::default(),
        )
    }

    #[test]
    fn starts_handshaking() {
        assert_eq!(test_session().state(), SessionState::Handshaking);
    }

    #[test]
    fn legal_transition_applies() {
        let mut s = test_session();
        s.transition_to(SessionState::Connected);
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut s = test_session();
        // Handshaking -> Reconnecting is not in the table.
        s.transition_to(SessionState::Reconnecting);
        assert_eq!(s.state(), SessionState::Handshaking);
    }

    #[test]
    fn send_seq_starts_at_one_and_increments() {
        let mut s = test_session();
        assert_eq!(s.take_next_send_seq(), 1);
        assert_eq!(s.take_next_send_seq(), 2);
        assert_eq!(s.next_send_seq(), 3);
    }

    #[test]
    fn pending_ack_queue_overflow() {
        let mut s = test_session();
        s.config.max_reliable_queue_size = 2;
        s.enqueue_pending_ack(1, vec![]).unwrap();
        s.enqueue_pending_ack(2, vec![]).unwrap();
        assert!(matches!(
            s.enqueue_pending_ack(3, vec![]),
            Err(Error::QueueOverflow { max: 2 })
        ));
    }

    #[test]
    fn apply_ack_removes_cumulative_and_selective() {
        let mut s = test_session();
        for seq in 1..=5u32 {
            s.enqueue_pending_ack(seq, vec![]).unwrap();
        }
        s.apply_ack(2, &[4]);
        let remaining: Vec<u32> = s.pending_acks().keys().copied().collect();
        assert_eq!(remaining, vec![3, 5]);
    }

    #[test]
    fn decode_failure_threshold() {
        let mut s = test_session();
        for _ in 0..MAX_CONSECUTIVE_DECODE_FAILURES - 1 {
            assert!(!s.record_decode_failure());
        }
        assert!(s.record_decode_failure());
    }

    #[test]
    fn decode_failure_counter_resets_on_success() {
        let mut s = test_session();
        s.record_decode_failure();
        s.clear_decode_failures();
        for _ in 0..MAX_CONSECUTIVE_DECODE_FAILURES - 1 {
            assert!(!s.record_decode_failure());
        }
    }

    #[test]
    fn attachment_roundtrip() {
        let mut s = test_session();
        s.set_attachment(42u32);
        assert_eq!(s.attachment::<u32>(), Some(&42));
        assert_eq!(s.attachment::<String>(), None);
    }

    #[test]
    fn reconnect_from_updates_addr_and_state() {
        let mut s = test_session();
        s.transition_to(SessionState::Connected);
        s.transition_to(SessionState::Reconnecting);
        let new_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4000);
        s.reconnect_from(new_addr);
        assert_eq!(s.peer_addr(), new_addr);
        assert_eq!(s.state(), SessionState::Connected);
    }

    #[test]
    fn evaluate_timeout_reconnecting_then_expired() {
        let mut s = test_session();
        s.transition_to(SessionState::Connected);
        s.config.missed_heartbeat_threshold = 0;
        s.config.heartbeat_interval = Duration::from_millis(0);
        let now = Instant::now();
        assert_eq!(
            s.evaluate_timeout(now),
            Some(TimeoutOutcome::BecomeReconnecting)
        );
    }
}
