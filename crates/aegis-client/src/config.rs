//! Client configuration: the same validated-builder shape as the server's,
//! minus the server-only knobs (`bindAddress`, `maxConnections`) and plus the
//! two the client needs instead: where to dial, and whose signature to trust.

use aegis_core::protocol::Protocol;
use aegis_core::session::SessionConfig;
use aegis_crypto::signatures::VerifyingKey;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised building a [`ClientConfig`].
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// A required field (`serverAddr`, `protocol`, `serverIdentity`) was never set.
    #[error("missing required client config field: {0}")]
    MissingField(&'static str),
}

/// Validated client configuration. Constructed only via [`ClientBuilder::build`].
pub struct ClientConfig<P: Protocol> {
    pub(crate) server_addr: SocketAddr,
    pub(crate) server_identity: VerifyingKey,
    pub(crate) protocol: Arc<P>,
    pub(crate) session: SessionConfig,
}

impl<P: Protocol> ClientConfig<P> {
    /// Address of the server this client will dial.
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }
}

/// Builds a [`ClientConfig`]. Session-tuning defaults mirror the server
/// builder's (spec section 6): `sessionTimeout` 120s, `heartbeatInterval` 5s,
/// `maxReliableQueueSize` 1024, `maxMessageSize` 64 KiB.
pub struct ClientBuilder<P: Protocol> {
    server_addr: Option<SocketAddr>,
    server_identity: Option<VerifyingKey>,
    protocol: Option<Arc<P>>,
    session: SessionConfig,
}

impl<P: Protocol> Default for ClientBuilder<P> {
    fn default() -> Self {
        Self {
            server_addr: None,
            server_identity: None,
            protocol: None,
            session: SessionConfig::default(),
        }
    }
}

impl<P: Protocol> ClientBuilder<P> {
    /// Start a builder with every optional field at its spec default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address of the server to dial. Required.
    #[must_use]
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = Some(addr);
        self
    }

    /// Server's long-term Ed25519 public key, pinned out of band. Required:
    /// a `ServerHello` whose signature doesn't verify against this key aborts
    /// the handshake with `SignatureInvalid` before any session is created.
    #[must_use]
    pub fn server_identity(mut self, key: VerifyingKey) -> Self {
        self.server_identity = Some(key);
        self
    }

    /// Message codec registry. Required.
    #[must_use]
    pub fn protocol(mut self, protocol: P) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    /// Idle timeout before a `Reconnecting` session is expired. Defaults to 120s.
    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session.session_timeout = timeout;
        self
    }

    /// Heartbeat period. Defaults to 5s.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.session.heartbeat_interval = interval;
        self
    }

    /// Missed heartbeat windows before `Connected` -> `Reconnecting`. Defaults to 3.
    #[must_use]
    pub fn missed_heartbeat_threshold(mut self, threshold: u32) -> Self {
        self.session.missed_heartbeat_threshold = threshold;
        self
    }

    /// Bound on the pending-ack queue. Defaults to 1024.
    #[must_use]
    pub fn max_reliable_queue_size(mut self, max: usize) -> Self {
        self.session.max_reliable_queue_size = max;
        self
    }

    /// Largest accepted message payload. Defaults to 64 KiB.
    #[must_use]
    pub fn max_message_size(mut self, max: usize) -> Self {
        self.session.max_message_size = max;
        self
    }

    /// Retransmission timer tick. Defaults to 100ms.
    #[must_use]
    pub fn retransmit_tick(mut self, tick: Duration) -> Self {
        self.session.retransmit_tick = tick;
        self
    }

    /// Cap on retransmit attempts before a reliable send is abandoned. Defaults to 8.
    #[must_use]
    pub fn max_retransmit_attempts(mut self, max: u32) -> Self {
        self.session.max_retransmit_attempts = max;
        self
    }

    /// Validate required fields and produce a [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// [`ClientBuildError::MissingField`] if `serverAddr`, `protocol`, or
    /// `serverIdentity` was never set.
    pub fn build(self) -> Result<ClientConfig<P>, ClientBuildError> {
        let server_addr = self
            .server_addr
            .ok_or(ClientBuildError::MissingField("serverAddr"))?;
        let server_identity = self
            .server_identity
            .ok_or(ClientBuildError::MissingField("serverIdentity"))?;
        let protocol = self
            .protocol
            .ok_or(ClientBuildError::MissingField("protocol"))?;
        Ok(ClientConfig {
            server_addr,
            server_identity,
            protocol,
            session: self.session,
        })
    }
}
