//! Server configuration: a single builder validated at `build()`, replacing
//! the factory/builder proliferation the design notes call out — required
//! fields are rejected with a clear error kind rather than discovered later.

use aegis_core::protocol::Protocol;
use aegis_core::session::SessionConfig;
use aegis_crypto::signatures::SigningKey;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised building a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ServerBuildError {
    /// A required field (`port`, `protocol`, `privateKey`) was never set.
    #[error("missing required server config field: {0}")]
    MissingField(&'static str),
}

/// Validated server configuration. Constructed only via [`ServerBuilder::build`].
pub struct ServerConfig<P: Protocol> {
    pub(crate) bind_addr: SocketAddr,
    pub(crate) protocol: Arc<P>,
    pub(crate) private_key: SigningKey,
    pub(crate) max_connections: Option<usize>,
    pub(crate) session: SessionConfig,
}

impl<P: Protocol> ServerConfig<P> {
    /// Address this server will bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

/// Builds a [`ServerConfig`]. See spec section 6's configuration table for
/// defaults: `sessionTimeout` 120s, `heartbeatInterval` 5s,
/// `maxReliableQueueSize` 1024, `maxMessageSize` 64 KiB, unlimited
/// `maxConnections`.
pub struct ServerBuilder<P: Protocol> {
    port: Option<u16>,
    bind_address: IpAddr,
    protocol: Option<Arc<P>>,
    private_key: Option<SigningKey>,
    max_connections: Option<usize>,
    session: SessionConfig,
}

impl<P: Protocol> Default for ServerBuilder<P> {
    fn default() -> Self {
        Self {
            port: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol: None,
            private_key: None,
            max_connections: None,
            session: SessionConfig::default(),
        }
    }
}

impl<P: Protocol> ServerBuilder<P> {
    /// Start a builder with every optional field at its spec default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// UDP bind port. Required.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// UDP bind address. Defaults to all interfaces.
    #[must_use]
    pub fn bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Message codec registry. Required.
    #[must_use]
    pub fn protocol(mut self, protocol: P) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    /// Long-term Ed25519 identity key. Required.
    #[must_use]
    pub fn private_key(mut self, key: SigningKey) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Cap on concurrently connected sessions. Defaults to unlimited.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
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

    /// Bound on the per-session pending-ack queue. Defaults to 1024.
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

    /// Validate required fields and produce a [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// [`ServerBuildError::MissingField`] if `port`, `protocol`, or `privateKey`
    /// was never set.
    pub fn build(self) -> Result<ServerConfig<P>, ServerBuildError> {
        let port = self.port.ok_or(ServerBuildError::MissingField("port"))?;
        let protocol = self
            .protocol
            .ok_or(ServerBuildError::MissingField("protocol"))?;
        let private_key = self
            .private_key
            .ok_or(ServerBuildError::MissingField("privateKey"))?;
        Ok(ServerConfig {
            bind_addr: SocketAddr::new(self.bind_address, port),
            protocol,
            private_key,
            max_connections: self.max_connections,
            session: self.session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProtocol;
    impl Protocol for NullProtocol {
        type Message = ();
        fn tag_of(&self, _message: &Self::Message) -> u16 {
            0
        }
        fn encode(&self, _message: &Self::Message) -> Vec<u8> {
            vec![]
        }
        fn decode(&self, _tag: u16, _payload: &[u8]) -> Result<Self::Message, String> {
            Ok(())
        }
    }

    fn key() -> SigningKey {
        SigningKey::generate(&mut rand_core::OsRng)
    }

    #[test]
    fn missing_port_rejected() {
        let result: Result<ServerConfig<NullProtocol>, _> = ServerBuilder::new()
            .protocol(NullProtocol)
            .private_key(key())
            .build();
        assert!(matches!(result, Err(ServerBuildError::MissingField("port"))));
    }

    #[test]
    fn missing_protocol_rejected() {
        let result: Result<ServerConfig<NullProtocol>, _> =
            ServerBuilder::new().port(9000).private_key(key()).build();
        assert!(matches!(
            result,
            Err(ServerBuildError::MissingField("protocol"))
        ));
    }

    #[test]
    fn defaults_applied_when_not_overridden() {
        let config = ServerBuilder::new()
            .port(9000)
            .protocol(NullProtocol)
            .private_key(key())
            .build()
            .unwrap();
        assert_eq!(config.session.session_timeout, Duration::from_secs(120));
        assert_eq!(config.max_connections, None);
    }

    #[test]
    fn overrides_applied() {
        let config = ServerBuilder::new()
            .port(9000)
            .protocol(NullProtocol)
            .private_key(key())
            .max_connections(10)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap();
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(1));
    }
}
