//! # aegis-core
//!
//! Protocol-level core of the Aegis session transport: a reliable,
//! session-oriented, encrypted datagram transport for low-latency
//! interactive applications.
//!
//! This crate provides:
//! - **Wire framing**: packet types, header layout, and handshake/data/ack/
//!   heartbeat/disconnect body encoding ([`frame`])
//! - **Handshake**: the 4-message signed-ephemeral-DH exchange that
//!   authenticates the server and derives per-direction session keys
//!   ([`handshake`])
//! - **Session state machine**: `Handshaking` / `Connected` / `Reconnecting` /
//!   `Expired` / `Closed`, plus the reliable-send and reorder-buffer state a
//!   session carries ([`session`])
//! - **Reliability engine**: sequencing, cumulative/selective acks, and
//!   exponential-backoff retransmission ([`reliability`])
//! - **Dispatcher**: message-tag routing and lifecycle callbacks, with
//!   handler failures isolated from session teardown ([`dispatcher`])
//! - **Pluggable message codec**: the `Protocol` trait applications implement
//!   to decode their own payloads ([`protocol`])
//!
//! This crate does not open a socket — see `aegis-transport` for the
//! `Network` port and its real/simulated implementations, and
//! `aegis-server`/`aegis-client` for the I/O loop that ties everything
//! together.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod ids;
pub mod protocol;
pub mod reliability;
pub mod session;

pub use dispatcher::{DispatchError, Dispatcher};
pub use error::Error;
pub use frame::{DisconnectReason, PacketType, MAX_DATAGRAM_SIZE, MAX_SELECTIVE_ACKS, PROTOCOL_VERSION};
pub use ids::SessionId;
pub use protocol::{Protocol, TagRegistry};
pub use reliability::Delivery;
pub use session::{Session, SessionConfig, SessionState};
