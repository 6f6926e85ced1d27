//! # aegis-transport
//!
//! The `Network` port for the Aegis session transport: a [`transport::Transport`]
//! trait abstracting over where packets actually go, plus two implementations —
//! [`udp_async::AsyncUdpTransport`] for real sockets and
//! [`simulated::SimulatedNetwork`] for deterministic, fault-injected testing of
//! the reliability engine in `aegis-core` without touching the network stack.
//!
//! `aegis-server` and `aegis-client` are generic over `Transport` so the same
//! session/dispatcher code runs against either backend unchanged.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod simulated;
pub mod transport;
pub mod udp_async;
