//! # aegis-client
//!
//! Client-side orchestration for the Aegis session transport: initiates the
//! 4-message handshake against a pinned server identity, then runs the same
//! reliability, heartbeat, and reconnect logic as `aegis-server`, scoped to
//! the one session a client owns.
//!
//! A single I/O task owns the socket and the session; an independent timer
//! task drives retransmission and heartbeats. User handlers registered
//! through [`Client::on_message`] and friends run on the I/O task and must
//! not block.
//!
//! ```no_run
//! use aegis_client::{Client, ClientBuilder};
//! use aegis_core::{Protocol, Delivery};
//! use aegis_crypto::signatures::VerifyingKey;
//!
//! # struct EchoProtocol;
//! # impl Protocol for EchoProtocol {
//! #     type Message = Vec<u8>;
//! #     fn tag_of(&self, _m: &Self::Message) -> u16 { 0 }
//! #     fn encode(&self, m: &Self::Message) -> Vec<u8> { m.clone() }
//! #     fn decode(&self, _t: u16, payload: &[u8]) -> Result<Self::Message, String> { Ok(payload.to_vec()) }
//! # }
//! # async fn example(server_identity: VerifyingKey) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientBuilder::new()
//!     .server_addr("127.0.0.1:9000".parse()?)
//!     .server_identity(server_identity)
//!     .protocol(EchoProtocol)
//!     .build()?;
//! let client = Client::connect(config).await?;
//! client.on_disconnected(|session_id, reason| {
//!     println!("{session_id} disconnected: {reason:?}");
//! });
//! client.start();
//! client.send(&b"hello".to_vec(), Delivery::Reliable).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;

pub use client::Client;
pub use config::{ClientBuildError, ClientBuilder, ClientConfig};
pub use error::ClientError;
