//! # aegis-server
//!
//! Server-side orchestration for the Aegis session transport: accepts
//! handshakes, demultiplexes datagrams to sessions by [`aegis_core::SessionId`],
//! and drives the reliability engine's retransmission and heartbeat timers.
//!
//! A single I/O task owns the socket and the session table; an independent
//! timer task drives retransmission and heartbeats. User handlers registered
//! through [`Server::on_message`] and friends run on the I/O task and must not
//! block.
//!
//! ```no_run
//! use aegis_server::{Server, ServerBuilder};
//! use aegis_core::Protocol;
//! use aegis_crypto::signatures::SigningKey;
//!
//! # struct EchoProtocol;
//! # impl Protocol for EchoProtocol {
//! #     type Message = Vec<u8>;
//! #     fn tag_of(&self, _m: &Self::Message) -> u16 { 0 }
//! #     fn encode(&self, m: &Self::Message) -> Vec<u8> { m.clone() }
//! #     fn decode(&self, _t: u16, payload: &[u8]) -> Result<Self::Message, String> { Ok(payload.to_vec()) }
//! # }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerBuilder::new()
//!     .port(9000)
//!     .protocol(EchoProtocol)
//!     .private_key(SigningKey::generate(&mut rand_core::OsRng))
//!     .build()?;
//! let server = Server::bind(config).await?;
//! server.on_message(0, |session_id, message: &Vec<u8>| {
//!     println!("{session_id}: {} bytes", message.len());
//! });
//! server.start();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod server;

pub use config::{ServerBuildError, ServerBuilder, ServerConfig};
pub use error::ServerError;
pub use server::Server;
