//! Local-socket RPC protocol.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Calls (AppControl, System,        │  frame tag + protobuf
//! │              Dashboard)                  │
//! ├─────────────────────────────────────────┤
//! │              Handshake                   │  Hello/HelloAck (JSON)
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │            UDS Transport                 │  Unix socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! ```text
//! +----------------------------+-----+------------------+
//! | Length (4 bytes, BE)       | Tag | Protobuf payload |
//! +----------------------------+-----+------------------+
//! ```
//!
//! The length covers tag and payload. Handshake frames are JSON without a
//! tag and are limited to [`MAX_HANDSHAKE_FRAME_SIZE`]; session frames to
//! [`MAX_FRAME_SIZE`]. See [`frame`] for the tag table.
//!
//! # Modules
//!
//! - [`error`]: [`ProtocolError`] and size limits
//! - [`framing`]: length-prefixed [`FrameCodec`]
//! - [`frame`]: tagged [`Frame`]s and the [`RpcMethod`] table
//! - [`handshake`]: version negotiation
//! - [`messages`]: protobuf messages and enums
//! - [`connection`]: per-connection call loop
//! - [`server`]: socket setup and accept loop ([`ProtocolServer`])
//! - [`client`]: [`DaemonClient`]

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod server;

pub use client::{DaemonClient, EventPush, StatsSubscription};
pub use connection::{Connection, HandshakeResult};
pub use error::{MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult};
pub use frame::{Frame, FrameKind, RpcMethod};
pub use framing::FrameCodec;
pub use handshake::{HandshakeMessage, Hello, HelloAck, HelloNack, ServerHandshake};
pub use server::{ProtocolServer, ServerConfig};
