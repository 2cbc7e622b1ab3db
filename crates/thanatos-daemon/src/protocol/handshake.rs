//! Version handshake.
//!
//! The first frame on every connection is a JSON [`Hello`]; the server
//! answers [`HelloAck`] or [`HelloNack`] and, on a nack, closes the
//! connection. Only then do tagged protobuf frames flow.
//!
//! ```text
//! Client                                      Server
//!   |  -- Hello { version, client_info } ---->  |
//!   |  <-- HelloAck { version, server_info } -- |
//!   |      or HelloNack { code, message }       |
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult};

/// Client greeting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    /// Protocol version the client speaks.
    pub protocol_version: u32,
    /// Free-form client identification, e.g. `thanatosctl/0.3.0`.
    pub client_info: String,
}

impl Hello {
    /// Creates a greeting for [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_info: client_info.into(),
        }
    }
}

/// Server acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloAck {
    /// Version both sides will speak.
    pub protocol_version: u32,
    /// Free-form server identification.
    pub server_info: String,
}

/// Server rejection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HelloNack {
    /// Rejection reason.
    pub code: HandshakeErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl HelloNack {
    /// Rejects an unsupported client version.
    #[must_use]
    pub fn version_mismatch(client_version: u32) -> Self {
        Self {
            code: HandshakeErrorCode::VersionMismatch,
            message: format!(
                "protocol version {client_version} not supported, server speaks {PROTOCOL_VERSION}"
            ),
        }
    }

    /// Rejects a connection because the server is stopping.
    #[must_use]
    pub fn shutting_down() -> Self {
        Self {
            code: HandshakeErrorCode::ServerShuttingDown,
            message: "server is shutting down".to_string(),
        }
    }
}

/// Handshake rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeErrorCode {
    /// Unsupported protocol version.
    VersionMismatch,
    /// The server is shutting down.
    ServerShuttingDown,
    /// Malformed greeting.
    Malformed,
}

/// Envelope distinguishing the three handshake messages on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Client greeting.
    Hello(Hello),
    /// Server acceptance.
    HelloAck(HelloAck),
    /// Server rejection.
    HelloNack(HelloNack),
}

impl From<Hello> for HandshakeMessage {
    fn from(hello: Hello) -> Self {
        Self::Hello(hello)
    }
}

impl From<HelloAck> for HandshakeMessage {
    fn from(ack: HelloAck) -> Self {
        Self::HelloAck(ack)
    }
}

impl From<HelloNack> for HandshakeMessage {
    fn from(nack: HelloNack) -> Self {
        Self::HelloNack(nack)
    }
}

impl HandshakeMessage {
    /// Parses a handshake frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] above
    /// [`MAX_HANDSHAKE_FRAME_SIZE`] and [`ProtocolError::Serialization`] for
    /// malformed JSON.
    pub fn parse(frame: &Bytes) -> ProtocolResult<Self> {
        if frame.len() > MAX_HANDSHAKE_FRAME_SIZE {
            return Err(ProtocolError::frame_too_large(
                frame.len(),
                MAX_HANDSHAKE_FRAME_SIZE,
            ));
        }
        serde_json::from_slice(frame).map_err(|e| ProtocolError::Serialization {
            reason: format!("invalid handshake message: {e}"),
        })
    }

    /// Serializes a handshake frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Serialization`] if JSON encoding fails.
    pub fn to_bytes(&self) -> ProtocolResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Serialization {
                reason: format!("failed to serialize handshake message: {e}"),
            })
    }
}

/// Server side of the handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    server_info: String,
}

impl ServerHandshake {
    /// Creates a server handshake announcing `server_info`.
    #[must_use]
    pub fn new(server_info: impl Into<String>) -> Self {
        Self {
            server_info: server_info.into(),
        }
    }

    /// Answers a client's first frame.
    ///
    /// Returns the reply and whether the connection may proceed. A frame that
    /// is not a `Hello` is answered with a [`HandshakeErrorCode::Malformed`]
    /// nack.
    #[must_use]
    pub fn respond(&self, first_frame: &Bytes) -> (HandshakeMessage, bool) {
        let hello = match HandshakeMessage::parse(first_frame) {
            Ok(HandshakeMessage::Hello(hello)) => hello,
            Ok(_) => return (malformed("expected hello"), false),
            Err(e) => return (malformed(&e.to_string()), false),
        };

        if hello.protocol_version != PROTOCOL_VERSION {
            return (HelloNack::version_mismatch(hello.protocol_version).into(), false);
        }

        let ack = HelloAck {
            protocol_version: PROTOCOL_VERSION,
            server_info: self.server_info.clone(),
        };
        (ack.into(), true)
    }
}

fn malformed(message: &str) -> HandshakeMessage {
    HelloNack {
        code: HandshakeErrorCode::Malformed,
        message: message.to_string(),
    }
    .into()
}

/// Interprets the server's reply on the client side.
///
/// # Errors
///
/// Returns [`ProtocolError::VersionMismatch`] or
/// [`ProtocolError::HandshakeFailed`] if the server did not accept.
pub fn accept_reply(reply: HandshakeMessage) -> ProtocolResult<HelloAck> {
    match reply {
        HandshakeMessage::HelloAck(ack) => Ok(ack),
        HandshakeMessage::HelloNack(nack) => match nack.code {
            HandshakeErrorCode::VersionMismatch => {
                Err(ProtocolError::version_mismatch(PROTOCOL_VERSION))
            },
            _ => Err(ProtocolError::handshake_failed(nack.message)),
        },
        HandshakeMessage::Hello(_) => Err(ProtocolError::handshake_failed(
            "server replied with a hello",
        )),
    }
}
