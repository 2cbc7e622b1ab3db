//! Error types for the local-socket protocol.
//!
//! [`ProtocolError`] covers framing, handshake, decoding and connection
//! lifecycle failures, for both the server and [`super::client`].

use std::io;

use thiserror::Error;

use super::messages::StatusCode;

/// Maximum frame size in bytes after the handshake (1 MiB).
///
/// Every message on this protocol is a few hundred bytes; the cap is checked
/// from the length prefix before any allocation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum frame size in bytes during the handshake (64 KiB).
pub const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix announced a frame above the current limit.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Limit in force.
        max: usize,
    },

    /// The frame is structurally invalid (empty, truncated).
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong.
        reason: String,
    },

    /// The frame tag names no known method or control frame.
    #[error("unknown frame tag {tag:#04x}")]
    UnknownTag {
        /// The tag byte received.
        tag: u8,
    },

    /// A frame arrived that is valid but not allowed at this point.
    #[error("unexpected frame: {reason}")]
    UnexpectedFrame {
        /// What was expected instead.
        reason: String,
    },

    /// The protobuf payload could not be decoded.
    #[error("failed to decode {message}: {reason}")]
    Decode {
        /// Message type being decoded.
        message: &'static str,
        /// Decoder error.
        reason: String,
    },

    /// Client and server protocol versions are incompatible.
    #[error("version mismatch: client version {client_version}, server version {server_version}")]
    VersionMismatch {
        /// Version offered by the client.
        client_version: u32,
        /// Version spoken by the server.
        server_version: u32,
    },

    /// The handshake did not complete.
    #[error("handshake failed: {reason}")]
    HandshakeFailed {
        /// Why.
        reason: String,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response within the client's deadline.
    #[error("operation timed out after {duration_ms} ms")]
    Timeout {
        /// Deadline in milliseconds.
        duration_ms: u64,
    },

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON handshake (de)serialization failure.
    #[error("serialization error: {reason}")]
    Serialization {
        /// Serializer error.
        reason: String,
    },

    /// The server answered with a non-OK status.
    #[error("server returned {code:?}: {message}")]
    Status {
        /// Status code from the error frame.
        code: StatusCode,
        /// Server-provided detail.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a [`ProtocolError::FrameTooLarge`].
    #[must_use]
    pub const fn frame_too_large(size: usize, max: usize) -> Self {
        Self::FrameTooLarge { size, max }
    }

    /// Creates a [`ProtocolError::VersionMismatch`] against
    /// [`PROTOCOL_VERSION`].
    #[must_use]
    pub const fn version_mismatch(client_version: u32) -> Self {
        Self::VersionMismatch {
            client_version,
            server_version: PROTOCOL_VERSION,
        }
    }

    /// Creates a [`ProtocolError::Timeout`].
    #[must_use]
    pub const fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Creates a [`ProtocolError::HandshakeFailed`].
    #[must_use]
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Creates a [`ProtocolError::UnexpectedFrame`].
    #[must_use]
    pub fn unexpected(reason: impl Into<String>) -> Self {
        Self::UnexpectedFrame {
            reason: reason.into(),
        }
    }

    /// Creates a [`ProtocolError::Decode`] from a prost error.
    #[must_use]
    pub fn decode(message: &'static str, err: &prost::DecodeError) -> Self {
        Self::Decode {
            message,
            reason: err.to_string(),
        }
    }

    /// Returns `true` for transient failures where reconnecting may help.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionClosed)
    }

    /// Returns `true` if the peer broke the protocol and the connection
    /// must be closed.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. }
                | Self::InvalidFrame { .. }
                | Self::UnknownTag { .. }
                | Self::UnexpectedFrame { .. }
                | Self::Decode { .. }
                | Self::VersionMismatch { .. }
                | Self::HandshakeFailed { .. }
        )
    }

    /// Status code reported to a client for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownTag { .. } => StatusCode::Unimplemented,
            Self::FrameTooLarge { .. }
            | Self::InvalidFrame { .. }
            | Self::UnexpectedFrame { .. }
            | Self::Decode { .. }
            | Self::VersionMismatch { .. }
            | Self::HandshakeFailed { .. }
            | Self::Serialization { .. } => StatusCode::InvalidArgument,
            Self::Status { code, .. } => *code,
            Self::ConnectionClosed | Self::Timeout { .. } | Self::Io(_) => StatusCode::Unavailable,
        }
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
