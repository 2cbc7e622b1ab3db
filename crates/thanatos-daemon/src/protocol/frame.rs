//! Frame bodies: `[tag: u8][protobuf payload]`.
//!
//! | Tag    | Frame                         | Direction         |
//! |--------|-------------------------------|-------------------|
//! | `0x00` | error ([`RpcStatus`])         | server to client  |
//! | `0x01` | `SetAppConfig`                | both (call/reply) |
//! | `0x02` | `SetLaunchRule`               | both              |
//! | `0x03` | `PushFrameworkEvents` (open)  | both              |
//! | `0x04` | `RequestTemporaryUnfreeze`    | both              |
//! | `0x05` | `ShouldAllowLaunch`           | both              |
//! | `0x06` | `StreamRuntimeStats` (open)   | client to server  |
//! | `0x07` | `GetRecentEvents` (open)      | client to server  |
//! | `0x40` | stream item                   | both              |
//! | `0x41` | end of stream ([`RpcStatus`]) | both              |
//! | `0x42` | cancel                        | client to server  |
//!
//! A unary reply reuses its method's tag. A client stream is answered with
//! the method tag and an [`Empty`](super::messages::Empty) once the stream
//! ends; a server stream is terminated by an end-of-stream frame.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::error::{ProtocolError, ProtocolResult};
use super::messages::RpcStatus;

/// RPC methods, grouped by service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcMethod {
    /// `AppControl.SetAppConfig`
    SetAppConfig = 1,
    /// `AppControl.SetLaunchRule`
    SetLaunchRule = 2,
    /// `System.PushFrameworkEvents` (client streaming)
    PushFrameworkEvents = 3,
    /// `System.RequestTemporaryUnfreeze`
    RequestTemporaryUnfreeze = 4,
    /// `System.ShouldAllowLaunch`
    ShouldAllowLaunch = 5,
    /// `Dashboard.StreamRuntimeStats` (server streaming)
    StreamRuntimeStats = 6,
    /// `Dashboard.GetRecentEvents` (server streaming)
    GetRecentEvents = 7,
}

impl RpcMethod {
    /// Every method, in tag order.
    pub const ALL: [Self; 7] = [
        Self::SetAppConfig,
        Self::SetLaunchRule,
        Self::PushFrameworkEvents,
        Self::RequestTemporaryUnfreeze,
        Self::ShouldAllowLaunch,
        Self::StreamRuntimeStats,
        Self::GetRecentEvents,
    ];

    /// Looks a method up by tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::SetAppConfig),
            2 => Some(Self::SetLaunchRule),
            3 => Some(Self::PushFrameworkEvents),
            4 => Some(Self::RequestTemporaryUnfreeze),
            5 => Some(Self::ShouldAllowLaunch),
            6 => Some(Self::StreamRuntimeStats),
            7 => Some(Self::GetRecentEvents),
            _ => None,
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Fully qualified method name, for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SetAppConfig => "AppControl.SetAppConfig",
            Self::SetLaunchRule => "AppControl.SetLaunchRule",
            Self::PushFrameworkEvents => "System.PushFrameworkEvents",
            Self::RequestTemporaryUnfreeze => "System.RequestTemporaryUnfreeze",
            Self::ShouldAllowLaunch => "System.ShouldAllowLaunch",
            Self::StreamRuntimeStats => "Dashboard.StreamRuntimeStats",
            Self::GetRecentEvents => "Dashboard.GetRecentEvents",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a frame, decoded from its tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Error response carrying an [`RpcStatus`].
    Error,
    /// A call or its unary reply.
    Call(RpcMethod),
    /// One message of a stream.
    StreamItem,
    /// End of a stream, carrying an [`RpcStatus`].
    StreamEnd,
    /// Client request to abandon the current stream.
    Cancel,
}

impl FrameKind {
    /// Tag of error frames.
    pub const ERROR_TAG: u8 = 0x00;
    /// Tag of stream items.
    pub const STREAM_ITEM_TAG: u8 = 0x40;
    /// Tag of end-of-stream frames.
    pub const STREAM_END_TAG: u8 = 0x41;
    /// Tag of cancel frames.
    pub const CANCEL_TAG: u8 = 0x42;

    /// Looks a frame kind up by tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Self::ERROR_TAG => Some(Self::Error),
            Self::STREAM_ITEM_TAG => Some(Self::StreamItem),
            Self::STREAM_END_TAG => Some(Self::StreamEnd),
            Self::CANCEL_TAG => Some(Self::Cancel),
            _ => match RpcMethod::from_tag(tag) {
                Some(method) => Some(Self::Call(method)),
                None => None,
            },
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Error => Self::ERROR_TAG,
            Self::Call(method) => method.tag(),
            Self::StreamItem => Self::STREAM_ITEM_TAG,
            Self::StreamEnd => Self::STREAM_END_TAG,
            Self::Cancel => Self::CANCEL_TAG,
        }
    }
}

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Protobuf payload (may be empty).
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame carrying `message`.
    #[must_use]
    pub fn new(kind: FrameKind, message: &impl Message) -> Self {
        Self {
            kind,
            payload: message.encode_to_vec().into(),
        }
    }

    /// Builds a frame with no payload.
    #[must_use]
    pub const fn bare(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// A call or unary reply.
    #[must_use]
    pub fn call(method: RpcMethod, message: &impl Message) -> Self {
        Self::new(FrameKind::Call(method), message)
    }

    /// A stream item.
    #[must_use]
    pub fn item(message: &impl Message) -> Self {
        Self::new(FrameKind::StreamItem, message)
    }

    /// An end-of-stream frame.
    #[must_use]
    pub fn end(status: &RpcStatus) -> Self {
        Self::new(FrameKind::StreamEnd, status)
    }

    /// An error frame.
    #[must_use]
    pub fn error(status: &RpcStatus) -> Self {
        Self::new(FrameKind::Error, status)
    }

    /// Splits a frame body into tag and payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] for an empty body and
    /// [`ProtocolError::UnknownTag`] for an unassigned tag.
    pub fn parse(mut body: Bytes) -> ProtocolResult<Self> {
        let Some(&tag) = body.first() else {
            return Err(ProtocolError::InvalidFrame {
                reason: "empty frame".to_string(),
            });
        };
        let kind = FrameKind::from_tag(tag).ok_or(ProtocolError::UnknownTag { tag })?;
        let payload = body.split_off(1);
        Ok(Self { kind, payload })
    }

    /// Serializes the frame body.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.kind.tag());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] if the payload is not a valid `M`.
    pub fn decode<M: Message + Default>(&self, name: &'static str) -> ProtocolResult<M> {
        M::decode(self.payload.clone()).map_err(|e| ProtocolError::decode(name, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{LaunchRule, StatusCode};

    #[test]
    fn method_tags_round_trip() {
        for method in RpcMethod::ALL {
            assert_eq!(RpcMethod::from_tag(method.tag()), Some(method));
            assert_eq!(FrameKind::from_tag(method.tag()), Some(FrameKind::Call(method)));
        }
        assert_eq!(RpcMethod::from_tag(0), None);
        assert_eq!(RpcMethod::from_tag(8), None);
    }

    #[test]
    fn control_tags_do_not_collide_with_methods() {
        for tag in [
            FrameKind::ERROR_TAG,
            FrameKind::STREAM_ITEM_TAG,
            FrameKind::STREAM_END_TAG,
            FrameKind::CANCEL_TAG,
        ] {
            assert!(RpcMethod::from_tag(tag).is_none());
            assert_eq!(FrameKind::from_tag(tag).map(FrameKind::tag), Some(tag));
        }
    }

    #[test]
    fn parse_splits_tag_and_payload() {
        let rule = LaunchRule::new("com.a", "com.b", true);
        let body = Frame::call(RpcMethod::ShouldAllowLaunch, &rule).into_bytes();
        assert_eq!(body[0], 5);

        let frame = Frame::parse(body).unwrap();
        assert_eq!(frame.kind, FrameKind::Call(RpcMethod::ShouldAllowLaunch));
        assert_eq!(frame.decode::<LaunchRule>("LaunchRule").unwrap(), rule);
    }

    #[test]
    fn parse_rejects_empty_and_unknown() {
        assert!(matches!(
            Frame::parse(Bytes::new()),
            Err(ProtocolError::InvalidFrame { .. })
        ));
        assert!(matches!(
            Frame::parse(Bytes::from_static(&[0x99, 1, 2])),
            Err(ProtocolError::UnknownTag { tag: 0x99 })
        ));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let frame = Frame {
            kind: FrameKind::Error,
            payload: Bytes::from_static(&[0xff, 0xff, 0xff]),
        };
        let err = frame.decode::<RpcStatus>("RpcStatus").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn bare_cancel_is_a_single_byte() {
        assert_eq!(Frame::bare(FrameKind::Cancel).into_bytes(), Bytes::from_static(&[0x42]));
    }
}
