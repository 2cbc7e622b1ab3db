//! Length-prefixed framing.
//!
//! ```text
//! +----------------------------+------------------+
//! | length (u32 big-endian)    | body             |
//! +----------------------------+------------------+
//! ```
//!
//! The length excludes the prefix. The limit starts at
//! [`MAX_HANDSHAKE_FRAME_SIZE`] and is raised to [`MAX_FRAME_SIZE`] once the
//! handshake completes. Oversized frames are rejected from the prefix alone,
//! before the body is buffered.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::error::{MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, ProtocolError};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for length-prefixed frames.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec limited to [`MAX_HANDSHAKE_FRAME_SIZE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_HANDSHAKE_FRAME_SIZE)
    }

    /// Creates a codec with an explicit limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_PREFIX_SIZE)
            .big_endian()
            .max_frame_length(max_frame_size)
            .new_codec();
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Raises the limit to [`MAX_FRAME_SIZE`] after a successful handshake.
    pub fn upgrade_to_session(&mut self) {
        self.max_frame_size = MAX_FRAME_SIZE;
        self.inner.set_max_frame_length(MAX_FRAME_SIZE);
    }

    /// Current frame size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(frame) => Ok(frame.map(BytesMut::freeze)),
            // The inner codec checks the header without consuming it, so the
            // rejected prefix is still at the front of `src`.
            Err(e) if is_length_error(&e) => Err(ProtocolError::frame_too_large(
                announced_length(src),
                self.max_frame_size,
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_length_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}

fn announced_length(src: &[u8]) -> usize {
    src.get(..LENGTH_PREFIX_SIZE)
        .and_then(|prefix| <[u8; LENGTH_PREFIX_SIZE]>::try_from(prefix).ok())
        .map_or(0, |prefix| u32::from_be_bytes(prefix) as usize)
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }
        self.inner.encode(item, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_big_endian_length_prefix() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from_static(b"\x05abc"), &mut buf).unwrap();

        assert_eq!(&buf[..], b"\x00\x00\x00\x04\x05abc");
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x03ab"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"c\x00\x00\x00\x01z");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"z"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_prefix_before_buffering() {
        let mut codec = FrameCodec::new();
        let announced = u32::try_from(MAX_HANDSHAKE_FRAME_SIZE + 1).unwrap();
        let mut buf = BytesMut::from(&announced.to_be_bytes()[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size, .. } if size == MAX_HANDSHAKE_FRAME_SIZE + 1));
    }

    #[test]
    fn session_frame_split_after_header_and_tag() {
        let mut codec = FrameCodec::new();
        codec.upgrade_to_session();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x0a"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x01");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x0a\x05com.a\x10\x01");

        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Bytes::from_static(b"\x01\x0a\x05com.a\x10\x01")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_tag_body_arriving_late_is_not_a_length() {
        let mut codec = FrameCodec::new();
        codec.upgrade_to_session();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x05"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x40\xff\xff\xff");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\xff");

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 5);
    }

    #[test]
    fn upgrade_raises_the_limit() {
        let mut codec = FrameCodec::new();
        let body = Bytes::from(vec![0u8; MAX_HANDSHAKE_FRAME_SIZE + 1]);
        let mut buf = BytesMut::new();
        assert!(codec.encode(body.clone(), &mut buf).is_err());

        codec.upgrade_to_session();
        assert_eq!(codec.max_frame_size(), MAX_FRAME_SIZE);
        codec.encode(body.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), body);
    }
}
