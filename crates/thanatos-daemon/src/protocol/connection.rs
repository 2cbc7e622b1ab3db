//! Per-connection call loop.
//!
//! After the handshake a connection carries one call at a time. Unary calls
//! are a request frame and a reply frame. Streamed calls keep the connection
//! for their whole lifetime:
//!
//! - Server streams (`StreamRuntimeStats`, `GetRecentEvents`) run the
//!   service while a watcher reads the inbound half. A cancel frame or EOF
//!   from the client cancels the call's token, which the service observes
//!   at its next write or wait.
//! - The client stream (`PushFrameworkEvents`) reads item frames until an
//!   end-of-stream frame (answered with the unary reply), a cancel frame
//!   (answered with a `CANCELLED` end-of-stream frame) or EOF.
//!
//! Daemon shutdown cancels every in-flight call through a child token.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::error::{ProtocolError, ProtocolResult};
use super::frame::{Frame, FrameKind, RpcMethod};
use super::framing::FrameCodec;
use super::handshake::{HandshakeMessage, HelloNack, ServerHandshake};
use super::messages::{
    AppPolicyConfig, Empty, FrameworkEvent, LaunchRule, RecentEventsRequest, RpcStatus, StatusCode,
    TemporaryUnfreezeRequest,
};
use crate::service::{MessageSink, MessageSource, RpcServices, StreamEnd};

type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// A framed socket connection, split into independently usable halves.
#[derive(Debug)]
pub struct Connection {
    reader: Reader,
    writer: Writer,
}

/// Outcome of the server side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Hello accepted; calls may follow.
    Success,
    /// Hello rejected; a nack was sent.
    Failed,
    /// The peer left before sending a hello.
    ConnectionClosed,
}

/// Whether the call loop keeps going after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// What the inbound half did while a server stream was running.
#[derive(Debug)]
enum PeerSignal {
    Cancelled,
    Gone,
    Violation(ProtocolError),
}

impl Connection {
    /// Wraps a socket with handshake-sized framing.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, FrameCodec::new()),
            writer: FramedWrite::new(write_half, FrameCodec::new()),
        }
    }

    /// Raises both halves to the post-handshake frame limit.
    pub fn upgrade_to_session(&mut self) {
        self.reader.decoder_mut().upgrade_to_session();
        self.writer.encoder_mut().upgrade_to_session();
    }

    /// Receives the next frame body, or `None` on EOF.
    ///
    /// # Errors
    ///
    /// Returns framing and I/O errors.
    pub async fn recv(&mut self) -> ProtocolResult<Option<Bytes>> {
        self.reader.next().await.transpose()
    }

    /// Sends one frame body.
    ///
    /// # Errors
    ///
    /// Returns framing and I/O errors.
    pub async fn send(&mut self, body: Bytes) -> ProtocolResult<()> {
        self.writer.send(body).await
    }

    async fn send_frame(&mut self, frame: Frame) -> ProtocolResult<()> {
        self.send(frame.into_bytes()).await
    }

    /// Reports `err` to the peer with an error frame, best effort.
    async fn send_error(&mut self, err: &ProtocolError) {
        let status = RpcStatus::new(err.status_code(), err.to_string());
        if let Err(e) = self.send_frame(Frame::error(&status)).await {
            debug!(error = %e, "failed to deliver error frame");
        }
    }

    /// Runs the server side of the handshake and upgrades the frame limit
    /// on success. A hello arriving after `shutdown` fired is refused.
    ///
    /// # Errors
    ///
    /// Returns transport errors; a rejected hello is
    /// [`HandshakeResult::Failed`], not an error.
    pub async fn accept_handshake(
        &mut self,
        handshake: &ServerHandshake,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<HandshakeResult> {
        let Some(frame) = self.recv().await? else {
            return Ok(HandshakeResult::ConnectionClosed);
        };

        let (reply, proceed) = if shutdown.is_cancelled() {
            (HelloNack::shutting_down().into(), false)
        } else {
            handshake.respond(&frame)
        };
        if let HandshakeMessage::HelloNack(nack) = &reply {
            warn!(code = ?nack.code, message = %nack.message, "handshake rejected");
        }
        self.send(reply.to_bytes()?).await?;

        if !proceed {
            return Ok(HandshakeResult::Failed);
        }
        self.upgrade_to_session();
        Ok(HandshakeResult::Success)
    }

    /// Serves calls until the peer disconnects or `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns the protocol violation or transport error that ended the
    /// connection. The peer has already been sent an error frame for
    /// violations.
    pub async fn serve(
        mut self,
        services: &RpcServices,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<()> {
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                next = self.reader.next() => next,
            };
            let body = match next {
                None => return Ok(()),
                Some(Ok(body)) => body,
                Some(Err(e)) => {
                    if e.is_protocol_violation() {
                        self.send_error(&e).await;
                    }
                    return Err(e);
                },
            };

            match self.dispatch(body, services, shutdown).await {
                Ok(Flow::Continue) => {},
                Ok(Flow::Close) => return Ok(()),
                Err(e) => {
                    if e.is_protocol_violation() {
                        self.send_error(&e).await;
                    }
                    return Err(e);
                },
            }
        }
    }

    async fn dispatch(
        &mut self,
        body: Bytes,
        services: &RpcServices,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<Flow> {
        let frame = Frame::parse(body)?;
        let method = match frame.kind {
            FrameKind::Call(method) => method,
            // A cancel racing the natural end of a stream.
            FrameKind::Cancel => return Ok(Flow::Continue),
            other => {
                return Err(ProtocolError::unexpected(format!(
                    "expected a call, got {other:?}"
                )));
            },
        };
        trace!(%method, "call");

        match method {
            RpcMethod::SetAppConfig => {
                let request: AppPolicyConfig = frame.decode("AppPolicyConfig")?;
                let reply = services.app_control.set_app_config(request);
                self.reply(method, &reply).await
            },
            RpcMethod::SetLaunchRule => {
                let request: LaunchRule = frame.decode("LaunchRule")?;
                let reply = services.app_control.set_launch_rule(request);
                self.reply(method, &reply).await
            },
            RpcMethod::RequestTemporaryUnfreeze => {
                let request: TemporaryUnfreezeRequest =
                    frame.decode("TemporaryUnfreezeRequest")?;
                let reply = services.system.request_temporary_unfreeze(request);
                self.reply(method, &reply).await
            },
            RpcMethod::ShouldAllowLaunch => {
                let request: LaunchRule = frame.decode("LaunchRule")?;
                let reply = services.system.should_allow_launch(request);
                self.reply(method, &reply).await
            },
            RpcMethod::PushFrameworkEvents => {
                let _: Empty = frame.decode("Empty")?;
                self.serve_event_push(services, shutdown).await
            },
            RpcMethod::StreamRuntimeStats => {
                let _: Empty = frame.decode("Empty")?;
                self.serve_server_stream(ServerStream::RuntimeStats, services, shutdown)
                    .await
            },
            RpcMethod::GetRecentEvents => {
                let request: RecentEventsRequest = frame.decode("RecentEventsRequest")?;
                self.serve_server_stream(ServerStream::RecentEvents(request), services, shutdown)
                    .await
            },
        }
    }

    async fn reply(&mut self, method: RpcMethod, message: &impl Message) -> ProtocolResult<Flow> {
        self.send_frame(Frame::call(method, message)).await?;
        Ok(Flow::Continue)
    }

    async fn serve_event_push(
        &mut self,
        services: &RpcServices,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<Flow> {
        let cancel = shutdown.child_token();
        let mut source = FrameSource {
            reader: &mut self.reader,
            end: None,
        };
        let outcome = services
            .system
            .push_framework_events(&mut source, &cancel)
            .await;
        let source_end = source.end.take();
        debug!(events = outcome.messages, end = ?source_end, "PushFrameworkEvents finished");

        match source_end {
            Some(SourceEnd::HalfClosed) => {
                self.reply(RpcMethod::PushFrameworkEvents, &Empty {}).await
            },
            Some(SourceEnd::Cancelled) => {
                let status = RpcStatus::new(StatusCode::Cancelled, "cancelled by client");
                self.send_frame(Frame::end(&status)).await?;
                Ok(Flow::Continue)
            },
            Some(SourceEnd::Disconnected) => Ok(Flow::Close),
            Some(SourceEnd::Violation(e)) => Err(e),
            None => {
                // Only shutdown ends the call without the source ending it.
                let status = RpcStatus::new(StatusCode::Unavailable, "server shutting down");
                self.send_frame(Frame::end(&status)).await?;
                Ok(Flow::Close)
            },
        }
    }

    async fn serve_server_stream(
        &mut self,
        stream: ServerStream,
        services: &RpcServices,
        shutdown: &CancellationToken,
    ) -> ProtocolResult<Flow> {
        let cancel = shutdown.child_token();
        let dashboard = &services.dashboard;

        let (outcome, peer) = {
            let mut sink = FrameSink {
                writer: &mut self.writer,
            };
            let service = async {
                match stream {
                    ServerStream::RuntimeStats => {
                        dashboard.stream_runtime_stats(&mut sink, &cancel).await
                    },
                    ServerStream::RecentEvents(request) => {
                        dashboard.get_recent_events(request, &mut sink, &cancel).await
                    },
                }
            };
            let watcher = watch_peer(&mut self.reader, &cancel);
            tokio::pin!(service);
            tokio::pin!(watcher);

            let first = tokio::select! {
                outcome = &mut service => Ok(outcome),
                signal = &mut watcher => Err(signal),
            };
            match first {
                Ok(outcome) => (outcome, None),
                // The watcher has cancelled the token; the service returns at
                // its next write or wait.
                Err(signal) => (service.await, Some(signal)),
            }
        };
        debug!(?stream, messages = outcome.messages, end = ?outcome.end, "stream finished");

        let status = match (peer, outcome.end) {
            (Some(PeerSignal::Gone), _) | (None, StreamEnd::PeerGone) => return Ok(Flow::Close),
            (Some(PeerSignal::Violation(e)), _) => return Err(e),
            (Some(PeerSignal::Cancelled), _) => {
                RpcStatus::new(StatusCode::Cancelled, "cancelled by client")
            },
            (None, StreamEnd::Completed) => RpcStatus::ok(),
            (None, StreamEnd::Cancelled) => {
                RpcStatus::new(StatusCode::Unavailable, "server shutting down")
            },
        };
        let closing = status.code() == StatusCode::Unavailable;
        self.send_frame(Frame::end(&status)).await?;
        Ok(if closing { Flow::Close } else { Flow::Continue })
    }
}

#[derive(Debug, Clone, Copy)]
enum ServerStream {
    RuntimeStats,
    RecentEvents(RecentEventsRequest),
}

/// Reads the inbound half during a server stream. Returns (after cancelling
/// `cancel`) as soon as the client cancels, leaves, or misbehaves.
async fn watch_peer(reader: &mut Reader, cancel: &CancellationToken) -> PeerSignal {
    let signal = match reader.next().await {
        None => PeerSignal::Gone,
        Some(Err(e)) if e.is_protocol_violation() => PeerSignal::Violation(e),
        Some(Err(_)) => PeerSignal::Gone,
        Some(Ok(body)) => match Frame::parse(body) {
            Ok(frame) if frame.kind == FrameKind::Cancel => PeerSignal::Cancelled,
            Ok(frame) => PeerSignal::Violation(ProtocolError::unexpected(format!(
                "{:?} frame during a server stream",
                frame.kind
            ))),
            Err(e) => PeerSignal::Violation(e),
        },
    };
    cancel.cancel();
    signal
}

/// Server-stream sink writing item frames.
struct FrameSink<'a> {
    writer: &'a mut Writer,
}

impl<T: Message + Send + 'static> MessageSink<T> for FrameSink<'_> {
    async fn write(&mut self, item: T) -> bool {
        let body = Frame::item(&item).into_bytes();
        match self.writer.send(body).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "stream write failed");
                false
            },
        }
    }
}

/// Why a client stream stopped producing events.
#[derive(Debug)]
enum SourceEnd {
    HalfClosed,
    Cancelled,
    Disconnected,
    Violation(ProtocolError),
}

/// Client-stream source decoding item frames.
struct FrameSource<'a> {
    reader: &'a mut Reader,
    end: Option<SourceEnd>,
}

impl FrameSource<'_> {
    fn next_event(&mut self, next: Option<ProtocolResult<Bytes>>) -> Option<FrameworkEvent> {
        let body = match next {
            Some(Ok(body)) => body,
            Some(Err(e)) if e.is_protocol_violation() => {
                self.end = Some(SourceEnd::Violation(e));
                return None;
            },
            Some(Err(_)) | None => {
                self.end = Some(SourceEnd::Disconnected);
                return None;
            },
        };

        let end = match Frame::parse(body) {
            Ok(frame) => match frame.kind {
                FrameKind::StreamItem => match frame.decode("FrameworkEvent") {
                    Ok(event) => return Some(event),
                    Err(e) => SourceEnd::Violation(e),
                },
                FrameKind::StreamEnd => SourceEnd::HalfClosed,
                FrameKind::Cancel => SourceEnd::Cancelled,
                other => SourceEnd::Violation(ProtocolError::unexpected(format!(
                    "{other:?} frame during a client stream"
                ))),
            },
            Err(e) => SourceEnd::Violation(e),
        };
        self.end = Some(end);
        None
    }
}

impl MessageSource<FrameworkEvent> for FrameSource<'_> {
    async fn read(&mut self) -> Option<FrameworkEvent> {
        if self.end.is_some() {
            return None;
        }
        let next = self.reader.next().await;
        self.next_event(next)
    }
}
