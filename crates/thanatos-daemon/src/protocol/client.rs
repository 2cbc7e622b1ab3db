//! Client for the daemon socket.
//!
//! One call runs at a time on a connection. Streaming calls borrow the
//! client mutably for their lifetime:
//!
//! ```rust,no_run
//! use thanatos_daemon::protocol::DaemonClient;
//!
//! # async fn example() -> thanatos_daemon::protocol::ProtocolResult<()> {
//! let mut client = DaemonClient::connect("/data/local/tmp/thanatosd.sock").await?;
//! let mut stats = client.stream_runtime_stats().await?;
//! if let Some(snapshot) = stats.next().await? {
//!     println!("{} kB available", snapshot.avail_mem_kb);
//! }
//! stats.cancel().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use prost::Message;
use tokio::net::UnixStream;

use super::connection::Connection;
use super::error::{ProtocolError, ProtocolResult};
use super::frame::{Frame, FrameKind, RpcMethod};
use super::handshake::{HandshakeMessage, Hello, accept_reply};
use super::messages::{
    AppPolicyConfig, Empty, EventLogEntry, FrameworkEvent, LaunchRule, RecentEventsRequest,
    RpcStatus, RuntimeStatsSnapshot, StatusCode, TemporaryUnfreezeRequest,
};

/// Deadline for connecting, the handshake, and unary replies.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, handshaken client.
#[derive(Debug)]
pub struct DaemonClient {
    connection: Connection,
    server_info: String,
    timeout: Duration,
    /// Set while a stream is open; cleared when it ends cleanly.
    stream_open: bool,
}

impl DaemonClient {
    /// Connects and performs the handshake with [`DEFAULT_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is unreachable or the handshake is
    /// rejected.
    pub async fn connect(path: impl AsRef<Path>) -> ProtocolResult<Self> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    /// Connects with a custom deadline for connect, handshake and unary
    /// replies.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is unreachable, the deadline passes,
    /// or the handshake is rejected.
    pub async fn connect_with_timeout(
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> ProtocolResult<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path.as_ref()))
            .await
            .map_err(|_| ProtocolError::timeout(duration_ms(timeout)))??;
        let mut connection = Connection::new(stream);

        let hello = Hello::new(format!("thanatosctl/{}", env!("CARGO_PKG_VERSION")));
        connection
            .send(HandshakeMessage::from(hello).to_bytes()?)
            .await?;
        let reply = tokio::time::timeout(timeout, connection.recv())
            .await
            .map_err(|_| ProtocolError::timeout(duration_ms(timeout)))??
            .ok_or(ProtocolError::ConnectionClosed)?;
        let ack = accept_reply(HandshakeMessage::parse(&reply)?)?;
        connection.upgrade_to_session();

        Ok(Self {
            connection,
            server_info: ack.server_info,
            timeout,
            stream_open: false,
        })
    }

    /// Server identification from the handshake.
    #[must_use]
    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    /// Stores a package's policy.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn set_app_config(&mut self, config: AppPolicyConfig) -> ProtocolResult<()> {
        let _: Empty = self
            .unary(RpcMethod::SetAppConfig, &config, "Empty")
            .await?;
        Ok(())
    }

    /// Stores a launch rule.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn set_launch_rule(&mut self, rule: LaunchRule) -> ProtocolResult<()> {
        let _: Empty = self.unary(RpcMethod::SetLaunchRule, &rule, "Empty").await?;
        Ok(())
    }

    /// Opens a temporary unfreeze window.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn request_temporary_unfreeze(
        &mut self,
        request: TemporaryUnfreezeRequest,
    ) -> ProtocolResult<()> {
        let _: Empty = self
            .unary(RpcMethod::RequestTemporaryUnfreeze, &request, "Empty")
            .await?;
        Ok(())
    }

    /// Asks whether `source` may launch `target`.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn should_allow_launch(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> ProtocolResult<LaunchRule> {
        let query = LaunchRule::query(source, target);
        self.unary(RpcMethod::ShouldAllowLaunch, &query, "LaunchRule")
            .await
    }

    /// Pushes `events` in order and half-closes the stream.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn push_framework_events<I>(&mut self, events: I) -> ProtocolResult<()>
    where
        I: IntoIterator<Item = FrameworkEvent>,
    {
        let mut push = self.begin_event_push().await?;
        for event in events {
            push.send(&event).await?;
        }
        push.finish().await
    }

    /// Opens a framework event stream.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or an error if a stream is already open.
    pub async fn begin_event_push(&mut self) -> ProtocolResult<EventPush<'_>> {
        self.open_stream(RpcMethod::PushFrameworkEvents, &Empty {})
            .await?;
        Ok(EventPush { client: self })
    }

    /// Subscribes to runtime stats snapshots.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or an error if a stream is already open.
    pub async fn stream_runtime_stats(&mut self) -> ProtocolResult<StatsSubscription<'_>> {
        self.open_stream(RpcMethod::StreamRuntimeStats, &Empty {})
            .await?;
        Ok(StatsSubscription {
            client: self,
            finished: false,
        })
    }

    /// Fetches up to `limit` recent events, newest first. Zero asks for the
    /// server's default.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn get_recent_events(&mut self, limit: u32) -> ProtocolResult<Vec<EventLogEntry>> {
        self.open_stream(RpcMethod::GetRecentEvents, &RecentEventsRequest { limit })
            .await?;

        let mut entries = Vec::new();
        loop {
            let frame = self.recv_frame(Some(self.timeout)).await?;
            match frame.kind {
                FrameKind::StreamItem => entries.push(frame.decode("EventLogEntry")?),
                FrameKind::StreamEnd => {
                    self.stream_open = false;
                    check_status(&frame.decode("RpcStatus")?)?;
                    return Ok(entries);
                },
                other => return Err(unexpected(other, "GetRecentEvents")),
            }
        }
    }

    async fn unary<M: Message + Default>(
        &mut self,
        method: RpcMethod,
        request: &impl Message,
        reply_name: &'static str,
    ) -> ProtocolResult<M> {
        self.ensure_idle()?;
        self.send_frame(Frame::call(method, request)).await?;

        let frame = self.recv_frame(Some(self.timeout)).await?;
        if frame.kind != FrameKind::Call(method) {
            return Err(unexpected(frame.kind, method.name()));
        }
        frame.decode(reply_name)
    }

    async fn open_stream(&mut self, method: RpcMethod, request: &impl Message) -> ProtocolResult<()> {
        self.ensure_idle()?;
        self.send_frame(Frame::call(method, request)).await?;
        self.stream_open = true;
        Ok(())
    }

    fn ensure_idle(&self) -> ProtocolResult<()> {
        if self.stream_open {
            return Err(ProtocolError::unexpected(
                "a stream on this connection was abandoned without being finished",
            ));
        }
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> ProtocolResult<()> {
        self.connection.send(frame.into_bytes()).await
    }

    /// Receives the next frame, turning error frames into
    /// [`ProtocolError::Status`].
    async fn recv_frame(&mut self, deadline: Option<Duration>) -> ProtocolResult<Frame> {
        let next = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.connection.recv())
                .await
                .map_err(|_| ProtocolError::timeout(duration_ms(limit)))??,
            None => self.connection.recv().await?,
        };
        let frame = Frame::parse(next.ok_or(ProtocolError::ConnectionClosed)?)?;
        if frame.kind == FrameKind::Error {
            let status: RpcStatus = frame.decode("RpcStatus")?;
            return Err(status_error(&status));
        }
        Ok(frame)
    }
}

/// An open `PushFrameworkEvents` call.
#[derive(Debug)]
pub struct EventPush<'a> {
    client: &'a mut DaemonClient,
}

impl EventPush<'_> {
    /// Sends one event.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn send(&mut self, event: &FrameworkEvent) -> ProtocolResult<()> {
        self.client.send_frame(Frame::item(event)).await
    }

    /// Half-closes the stream and waits for the server's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns transport errors or the server's error status.
    pub async fn finish(self) -> ProtocolResult<()> {
        self.client.send_frame(Frame::end(&RpcStatus::ok())).await?;
        let timeout = self.client.timeout;
        let frame = self.client.recv_frame(Some(timeout)).await?;
        match frame.kind {
            FrameKind::Call(RpcMethod::PushFrameworkEvents) => {
                let _: Empty = frame.decode("Empty")?;
                self.client.stream_open = false;
                Ok(())
            },
            FrameKind::StreamEnd => {
                self.client.stream_open = false;
                check_status(&frame.decode("RpcStatus")?)
            },
            other => Err(unexpected(other, "PushFrameworkEvents")),
        }
    }

    /// Abandons the stream. Events already sent have been delivered.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn cancel(self) -> ProtocolResult<()> {
        self.client.send_frame(Frame::bare(FrameKind::Cancel)).await?;
        let timeout = self.client.timeout;
        let frame = self.client.recv_frame(Some(timeout)).await?;
        match frame.kind {
            FrameKind::StreamEnd => {
                self.client.stream_open = false;
                let status: RpcStatus = frame.decode("RpcStatus")?;
                accept_cancelled(&status)
            },
            other => Err(unexpected(other, "PushFrameworkEvents")),
        }
    }
}

/// An open `StreamRuntimeStats` call.
#[derive(Debug)]
pub struct StatsSubscription<'a> {
    client: &'a mut DaemonClient,
    finished: bool,
}

impl StatsSubscription<'_> {
    /// Waits for the next snapshot. Returns `None` once the server has
    /// ended the stream with an OK status.
    ///
    /// # Errors
    ///
    /// Returns transport errors, or the status the server ended the stream
    /// with.
    pub async fn next(&mut self) -> ProtocolResult<Option<RuntimeStatsSnapshot>> {
        if self.finished {
            return Ok(None);
        }
        let frame = self.client.recv_frame(None).await?;
        match frame.kind {
            FrameKind::StreamItem => frame.decode("RuntimeStatsSnapshot").map(Some),
            FrameKind::StreamEnd => {
                self.finish();
                check_status(&frame.decode("RpcStatus")?)?;
                Ok(None)
            },
            other => Err(unexpected(other, "StreamRuntimeStats")),
        }
    }

    /// Cancels the subscription and drains snapshots already in flight.
    /// Returns how many were discarded.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn cancel(mut self) -> ProtocolResult<usize> {
        if self.finished {
            return Ok(0);
        }
        self.client.send_frame(Frame::bare(FrameKind::Cancel)).await?;

        let timeout = self.client.timeout;
        let mut discarded = 0;
        loop {
            let frame = self.client.recv_frame(Some(timeout)).await?;
            match frame.kind {
                FrameKind::StreamItem => discarded += 1,
                FrameKind::StreamEnd => {
                    self.finish();
                    let status: RpcStatus = frame.decode("RpcStatus")?;
                    accept_cancelled(&status)?;
                    return Ok(discarded);
                },
                other => return Err(unexpected(other, "StreamRuntimeStats")),
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.client.stream_open = false;
    }
}

fn status_error(status: &RpcStatus) -> ProtocolError {
    ProtocolError::Status {
        code: StatusCode::try_from(status.code).unwrap_or(StatusCode::Unavailable),
        message: status.message.clone(),
    }
}

fn check_status(status: &RpcStatus) -> ProtocolResult<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(status_error(status))
    }
}

/// A cancelled stream may also have completed on its own first.
fn accept_cancelled(status: &RpcStatus) -> ProtocolResult<()> {
    match StatusCode::try_from(status.code) {
        Ok(StatusCode::Ok | StatusCode::Cancelled) => Ok(()),
        _ => Err(status_error(status)),
    }
}

fn unexpected(kind: FrameKind, call: &str) -> ProtocolError {
    ProtocolError::unexpected(format!("{kind:?} frame in reply to {call}"))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
