//! Local-socket server.
//!
//! Binds the daemon's Unix socket and serves each accepted connection on
//! its own task: handshake first, then the [`Connection`] call loop.
//!
//! # Socket lifecycle
//!
//! 1. The parent directory is created with mode 0700 if missing. An existing
//!    directory is used as is, but never through a symlink.
//! 2. A stale socket left by a previous run is removed. Any other file at
//!    the path is an error.
//! 3. The socket file is chmod'ed to the configured mode. Filesystem
//!    permissions are the only access control.
//! 4. The socket file is removed on shutdown and on drop.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, HandshakeResult};
use super::error::{ProtocolError, ProtocolResult};
use super::handshake::ServerHandshake;
use crate::service::RpcServices;

/// Mode of a socket directory created by the server.
const DIRECTORY_MODE: u32 = 0o700;

/// Default socket file mode: owner and group may connect.
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;

/// Default bound on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Time a new connection has to send its hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the Unix socket.
    pub socket_path: PathBuf,
    /// Mode applied to the socket file.
    pub socket_mode: u32,
    /// Connections served at once; extra connections are dropped.
    pub max_connections: usize,
    /// Identification sent in `HelloAck`.
    pub server_info: String,
}

impl ServerConfig {
    /// Creates a configuration with default mode and connection limit.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            socket_mode: DEFAULT_SOCKET_MODE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            server_info: default_server_info(),
        }
    }

    /// Sets the connection limit.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the socket file mode.
    #[must_use]
    pub const fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }
}

/// `thanatosd/<crate version>`.
#[must_use]
pub fn default_server_info() -> String {
    format!("thanatosd/{}", env!("CARGO_PKG_VERSION"))
}

/// The bound socket server.
pub struct ProtocolServer {
    config: ServerConfig,
    listener: UnixListener,
    connection_sem: Arc<Semaphore>,
    handshake: Arc<ServerHandshake>,
    services: RpcServices,
}

impl ProtocolServer {
    /// Prepares the socket path and binds it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be prepared, a non-socket
    /// file occupies the path, or binding or chmod fails.
    pub fn bind(config: ServerConfig, services: RpcServices) -> ProtocolResult<Self> {
        if let Some(parent) = config.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        remove_stale_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to bind {}: {e}", config.socket_path.display()),
            )
        })?;
        set_mode(&config.socket_path, config.socket_mode)?;

        info!(
            socket = %config.socket_path.display(),
            mode = format_args!("{:o}", config.socket_mode),
            max_connections = config.max_connections,
            "RPC socket bound"
        );

        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            handshake: Arc::new(ServerHandshake::new(config.server_info.clone())),
            config,
            listener,
            services,
        })
    }

    /// Path of the bound socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accepts and serves connections until `shutdown` fires, then waits for
    /// in-flight connections (which observe the same token) to finish.
    ///
    /// # Errors
    ///
    /// Returns an error only if removing the socket file fails.
    pub async fn run(self, shutdown: CancellationToken) -> ProtocolResult<()> {
        let mut connections = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            while connections.try_join_next().is_some() {}

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                },
            };
            let Ok(permit) = Arc::clone(&self.connection_sem).try_acquire_owned() else {
                warn!(
                    max_connections = self.config.max_connections,
                    "connection limit reached, dropping connection"
                );
                continue;
            };

            connections.spawn(handle_connection(
                stream,
                permit,
                Arc::clone(&self.handshake),
                self.services.clone(),
                shutdown.clone(),
            ));
        }

        info!(
            in_flight = connections.len(),
            "RPC server stopping, draining connections"
        );
        while connections.join_next().await.is_some() {}
        self.cleanup()
    }

    /// Removes the socket file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn cleanup(&self) -> ProtocolResult<()> {
        let path = &self.config.socket_path;
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(socket = %path.display(), "removed socket file");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to remove socket {}: {e}", path.display()),
            ))),
        }
    }
}

impl Drop for ProtocolServer {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("failed to clean up socket on drop: {e}");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    _permit: OwnedSemaphorePermit,
    handshake: Arc<ServerHandshake>,
    services: RpcServices,
    shutdown: CancellationToken,
) {
    match stream.peer_cred() {
        Ok(cred) => debug!(uid = cred.uid(), gid = cred.gid(), pid = ?cred.pid(), "accepted connection"),
        Err(e) => debug!(error = %e, "accepted connection without peer credentials"),
    }

    let mut connection = Connection::new(stream);
    let outcome = tokio::select! {
        () = shutdown.cancelled() => return,
        result = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            connection.accept_handshake(&handshake, &shutdown),
        ) => result,
    };
    match outcome {
        Ok(Ok(HandshakeResult::Success)) => {},
        Ok(Ok(HandshakeResult::Failed | HandshakeResult::ConnectionClosed)) => return,
        Ok(Err(e)) => {
            warn!(error = %e, "handshake failed");
            return;
        },
        Err(_) => {
            warn!(timeout_ms = HANDSHAKE_TIMEOUT.as_millis(), "no hello received, closing");
            return;
        },
    }

    match connection.serve(&services, &shutdown).await {
        Ok(()) => debug!("connection closed"),
        Err(e) if e.is_protocol_violation() => warn!(error = %e, "closing connection after protocol violation"),
        Err(e) => debug!(error = %e, "connection ended"),
    }
}

/// Creates `path` with [`DIRECTORY_MODE`] if missing. Existing directories
/// keep their permissions; symlinks and non-directories are refused.
fn ensure_directory(path: &Path) -> ProtocolResult<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_symlink() => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is a symlink, refusing to use it as socket directory", path.display()),
        ))),
        Ok(metadata) if !metadata.is_dir() => Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a directory", path.display()),
        ))),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {e}", path.display()),
                )
            })?;
            set_mode(path, DIRECTORY_MODE)
        },
        Err(e) => Err(ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to stat {}: {e}", path.display()),
        ))),
    }
}

fn remove_stale_socket(path: &Path) -> ProtocolResult<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !metadata.file_type().is_socket() {
        return Err(ProtocolError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        )));
    }
    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed stale socket");
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> ProtocolResult<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        ProtocolError::Io(io::Error::new(
            e.kind(),
            format!("failed to chmod {}: {e}", path.display()),
        ))
    })
}
