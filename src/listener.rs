//! Listening sockets for on-demand children
//!
//! A [`ConnectionListener`] owns the socket an on-demand child is reached
//! through. Once started, every accepted connection activates a worker via a
//! [`WorkerActivator`] and is then passed to a [`ConnectionHandoff`], which by
//! default relays the bytes to the worker's own socket.

use crate::config::SocketSpec;
use crate::error::{BindError, SpawnError};
use crate::spawn::ActiveWorker;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF_MS: u64 = 100;

/// Interval between connection attempts when waiting for a socket
const CONNECT_RETRY_INTERVAL_MS: u64 = 50;

/// Any bidirectional byte stream accepted by a listener
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Produces a live worker for a child when a connection arrives
#[async_trait]
pub trait WorkerActivator: Send + Sync {
    async fn activate(&self, child: &str) -> Result<ActiveWorker, SpawnError>;
}

/// Takes over an accepted connection once a worker is available.
///
/// FastCGI processing happens on the other side of this trait.
#[async_trait]
pub trait ConnectionHandoff: Send + Sync {
    async fn hand_off(&self, stream: BoxedStream, worker: &ActiveWorker) -> io::Result<()>;
}

/// Relays the connection byte-for-byte to the worker's socket
#[derive(Debug, Clone)]
pub struct RelayHandoff {
    connect_timeout: Duration,
}

impl RelayHandoff {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ConnectionHandoff for RelayHandoff {
    async fn hand_off(&self, mut stream: BoxedStream, worker: &ActiveWorker) -> io::Result<()> {
        let Some(socket) = worker.socket.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "worker did not report a socket",
            ));
        };

        // A fresh worker may not be listening yet
        let mut upstream = connect_with_retry(socket, self.connect_timeout).await?;
        let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(pid = worker.pid, socket = %socket, sent, received, "Relayed connection");
        Ok(())
    }
}

/// Open a stream to `spec`
pub async fn connect(spec: &SocketSpec) -> io::Result<BoxedStream> {
    match spec {
        SocketSpec::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        #[cfg(unix)]
        SocketSpec::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        SocketSpec::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

/// Keep connecting to `spec` until it succeeds or `timeout` elapses
pub async fn connect_with_retry(spec: &SocketSpec, timeout: Duration) -> io::Result<BoxedStream> {
    let start = Instant::now();
    loop {
        match connect(spec).await {
            Ok(stream) => return Ok(stream),
            Err(e) if start.elapsed() >= timeout => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_INTERVAL_MS)).await,
        }
    }
}

/// Lifecycle of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, no socket yet
    Unbound,
    /// Socket bound and listening
    Listening,
    /// Socket closed, accept loop finished
    Closed,
}

enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl BoundSocket {
    async fn accept(&self) -> io::Result<BoxedStream> {
        match self {
            BoundSocket::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            BoundSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Socket an on-demand child is reached through
pub struct ConnectionListener {
    spec: SocketSpec,
    backlog: u32,
    socket: Option<BoundSocket>,
}

impl ConnectionListener {
    /// Create an unbound listener
    pub fn new(spec: SocketSpec, backlog: u32) -> Self {
        Self {
            spec,
            backlog,
            socket: None,
        }
    }

    /// Create and bind a listener. Must be called within a tokio runtime.
    pub fn bind(spec: SocketSpec, backlog: u32) -> Result<Self, BindError> {
        let mut listener = Self::new(spec, backlog);
        listener.open()?;
        Ok(listener)
    }

    pub fn spec(&self) -> &SocketSpec {
        &self.spec
    }

    pub fn state(&self) -> ListenerState {
        if self.socket.is_some() {
            ListenerState::Listening
        } else {
            ListenerState::Unbound
        }
    }

    /// Bind the socket if not bound yet
    pub fn open(&mut self) -> Result<(), BindError> {
        if self.socket.is_some() {
            return Ok(());
        }

        let socket = match &self.spec {
            SocketSpec::Tcp(addr) => BoundSocket::Tcp(bind_tcp(*addr, self.backlog)?),
            #[cfg(unix)]
            SocketSpec::Unix(path) => BoundSocket::Unix(bind_unix(path, self.backlog)?),
            #[cfg(not(unix))]
            SocketSpec::Unix(_) => {
                return Err(BindError::Unsupported {
                    addr: self.spec.to_string(),
                })
            }
        };

        debug!(socket = %self.spec, backlog = self.backlog, "Socket bound");
        self.socket = Some(socket);
        Ok(())
    }

    /// Close the socket without ever serving it
    pub fn close(mut self) {
        if self.socket.take().is_some() {
            remove_socket_file(&self.spec);
        }
    }

    /// Start the accept loop for `child`. Does not block.
    ///
    /// The loop ends when the returned handle is stopped or `stop_flag`
    /// turns true.
    pub fn start(
        mut self,
        child: String,
        activator: Arc<dyn WorkerActivator>,
        handoff: Arc<dyn ConnectionHandoff>,
        stop_flag: watch::Receiver<bool>,
    ) -> Result<ListenerHandle, BindError> {
        self.open()?;
        let Some(socket) = self.socket.take() else {
            return Err(BindError::Io {
                addr: self.spec.to_string(),
                source: io::Error::new(io::ErrorKind::NotConnected, "socket not bound"),
            });
        };

        let state = Arc::new(Mutex::new(ListenerState::Listening));
        let (stop_tx, stop_rx) = watch::channel(false);
        let spec = self.spec.clone();

        let task = tokio::spawn(accept_loop(
            socket,
            spec.clone(),
            child,
            activator,
            handoff,
            stop_rx,
            stop_flag,
            Arc::clone(&state),
        ));

        Ok(ListenerHandle {
            spec,
            state,
            stop_tx,
            task: Some(task),
        })
    }
}

/// Handle to a running accept loop
pub struct ListenerHandle {
    spec: SocketSpec,
    state: Arc<Mutex<ListenerState>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn spec(&self) -> &SocketSpec {
        &self.spec
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    /// Close the socket and wait for the accept loop to exit. Connections
    /// already handed off keep running.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(socket = %self.spec, error = %e, "Accept loop ended abnormally");
            }
        }
        *self.state.lock() = ListenerState::Closed;
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    socket: BoundSocket,
    spec: SocketSpec,
    child: String,
    activator: Arc<dyn WorkerActivator>,
    handoff: Arc<dyn ConnectionHandoff>,
    mut stop_rx: watch::Receiver<bool>,
    mut stop_flag: watch::Receiver<bool>,
    state: Arc<Mutex<ListenerState>>,
) {
    info!(child = %child, socket = %spec, "Listening for connections");

    loop {
        // Also covers a flag that was already set when the loop started
        if *stop_flag.borrow() {
            break;
        }
        tokio::select! {
            result = socket.accept() => {
                match result {
                    Ok(stream) => {
                        let activator = Arc::clone(&activator);
                        let handoff = Arc::clone(&handoff);
                        let child = child.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, &child, activator, handoff).await;
                        });
                    }
                    Err(e) => {
                        error!(child = %child, socket = %spec, error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS)).await;
                    }
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            changed = stop_flag.changed() => {
                if changed.is_err() || *stop_flag.borrow() {
                    break;
                }
            }
        }
    }

    drop(socket);
    remove_socket_file(&spec);
    *state.lock() = ListenerState::Closed;
    info!(child = %child, socket = %spec, "Listener closed");
}

async fn serve_connection(
    stream: BoxedStream,
    child: &str,
    activator: Arc<dyn WorkerActivator>,
    handoff: Arc<dyn ConnectionHandoff>,
) {
    let worker = match activator.activate(child).await {
        Ok(worker) => worker,
        Err(e) => {
            error!(child, error = %e, code = e.code(), "Couldn't activate worker for connection");
            return;
        }
    };

    if let Err(e) = handoff.hand_off(stream, &worker).await {
        debug!(child, pid = worker.pid, error = %e, "Connection handoff ended with error");
    }
}

fn bind_tcp(addr: std::net::SocketAddr, backlog: u32) -> Result<TcpListener, BindError> {
    let name = format!("tcp:{}", addr);
    let socket = match addr {
        std::net::SocketAddr::V4(_) => TcpSocket::new_v4(),
        std::net::SocketAddr::V6(_) => TcpSocket::new_v6(),
    };
    let socket = socket.map_err(|e| BindError::from_io(name.clone(), e))?;

    #[cfg(unix)]
    socket
        .set_reuseaddr(true)
        .map_err(|e| BindError::from_io(name.clone(), e))?;

    socket
        .bind(addr)
        .map_err(|e| BindError::from_io(name.clone(), e))?;
    socket
        .listen(backlog)
        .map_err(|e| BindError::from_io(name, e))
}

/// Bind a Unix listener at `path` with the given backlog.
///
/// A leftover socket file nobody listens on is removed first; a live one is
/// reported as in use.
#[cfg(unix)]
pub(crate) fn bind_unix(path: &std::path::Path, backlog: u32) -> Result<UnixListener, BindError> {
    use std::os::unix::io::AsRawFd;

    let name = format!("unix:{}", path.display());
    remove_stale_socket(path, &name)?;

    let listener = std::os::unix::net::UnixListener::bind(path)
        .map_err(|e| BindError::from_io(name.clone(), e))?;

    // std listens with a fixed backlog; listening again applies ours
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    let result = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if result != 0 {
        return Err(BindError::from_io(name, io::Error::last_os_error()));
    }

    listener
        .set_nonblocking(true)
        .map_err(|e| BindError::from_io(name.clone(), e))?;
    UnixListener::from_std(listener).map_err(|e| BindError::from_io(name, e))
}

#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path, name: &str) -> Result<(), BindError> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BindError::from_io(name, e)),
    };

    if !metadata.file_type().is_socket() {
        return Err(BindError::AddrInUse {
            addr: name.to_string(),
        });
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(BindError::AddrInUse {
            addr: name.to_string(),
        });
    }

    debug!(socket = %path.display(), "Removing stale socket");
    std::fs::remove_file(path).map_err(|e| BindError::from_io(name, e))
}

fn remove_socket_file(spec: &SocketSpec) {
    if let SocketSpec::Unix(path) = spec {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}
