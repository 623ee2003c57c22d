//! Shim protocol and broker
//!
//! The shim is a small always-running process that owns the on-demand
//! workers of one child. The manager connects to the shim's Unix socket and
//! sends one JSON line per request:
//!
//! ```text
//! -> {"op":"spawn"}
//! <- {"pid":4242,"socket":"unix:/run/fpm/blog-shim.sock.1"}
//! <- {"error":"failed to spawn 'fastcgi-mono-server4': No such file or directory"}
//!
//! -> {"op":"status","pid":4242}
//! <- {"pid":4242,"alive":true}
//!
//! -> {"op":"signal","pid":4242,"signal":"term"}
//! <- {"pid":4242,"alive":true}
//! ```
//!
//! The worker serves FastCGI on the returned socket. Status and signal
//! requests only ever concern the shim's own unreaped workers, so a pid the
//! kernel has since recycled is reported as gone and never signalled.

use crate::error::{BindError, SpawnError};
use crate::listener::bind_unix;
use crate::spawn::{build_command, send_signal, WorkerSignal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval between attempts to reach a shim that is still starting
const CONNECT_RETRY_INTERVAL_MS: u64 = 50;

/// Interval at which the shim polls its workers for exit
const REAP_INTERVAL_MS: u64 = 100;

/// Backlog of the shim's own control socket
const SHIM_BACKLOG: u32 = 64;

/// Request sent to the shim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ShimRequest {
    /// Start a worker and report where it listens
    Spawn,
    /// Ask whether a worker started by this shim is still running
    Status { pid: u32 },
    /// Deliver a signal to a worker started by this shim
    Signal { pid: u32, signal: WorkerSignal },
}

/// A worker started by the shim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLease {
    pub pid: u32,
    /// Socket specification the worker serves on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

/// Reply sent by the shim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShimReply {
    /// Answer to `status` and `signal`. Listed first: a lease has no
    /// `alive` field and falls through to the next variant.
    Worker { pid: u32, alive: bool },
    Lease(WorkerLease),
    Error { error: String },
}

/// Connect to the shim, retrying until `timeout` elapses
async fn connect(socket: &Path, timeout: Duration) -> Result<UnixStream, SpawnError> {
    let start = Instant::now();
    loop {
        match UnixStream::connect(socket).await {
            Ok(stream) => return Ok(stream),
            Err(e) if start.elapsed() >= timeout => {
                return Err(SpawnError::ShimUnavailable {
                    socket: socket.to_path_buf(),
                    timeout,
                    source: e,
                })
            }
            Err(e) => {
                debug!(socket = %socket.display(), error = %e, "Shim not reachable yet");
                tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_INTERVAL_MS)).await;
            }
        }
    }
}

fn protocol_error(socket: &Path, reason: impl Into<String>) -> SpawnError {
    SpawnError::ShimProtocol {
        socket: socket.to_path_buf(),
        reason: reason.into(),
    }
}

/// Send one request line and read one reply line
async fn exchange(socket: &Path, request: &ShimRequest, timeout: Duration) -> Result<ShimReply, SpawnError> {
    let stream = connect(socket, timeout).await?;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_string(request).map_err(|e| protocol_error(socket, e.to_string()))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| protocol_error(socket, e.to_string()))?;

    let mut reply = String::new();
    let mut reader = BufReader::new(reader);
    match tokio::time::timeout(timeout, reader.read_line(&mut reply)).await {
        Ok(Ok(0)) => return Err(protocol_error(socket, "connection closed without reply")),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(protocol_error(socket, e.to_string())),
        Err(_) => return Err(protocol_error(socket, format!("no reply within {:?}", timeout))),
    }

    match serde_json::from_str::<ShimReply>(reply.trim()) {
        Ok(ShimReply::Error { error }) => Err(protocol_error(socket, error)),
        Ok(reply) => Ok(reply),
        Err(e) => Err(protocol_error(socket, format!("malformed reply: {}", e))),
    }
}

/// Ask the shim at `socket` for a new worker
pub async fn request_worker(socket: &Path, timeout: Duration) -> Result<WorkerLease, SpawnError> {
    match exchange(socket, &ShimRequest::Spawn, timeout).await? {
        ShimReply::Lease(lease) => Ok(lease),
        other => Err(protocol_error(socket, format!("unexpected reply to spawn: {:?}", other))),
    }
}

/// Ask the shim whether worker `pid` is still running
pub async fn worker_status(socket: &Path, pid: u32, timeout: Duration) -> Result<bool, SpawnError> {
    worker_reply(socket, &ShimRequest::Status { pid }, timeout).await
}

/// Have the shim signal worker `pid`. Returns false if the worker was
/// already gone.
pub async fn signal_worker(
    socket: &Path,
    pid: u32,
    signal: WorkerSignal,
    timeout: Duration,
) -> Result<bool, SpawnError> {
    worker_reply(socket, &ShimRequest::Signal { pid, signal }, timeout).await
}

async fn worker_reply(socket: &Path, request: &ShimRequest, timeout: Duration) -> Result<bool, SpawnError> {
    match exchange(socket, request, timeout).await? {
        ShimReply::Worker { alive, .. } => Ok(alive),
        other => Err(protocol_error(socket, format!("unexpected reply: {:?}", other))),
    }
}

struct Worker {
    child: Child,
    socket: PathBuf,
}

/// Poll worker `pid`, reaping it if it exited. Returns true while it runs.
fn check_worker(workers: &mut HashMap<u32, Worker>, pid: u32) -> bool {
    let Some(worker) = workers.get_mut(&pid) else {
        return false;
    };
    match worker.child.try_wait() {
        Ok(None) => return true,
        Ok(Some(status)) => info!(pid, ?status, "On-demand worker exited"),
        Err(e) => warn!(pid, error = %e, "Error waiting for on-demand worker"),
    }
    if let Some(worker) = workers.remove(&pid) {
        let _ = std::fs::remove_file(&worker.socket);
    }
    false
}

/// The broker side of the protocol, run by the `fastcgi-shim` binary
pub struct ShimServer {
    socket: PathBuf,
    config_path: PathBuf,
    command: String,
    next_worker: AtomicU64,
    workers: Arc<Mutex<HashMap<u32, Worker>>>,
}

impl ShimServer {
    pub fn new(socket: impl Into<PathBuf>, config_path: impl Into<PathBuf>, command: &str) -> Arc<Self> {
        Arc::new(Self {
            socket: socket.into(),
            config_path: config_path.into(),
            command: command.to_string(),
            next_worker: AtomicU64::new(1),
            workers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Socket path handed to the `n`th worker
    pub fn worker_socket(&self, n: u64) -> PathBuf {
        let mut path = self.socket.clone().into_os_string();
        path.push(format!(".{}", n));
        PathBuf::from(path)
    }

    /// Serve requests until `shutdown_rx` turns true
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), BindError> {
        let listener = bind_unix(&self.socket, SHIM_BACKLOG)?;
        info!(socket = %self.socket.display(), config = %self.config_path.display(), "Shim listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.serve(stream).await {
                                    debug!(error = %e, "Shim connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept shim connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shim shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.socket) {
            debug!(socket = %self.socket.display(), error = %e, "Failed to remove shim socket");
        }
        Ok(())
    }

    async fn serve(&self, stream: UnixStream) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            let reply = match serde_json::from_str::<ShimRequest>(line.trim()) {
                Ok(ShimRequest::Spawn) => match self.spawn_worker() {
                    Ok(lease) => ShimReply::Lease(lease),
                    Err(e) => {
                        error!(error = %e, code = e.code(), "Couldn't start on-demand worker");
                        ShimReply::Error { error: e.to_string() }
                    }
                },
                Ok(ShimRequest::Status { pid }) => ShimReply::Worker {
                    pid,
                    alive: self.worker_alive(pid),
                },
                Ok(ShimRequest::Signal { pid, signal }) => ShimReply::Worker {
                    pid,
                    alive: self.signal(pid, signal),
                },
                Err(e) => ShimReply::Error {
                    error: format!("malformed request: {}", e),
                },
            };

            let mut out = serde_json::to_string(&reply)?;
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
        }

        Ok(())
    }

    /// Whether `pid` is one of this shim's running workers
    pub fn worker_alive(&self, pid: u32) -> bool {
        check_worker(&mut self.workers.lock(), pid)
    }

    fn signal(&self, pid: u32, signal: WorkerSignal) -> bool {
        let mut workers = self.workers.lock();
        if !check_worker(&mut workers, pid) {
            debug!(pid, signal = ?signal, "Not a running worker, signal dropped");
            return false;
        }
        // Still unreaped under the lock, so the pid cannot have been reused
        send_signal(pid, signal);
        true
    }

    fn spawn_worker(&self) -> Result<WorkerLease, SpawnError> {
        let n = self.next_worker.fetch_add(1, Ordering::SeqCst);
        let worker_socket = self.worker_socket(n);
        let socket_spec = format!("unix:{}", worker_socket.display());

        let (program, mut cmd) = build_command(
            &self.command,
            [
                std::ffi::OsStr::new("--config-file"),
                self.config_path.as_os_str(),
                std::ffi::OsStr::new("--socket"),
                std::ffi::OsStr::new(&socket_spec),
            ],
        )?;
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|source| SpawnError::Os {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, socket = %socket_spec, "Started on-demand worker");

        self.workers.lock().insert(
            pid,
            Worker {
                child,
                socket: worker_socket,
            },
        );

        // Reap the worker and clean up its socket once it exits
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(REAP_INTERVAL_MS));
            loop {
                interval.tick().await;
                if !check_worker(&mut workers.lock(), pid) {
                    break;
                }
            }
        });

        Ok(WorkerLease {
            pid,
            socket: Some(socket_spec),
        })
    }
}
