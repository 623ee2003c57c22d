use crate::config::SocketSpec;
use crate::error::SpawnError;
use crate::privilege::{spawn_as, SpawnRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Interval for polling whether a process has exited (in milliseconds)
const EXIT_POLL_INTERVAL_MS: u64 = 50;

/// Timeout for liveness and signal requests to a shim (in milliseconds)
const SHIM_QUERY_TIMEOUT_MS: u64 = 1000;

/// How a worker (or the shim brokering workers) is brought to life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnStrategy {
    /// Run the FastCGI server directly: `command --config-file <config_path>`
    Static {
        command: String,
        config_path: PathBuf,
    },
    /// Ask the shim listening on `shim_socket` for a worker
    OnDemand {
        shim_socket: PathBuf,
        /// How long to keep trying to reach the shim
        timeout: Duration,
    },
    /// Start the shim: `shim_command <shim_socket> <config_path> <command>`.
    /// The shim's lifetime is not tracked.
    Shim {
        shim_command: String,
        shim_socket: PathBuf,
        config_path: PathBuf,
        command: String,
    },
}

/// Result of executing a spawn request
#[derive(Debug)]
pub enum Spawned {
    /// A process the manager tracks
    Process(ProcessHandle),
    /// A fire-and-forget process (the shim)
    Detached { pid: Option<u32> },
}

impl Spawned {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Spawned::Process(handle) => handle.pid(),
            Spawned::Detached { pid } => *pid,
        }
    }
}

/// Handle to a running worker
#[derive(Debug)]
pub enum ProcessHandle {
    /// Process spawned directly by the manager
    Local(Child),
    /// Worker spawned by a shim. Liveness and signals go through the shim,
    /// which still holds the unreaped process.
    Brokered {
        pid: u32,
        socket: Option<SocketSpec>,
        shim_socket: PathBuf,
    },
}

/// Where a live worker can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWorker {
    pub pid: Option<u32>,
    pub socket: Option<SocketSpec>,
}

/// Signal delivered to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSignal {
    Term,
    Kill,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessHandle::Local(child) => child.id(),
            ProcessHandle::Brokered { pid, .. } => Some(*pid),
        }
    }

    pub fn worker(&self) -> ActiveWorker {
        match self {
            ProcessHandle::Local(child) => ActiveWorker {
                pid: child.id(),
                socket: None,
            },
            ProcessHandle::Brokered { pid, socket, .. } => ActiveWorker {
                pid: Some(*pid),
                socket: socket.clone(),
            },
        }
    }

    /// Check whether the process is gone. Reaps local children. A brokered
    /// worker whose shim cannot be reached counts as gone.
    pub async fn has_exited(&mut self) -> bool {
        match self {
            ProcessHandle::Local(child) => match child.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    debug!(error = %e, "Failed to query child status, treating as exited");
                    true
                }
            },
            ProcessHandle::Brokered { pid, shim_socket, .. } => !brokered_alive(shim_socket, *pid).await,
        }
    }

    /// Request immediate termination (SIGKILL). A process that already died
    /// is not an error.
    pub async fn kill(&mut self) {
        match self {
            ProcessHandle::Local(child) => {
                if let Err(e) = child.start_kill() {
                    if matches!(child.try_wait(), Ok(Some(_))) {
                        debug!("Process exited before it could be killed");
                    } else {
                        warn!(error = %e, "Failed to kill process");
                    }
                }
            }
            ProcessHandle::Brokered { pid, shim_socket, .. } => {
                signal_brokered(shim_socket, *pid, WorkerSignal::Kill).await
            }
        }
    }

    /// Request graceful shutdown (SIGTERM)
    pub async fn terminate(&mut self) {
        match self {
            ProcessHandle::Local(child) => match child.id() {
                Some(pid) => send_signal(pid, WorkerSignal::Term),
                None => debug!("Process already reaped"),
            },
            ProcessHandle::Brokered { pid, shim_socket, .. } => {
                signal_brokered(shim_socket, *pid, WorkerSignal::Term).await
            }
        }
    }

    /// Wait up to `timeout` for the process to exit. Returns true if it did.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        if let ProcessHandle::Local(child) = self {
            return match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(?status, "Process exited");
                    true
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Error waiting for process");
                    !matches!(child.try_wait(), Ok(None))
                }
                Err(_) => false,
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited().await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)).await;
        }
    }
}

/// Signal a process by pid. Only call this for a process the caller has not
/// reaped yet.
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: WorkerSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        WorkerSignal::Term => Signal::SIGTERM,
        WorkerSignal::Kill => Signal::SIGKILL,
    };

    match kill(Pid::from_raw(pid as i32), nix_signal) {
        Ok(()) => debug!(pid, signal = ?signal, "Signal sent"),
        // Exited but not reaped yet
        Err(Errno::ESRCH) => debug!(pid, "Process already gone"),
        Err(e) => warn!(pid, signal = ?signal, error = %e, "Failed to signal process"),
    }
}

#[cfg(not(unix))]
pub(crate) fn send_signal(pid: u32, signal: WorkerSignal) {
    warn!(pid, signal = ?signal, "Signals are unsupported on this platform");
}

#[cfg(unix)]
async fn brokered_alive(shim_socket: &Path, pid: u32) -> bool {
    let timeout = Duration::from_millis(SHIM_QUERY_TIMEOUT_MS);
    match crate::shim::worker_status(shim_socket, pid, timeout).await {
        Ok(alive) => alive,
        Err(e) => {
            warn!(pid, error = %e, "Shim unreachable, treating worker as gone");
            false
        }
    }
}

#[cfg(not(unix))]
async fn brokered_alive(_shim_socket: &Path, _pid: u32) -> bool {
    false
}

#[cfg(unix)]
async fn signal_brokered(shim_socket: &Path, pid: u32, signal: WorkerSignal) {
    let timeout = Duration::from_millis(SHIM_QUERY_TIMEOUT_MS);
    match crate::shim::signal_worker(shim_socket, pid, signal, timeout).await {
        Ok(true) => debug!(pid, signal = ?signal, "Signal sent through shim"),
        Ok(false) => debug!(pid, "Worker already gone"),
        Err(e) => warn!(pid, signal = ?signal, error = %e, "Failed to signal worker through shim"),
    }
}

#[cfg(not(unix))]
async fn signal_brokered(_shim_socket: &Path, pid: u32, signal: WorkerSignal) {
    warn!(pid, signal = ?signal, "Signalling brokered workers is unsupported on this platform");
}

/// Split a command line and append `extra` arguments
pub(crate) fn build_command<I, S>(command_line: &str, extra: I) -> Result<(String, Command), SpawnError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let words = shell_words::split(command_line).map_err(|e| SpawnError::Os {
        program: command_line.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })?;
    let (program, args) = words.split_first().ok_or(SpawnError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.args(extra);
    cmd.stdin(Stdio::null());

    Ok((program.clone(), cmd))
}

/// Execute a spawn request. The single entry point for every strategy.
pub async fn spawn(request: &SpawnRequest) -> Result<Spawned, SpawnError> {
    match &request.strategy {
        SpawnStrategy::Static {
            command,
            config_path,
        } => {
            let (program, mut cmd) =
                build_command(command, [std::ffi::OsStr::new("--config-file"), config_path.as_os_str()])?;
            // Workers share the manager's stdout/stderr
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());

            let child = spawn_as(cmd, &program, &request.identity)?;
            debug!(program = %program, pid = child.id(), user = %request.identity, "Spawned static worker");
            Ok(Spawned::Process(ProcessHandle::Local(child)))
        }
        SpawnStrategy::Shim {
            shim_command,
            shim_socket,
            config_path,
            command,
        } => {
            let (program, cmd) = build_command(
                shim_command,
                [
                    shim_socket.as_os_str(),
                    config_path.as_os_str(),
                    std::ffi::OsStr::new(command),
                ],
            )?;

            let child = spawn_as(cmd, &program, &request.identity)?;
            let pid = child.id();
            info!(program = %program, pid, socket = %shim_socket.display(), user = %request.identity, "Spawned shim");
            // Dropping the handle does not kill the shim; tokio reaps it on exit
            drop(child);
            Ok(Spawned::Detached { pid })
        }
        SpawnStrategy::OnDemand {
            shim_socket,
            timeout,
        } => spawn_on_demand(shim_socket, *timeout).await,
    }
}

#[cfg(unix)]
async fn spawn_on_demand(shim_socket: &Path, timeout: Duration) -> Result<Spawned, SpawnError> {
    let lease = crate::shim::request_worker(shim_socket, timeout).await?;
    let socket = lease
        .socket
        .as_deref()
        .map(str::parse::<SocketSpec>)
        .transpose()
        .map_err(|e| SpawnError::ShimProtocol {
            socket: shim_socket.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(Spawned::Process(ProcessHandle::Brokered {
        pid: lease.pid,
        socket,
        shim_socket: shim_socket.to_path_buf(),
    }))
}

#[cfg(not(unix))]
async fn spawn_on_demand(_shim_socket: &Path, _timeout: Duration) -> Result<Spawned, SpawnError> {
    Err(SpawnError::Unsupported("on-demand activation"))
}

/// Executes spawn requests.
///
/// The supervisor goes through this trait rather than calling [`spawn`]
/// directly so that process creation can be observed or replaced.
#[async_trait]
pub trait SpawnBackend: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Spawned, SpawnError>;
}

/// Spawns real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

#[async_trait]
impl SpawnBackend for OsSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<Spawned, SpawnError> {
        spawn(request).await
    }
}
