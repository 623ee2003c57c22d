//! Error types for configuration, spawning and socket binding

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// A `ConfigError` on a child configuration only aborts that child; the rest
/// of the batch keeps starting. `InvalidGlobal` is the one variant returned to
/// the caller of `Supervisor::start_all`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read configuration {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for the expected schema
    #[error("failed to parse configuration {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An on-demand child has no shim socket configured
    #[error("child '{name}': on-demand instances require 'shim_socket'")]
    MissingShimSocket { name: String },

    /// An on-demand child has no listening socket configured
    #[error("child '{name}': on-demand instances require 'socket'")]
    MissingListenSocket { name: String },

    /// The socket specification could not be parsed
    #[error("invalid socket specification '{spec}': {reason}")]
    InvalidSocketSpec { spec: String, reason: String },

    /// The command line to execute is empty or not parseable
    #[error("child '{name}': invalid command line: {reason}")]
    InvalidCommand { name: String, reason: String },

    /// The supervisor's own configuration is unusable
    #[error("invalid global configuration: {0}")]
    InvalidGlobal(String),
}

/// Errors raised while starting a worker, the shim, or activating a worker
/// through the shim. All of them are recoverable at the supervisor level.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Nothing to execute
    #[error("empty command line")]
    EmptyCommand,

    /// The OS refused to create the process
    #[error("failed to spawn '{program}': {source}")]
    Os {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The target user does not exist
    #[error("unknown user '{user}'")]
    UnknownUser { user: String },

    /// The user database could not be queried
    #[error("failed to look up user '{user}': {reason}")]
    UserLookup { user: String, reason: String },

    /// The forked child could not switch to the target identity; nothing was
    /// executed
    #[error("failed to switch to user '{user}' for '{program}': {source}")]
    IdentitySwitch {
        user: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The shim socket never accepted a connection
    #[error("shim at {} unavailable after {timeout:?}: {source}", socket.display())]
    ShimUnavailable {
        socket: PathBuf,
        timeout: Duration,
        #[source]
        source: std::io::Error,
    },

    /// The shim answered with something other than a worker lease
    #[error("shim at {} returned an invalid reply: {reason}", socket.display())]
    ShimProtocol { socket: PathBuf, reason: String },

    /// Activation was requested for a child that is not registered
    #[error("no child named '{name}' is registered")]
    UnknownChild { name: String },

    /// Activation was requested for a child that is not on-demand
    #[error("child '{name}' is not an on-demand instance")]
    NotOnDemand { name: String },

    /// The strategy needs a capability this platform does not have
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl SpawnError {
    /// Short code used as a structured log field
    pub fn code(&self) -> &'static str {
        match self {
            SpawnError::EmptyCommand => "EMPTY_COMMAND",
            SpawnError::Os { .. } => "OS_SPAWN_FAILED",
            SpawnError::UnknownUser { .. } => "UNKNOWN_USER",
            SpawnError::UserLookup { .. } => "USER_LOOKUP_FAILED",
            SpawnError::IdentitySwitch { .. } => "IDENTITY_SWITCH_FAILED",
            SpawnError::ShimUnavailable { .. } => "SHIM_UNAVAILABLE",
            SpawnError::ShimProtocol { .. } => "SHIM_PROTOCOL",
            SpawnError::UnknownChild { .. } => "UNKNOWN_CHILD",
            SpawnError::NotOnDemand { .. } => "NOT_ON_DEMAND",
            SpawnError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

/// Errors raised when a listening socket cannot be created
#[derive(Debug, Error)]
pub enum BindError {
    /// Somebody is already listening on the address
    #[error("address {addr} is already in use")]
    AddrInUse { addr: String },

    /// The supervisor may not bind the address
    #[error("permission denied binding {addr}")]
    PermissionDenied { addr: String },

    /// Any other socket error
    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Unix sockets on a platform without them
    #[error("socket {addr} is not supported on this platform")]
    Unsupported { addr: String },
}

impl BindError {
    /// Classify an I/O error returned by bind/listen
    pub fn from_io(addr: impl Into<String>, source: std::io::Error) -> Self {
        let addr = addr.into();
        match source.kind() {
            std::io::ErrorKind::AddrInUse => BindError::AddrInUse { addr },
            std::io::ErrorKind::PermissionDenied => BindError::PermissionDenied { addr },
            _ => BindError::Io { addr, source },
        }
    }
}
