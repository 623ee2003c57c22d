//! fastcgi-fpm - A process manager for FastCGI application servers
//!
//! This library supervises a set of FastCGI children, one per configuration
//! file:
//! - Static children are started once at startup and kept in a registry
//! - On-demand children get a listening socket owned by the manager; a worker
//!   is brokered through a shim process when the first connection arrives
//! - Every child runs as its configured user, the owner of its configuration
//!   file, or the manager's own identity, in that order
//! - Children are stopped with SIGTERM and a grace period, or SIGKILL

pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod privilege;
#[cfg(unix)]
pub mod shim;
pub mod spawn;
pub mod supervisor;

pub use config::{ChildConfig, Config, InstanceType, SocketSpec};
pub use error::{BindError, ConfigError, SpawnError};
pub use supervisor::{ChildStatus, Supervisor, SupervisorBuilder};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
