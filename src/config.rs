use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Global configuration for the process manager
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// FastCGI server command line used for every child that does not
    /// override it
    #[serde(default)]
    pub fastcgi_command: String,

    /// Command line of the shim that brokers on-demand workers
    #[serde(default = "default_shim_command")]
    pub shim_command: String,

    /// Directory scanned for `*.toml` child configurations when no explicit
    /// list is given
    pub config_dir: Option<PathBuf>,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,

    /// Delay after starting a static child whose socket is unknown
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Upper bound on waiting for a static child's socket to accept connections
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// Upper bound on reaching a shim or a freshly spawned on-demand worker
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fastcgi_command: String::new(),
            shim_command: default_shim_command(),
            config_dir: None,
            pid_file: None,
            settle_delay_ms: default_settle_delay(),
            ready_timeout_ms: default_ready_timeout(),
            activation_timeout_ms: default_activation_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl Config {
    /// Create a config with the given FastCGI command and defaults elsewhere
    pub fn new(fastcgi_command: &str) -> Self {
        Self {
            fastcgi_command: fastcgi_command.to_string(),
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the settings the supervisor cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        match shell_words::split(&self.fastcgi_command) {
            Ok(words) if !words.is_empty() => {}
            Ok(_) => {
                return Err(ConfigError::InvalidGlobal(
                    "'fastcgi_command' must not be empty".to_string(),
                ))
            }
            Err(e) => {
                return Err(ConfigError::InvalidGlobal(format!(
                    "'fastcgi_command' is not a valid command line: {}",
                    e
                )))
            }
        }

        if self.shim_command.trim().is_empty() {
            return Err(ConfigError::InvalidGlobal(
                "'shim_command' must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// List child configuration files in `config_dir`, sorted by name
    pub fn discover_children(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let Some(dir) = self.config_dir.as_ref() else {
            return Ok(Vec::new());
        };

        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

/// How a child's workers come to life
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// Started once at supervisor startup and kept running (default)
    #[default]
    Static,
    /// Started through the shim when a connection arrives
    #[serde(alias = "on-demand", alias = "on_demand")]
    OnDemand,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceType::Static => f.write_str("static"),
            InstanceType::OnDemand => f.write_str("ondemand"),
        }
    }
}

/// Address a listener binds or a worker serves on.
///
/// Accepted forms: `unix:/path`, a bare absolute path, `tcp:port` (loopback),
/// `tcp:host:port` and `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SocketSpec {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for SocketSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        let invalid = |reason: &str| ConfigError::InvalidSocketSpec {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(path) = spec.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            return Ok(SocketSpec::Unix(PathBuf::from(path)));
        }

        if spec.starts_with('/') {
            return Ok(SocketSpec::Unix(PathBuf::from(spec)));
        }

        let addr = spec.strip_prefix("tcp:").unwrap_or(spec);
        if addr.is_empty() {
            return Err(invalid("missing address"));
        }

        // "tcp:9000" binds loopback
        if let Ok(port) = addr.parse::<u16>() {
            return Ok(SocketSpec::Tcp(SocketAddr::from(([127, 0, 0, 1], port))));
        }

        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return Ok(SocketSpec::Tcp(socket_addr));
        }

        if !addr.contains(':') {
            return Err(invalid("expected unix:<path> or tcp:[host:]port"));
        }

        addr.to_socket_addrs()
            .map_err(|e| invalid(&e.to_string()))?
            .next()
            .map(SocketSpec::Tcp)
            .ok_or_else(|| invalid("host did not resolve"))
    }
}

impl TryFrom<String> for SocketSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSpec::Unix(path) => write!(f, "unix:{}", path.display()),
            SocketSpec::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Configuration for a single child, one file per application
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChildConfig {
    /// "static" (default) or "ondemand"
    #[serde(default)]
    pub instance_type: InstanceType,

    /// User the child runs as. Defaults to the owner of the config file.
    pub user: Option<String>,

    /// Socket the child serves FastCGI on. Required for on-demand children,
    /// where the manager listens on it; used as a readiness check for static
    /// children.
    pub socket: Option<SocketSpec>,

    /// Socket of the shim brokering on-demand workers
    pub shim_socket: Option<PathBuf>,

    /// Listen backlog for the on-demand socket
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// FastCGI command line for this child (overrides the global one)
    pub command: Option<String>,
}

impl ChildConfig {
    /// Create a static child config with defaults
    pub fn static_child() -> Self {
        Self {
            instance_type: InstanceType::Static,
            backlog: default_backlog(),
            ..Self::default()
        }
    }

    /// Create an on-demand child config listening on `socket`, brokered by the
    /// shim at `shim_socket`
    pub fn on_demand(socket: SocketSpec, shim_socket: impl Into<PathBuf>) -> Self {
        Self {
            instance_type: InstanceType::OnDemand,
            socket: Some(socket),
            shim_socket: Some(shim_socket.into()),
            backlog: default_backlog(),
            ..Self::default()
        }
    }

    /// Set the user (builder pattern)
    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Set the command line (builder pattern)
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    /// Set the listening socket (builder pattern)
    pub fn with_socket(mut self, socket: SocketSpec) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn load<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ChildConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate(name)?;
        Ok(config)
    }

    /// Explicitly configured user, ignoring blank values
    pub fn explicit_user(&self) -> Option<&str> {
        self.user.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn fastcgi_command<'a>(&'a self, global: &'a Config) -> &'a str {
        self.command.as_deref().unwrap_or(&global.fastcgi_command)
    }

    /// Validate the child configuration
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if let Some(command) = self.command.as_deref() {
            match shell_words::split(command) {
                Ok(words) if !words.is_empty() => {}
                Ok(_) => {
                    return Err(ConfigError::InvalidCommand {
                        name: name.to_string(),
                        reason: "command is empty".to_string(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::InvalidCommand {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        if self.instance_type == InstanceType::OnDemand {
            let shim_missing = self
                .shim_socket
                .as_ref()
                .map_or(true, |p| p.as_os_str().is_empty());
            if shim_missing {
                return Err(ConfigError::MissingShimSocket {
                    name: name.to_string(),
                });
            }
            if self.socket.is_none() {
                return Err(ConfigError::MissingListenSocket {
                    name: name.to_string(),
                });
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_shim_command() -> String {
    "fastcgi-shim".to_string()
}

fn default_settle_delay() -> u64 {
    500 // ms
}

fn default_ready_timeout() -> u64 {
    5000 // ms
}

fn default_activation_timeout() -> u64 {
    5000 // ms
}

fn default_shutdown_grace_period() -> u64 {
    10 // seconds between SIGTERM and SIGKILL
}

fn default_backlog() -> u32 {
    128
}
