use fastcgi_fpm::config::Config;
use fastcgi_fpm::supervisor::Supervisor;
use fastcgi_fpm::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastcgi_fpm=debug".parse().expect("valid log directive")),
        )
        .init();

    // Usage: fastcgi-fpm [global-config.toml] [child-config.toml ...]
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("fpm.toml"));
    let explicit_children: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // Explicit child configurations win over the configured directory
    let descriptors = if explicit_children.is_empty() {
        config.discover_children()?
    } else {
        explicit_children
    };

    print_startup_banner(&config, &descriptors);

    // A second manager on the same PID file refuses to start
    let pid_file = config.pid_file.as_deref().map(PidFile::acquire).transpose()?;
    if let Some(pid_file) = &pid_file {
        info!(path = %pid_file.path.display(), "PID file written and locked");
    }

    let supervisor = Supervisor::new(config);
    supervisor.start_all(&descriptors).await?;

    for child in supervisor.status().await {
        info!(
            child = %child.name,
            instance_type = %child.instance_type,
            pid = child.pid,
            socket = ?child.socket,
            user = child.user.as_deref().unwrap_or("<current>"),
            "Child running"
        );
    }

    // SIGINT/SIGTERM stop gracefully, SIGQUIT kills immediately
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                supervisor.shutdown().await;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                supervisor.shutdown().await;
            }
            _ = sigquit.recv() => {
                info!("Received SIGQUIT, killing all children...");
                supervisor.stop_listeners().await;
                supervisor.kill_force().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
        supervisor.shutdown().await;
    }

    drop(pid_file);

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
type LockedFile = nix::fcntl::Flock<std::fs::File>;

#[cfg(not(unix))]
type LockedFile = std::fs::File;

/// The manager's PID file, exclusively locked while it runs and removed on
/// drop
#[derive(Debug)]
struct PidFile {
    path: PathBuf,
    _file: LockedFile,
}

impl PidFile {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::io::Write;

        // Truncated only once locked, so a running instance keeps its pid
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening PID file {}", path.display()))?;

        #[cfg(unix)]
        let file = {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, Errno::EWOULDBLOCK)) => {
                    anyhow::bail!("another instance is already running ({} is locked)", path.display())
                }
                Err((_, e)) => return Err(e).context("locking PID file"),
            }
        };

        file.set_len(0)?;
        writeln!(&*file, "{}", std::process::id())?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

fn print_startup_banner(config: &Config, descriptors: &[PathBuf]) {
    info!(name = PKG_NAME, version = VERSION, "Starting FastCGI process manager");
    info!(
        fastcgi_command = %config.fastcgi_command,
        shim_command = %config.shim_command,
        "Commands"
    );
    info!(
        settle_delay_ms = config.settle_delay_ms,
        ready_timeout_ms = config.ready_timeout_ms,
        activation_timeout_ms = config.activation_timeout_ms,
        shutdown_grace_period_secs = config.shutdown_grace_period_secs,
        "Timing settings"
    );
    info!(
        child_count = descriptors.len(),
        children = ?descriptors,
        "Configured children"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_pid_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpm.pid");

        let first = PidFile::acquire(&path).unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another instance"));
        // The refused attempt left the holder's pid in place
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );

        drop(first);
        assert!(!path.exists());
        drop(PidFile::acquire(&path).unwrap());
    }

    #[test]
    fn test_pid_file_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = PidFile::acquire(&dir.path().join("missing").join("fpm.pid")).unwrap_err();
        assert!(err.to_string().contains("opening PID file"));
    }
}
