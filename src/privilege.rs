//! Running spawn requests under another identity
//!
//! The identity switch is applied in the forked child, before `exec`. If
//! `setgid`/`setuid` fail there, `spawn` fails and the program never runs, so
//! a partial drop cannot leave a worker running as the manager's identity.

use crate::error::SpawnError;
use crate::identity::Identity;
use crate::spawn::SpawnStrategy;
use tokio::process::{Child, Command};
use tracing::debug;

/// A spawn strategy paired with the identity it must run as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub identity: Identity,
    pub strategy: SpawnStrategy,
}

impl SpawnRequest {
    /// Request running as the manager's own identity
    pub fn new(strategy: SpawnStrategy) -> Self {
        Self {
            identity: Identity::Current,
            strategy,
        }
    }

    /// Run the request as `identity` instead (builder pattern)
    pub fn run_as(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }
}

/// Spawn `cmd` as `identity`.
///
/// No switch is attempted when the identity already matches the effective
/// uid of the manager.
pub(crate) fn spawn_as(
    mut cmd: Command,
    program: &str,
    identity: &Identity,
) -> Result<Child, SpawnError> {
    let switching = apply_identity(&mut cmd, identity);

    cmd.spawn().map_err(|source| match identity {
        Identity::User { name, .. } if switching && is_switch_failure(&source) => {
            SpawnError::IdentitySwitch {
                user: name.clone(),
                program: program.to_string(),
                source,
            }
        }
        _ => SpawnError::Os {
            program: program.to_string(),
            source,
        },
    })
}

#[cfg(unix)]
fn apply_identity(cmd: &mut Command, identity: &Identity) -> bool {
    let Identity::User { name, uid, gid } = identity else {
        return false;
    };

    if nix::unistd::Uid::effective().as_raw() == *uid {
        debug!(user = %name, "Already running as target user");
        return false;
    }

    // gid first: once uid is dropped, setgid is no longer permitted
    cmd.gid(*gid);
    cmd.uid(*uid);
    true
}

#[cfg(not(unix))]
fn apply_identity(_cmd: &mut Command, identity: &Identity) -> bool {
    if let Some(name) = identity.user_name() {
        debug!(user = %name, "Identity switching unsupported, running as current user");
    }
    false
}

#[cfg(unix)]
fn is_switch_failure(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_switch_failure(_err: &std::io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn static_strategy() -> SpawnStrategy {
        SpawnStrategy::Static {
            command: "true".to_string(),
            config_path: PathBuf::from("/etc/fpm/app.toml"),
        }
    }

    #[test]
    fn test_request_defaults_to_current_identity() {
        let request = SpawnRequest::new(static_strategy());
        assert_eq!(request.identity, Identity::Current);

        let request = request.run_as(Identity::User {
            name: "www-data".to_string(),
            uid: 33,
            gid: 33,
        });
        assert_eq!(request.identity.user_name(), Some("www-data"));
    }

    #[cfg(unix)]
    #[test]
    fn test_same_identity_is_not_switched() {
        let uid = nix::unistd::Uid::effective().as_raw();
        let gid = nix::unistd::Gid::effective().as_raw();
        let identity = Identity::User {
            name: "me".to_string(),
            uid,
            gid,
        };
        let mut cmd = Command::new("true");
        assert!(!apply_identity(&mut cmd, &identity));
        assert!(!apply_identity(&mut cmd, &Identity::Current));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_as_current_runs() {
        let mut child = spawn_as(Command::new("true"), "true", &Identity::Current).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_switch_failure_is_observable() {
        // Only meaningful when not root: switching to another uid must fail
        // before anything is executed.
        if nix::unistd::Uid::effective().is_root() {
            return;
        }
        let identity = Identity::User {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
        };
        let err = spawn_as(Command::new("true"), "true", &identity).unwrap_err();
        assert!(matches!(err, SpawnError::IdentitySwitch { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_os_error() {
        let err = spawn_as(
            Command::new("/nonexistent/fastcgi-server"),
            "/nonexistent/fastcgi-server",
            &Identity::Current,
        )
        .unwrap_err();
        assert!(matches!(err, SpawnError::Os { .. }));
    }
}
