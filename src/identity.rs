//! Identity resolution for child processes
//!
//! A child runs as, in order of preference:
//! 1. the user named in its configuration,
//! 2. the owner of its configuration file (where ownership can be looked up),
//! 3. the identity of the manager itself.
//!
//! Both fallbacks are logged as warnings: they are defaults, not guarantees.

use crate::error::SpawnError;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// OS identity a child is started under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Whatever identity the manager runs as
    Current,
    /// A named user resolved from the user database
    User { name: String, uid: u32, gid: u32 },
}

impl Identity {
    /// Resolve a user name through the user database
    #[cfg(unix)]
    pub fn for_user(name: &str) -> Result<Self, SpawnError> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| SpawnError::UserLookup {
                user: name.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| SpawnError::UnknownUser {
                user: name.to_string(),
            })?;

        Ok(Identity::User {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }

    /// Without a user database the name is recorded but cannot be switched to
    #[cfg(not(unix))]
    pub fn for_user(name: &str) -> Result<Self, SpawnError> {
        Ok(Identity::User {
            name: name.to_string(),
            uid: 0,
            gid: 0,
        })
    }

    pub fn user_name(&self) -> Option<&str> {
        match self {
            Identity::Current => None,
            Identity::User { name, .. } => Some(name),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Current => f.write_str("<current>"),
            Identity::User { name, .. } => f.write_str(name),
        }
    }
}

/// Where a resolved identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// `user` set in the child configuration
    Explicit,
    /// Owner of the child configuration file
    FileOwner,
    /// The manager's own identity
    Supervisor,
}

/// An identity together with how it was chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// User name to switch to, `None` for the manager's own identity
    pub user: Option<String>,
    pub source: IdentitySource,
}

impl ResolvedIdentity {
    /// True when the identity is a default rather than configured
    pub fn is_fallback(&self) -> bool {
        self.source != IdentitySource::Explicit
    }

    /// Look the user up and produce the identity to spawn as
    pub fn into_identity(self) -> Result<Identity, SpawnError> {
        match self.user {
            Some(name) => Identity::for_user(&name),
            None => Ok(Identity::Current),
        }
    }
}

/// Capability to find the user owning a file
pub trait OwnerLookup: Send + Sync {
    /// Whether this platform can answer ownership questions at all
    fn supported(&self) -> bool;

    /// User name owning `path`, `None` if it cannot be determined
    fn owner_of(&self, path: &Path) -> Option<String>;
}

/// Ownership lookup through file metadata and the user database
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOwnerLookup;

impl OwnerLookup for FsOwnerLookup {
    fn supported(&self) -> bool {
        cfg!(unix)
    }

    #[cfg(unix)]
    fn owner_of(&self, path: &Path) -> Option<String> {
        use std::os::unix::fs::MetadataExt;

        let uid = std::fs::metadata(path).ok()?.uid();
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }

    #[cfg(not(unix))]
    fn owner_of(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// Pick the identity for a child.
///
/// `name` is only used for logging.
pub fn resolve_identity(
    name: &str,
    explicit_user: Option<&str>,
    config_path: &Path,
    owners: &dyn OwnerLookup,
) -> ResolvedIdentity {
    if let Some(user) = explicit_user {
        return ResolvedIdentity {
            user: Some(user.to_string()),
            source: IdentitySource::Explicit,
        };
    }

    if owners.supported() {
        if let Some(owner) = owners.owner_of(config_path) {
            warn!(
                child = name,
                config = %config_path.display(),
                owner = %owner,
                "Configuration didn't specify a user, defaulting to the file owner"
            );
            return ResolvedIdentity {
                user: Some(owner),
                source: IdentitySource::FileOwner,
            };
        }
    }

    warn!(
        child = name,
        config = %config_path.display(),
        "Configuration didn't specify a user, defaulting to the current one"
    );
    ResolvedIdentity {
        user: None,
        source: IdentitySource::Supervisor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    /// Collects formatted log output
    struct Capture(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a subscriber that records what it logs
    fn with_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let buf = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let writer = {
            let buf = Arc::clone(&buf);
            move || Capture(Arc::clone(&buf))
        };
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8(buf.lock().clone()).unwrap();
        (result, logs)
    }

    struct FixedOwner(Option<&'static str>);

    impl OwnerLookup for FixedOwner {
        fn supported(&self) -> bool {
            true
        }

        fn owner_of(&self, _path: &Path) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    struct NoOwnership;

    impl OwnerLookup for NoOwnership {
        fn supported(&self) -> bool {
            false
        }

        fn owner_of(&self, _path: &Path) -> Option<String> {
            panic!("ownership must not be queried when unsupported");
        }
    }

    #[test]
    fn test_explicit_user_wins() {
        let resolved = resolve_identity(
            "app",
            Some("www-data"),
            Path::new("/etc/fpm/app.toml"),
            &FixedOwner(Some("alice")),
        );
        assert_eq!(resolved.user.as_deref(), Some("www-data"));
        assert_eq!(resolved.source, IdentitySource::Explicit);
        assert!(!resolved.is_fallback());
    }

    #[test]
    fn test_falls_back_to_file_owner() {
        let resolved = resolve_identity(
            "app",
            None,
            Path::new("/etc/fpm/app.toml"),
            &FixedOwner(Some("alice")),
        );
        assert_eq!(resolved.user.as_deref(), Some("alice"));
        assert_eq!(resolved.source, IdentitySource::FileOwner);
        assert!(resolved.is_fallback());
    }

    #[test]
    fn test_falls_back_to_supervisor_without_ownership() {
        let resolved = resolve_identity("app", None, Path::new("/etc/fpm/app.toml"), &NoOwnership);
        assert_eq!(resolved.user, None);
        assert_eq!(resolved.source, IdentitySource::Supervisor);
        assert_eq!(resolved.into_identity().unwrap(), Identity::Current);
    }

    #[test]
    fn test_unresolvable_owner_falls_back_to_supervisor() {
        let resolved = resolve_identity(
            "app",
            None,
            Path::new("/etc/fpm/app.toml"),
            &FixedOwner(None),
        );
        assert_eq!(resolved.source, IdentitySource::Supervisor);
    }

    #[test]
    fn test_each_fallback_logs_one_warning() {
        let path = Path::new("/etc/fpm/app.toml");

        let (_, logs) = with_logs(|| resolve_identity("app", Some("www-data"), path, &FixedOwner(Some("alice"))));
        assert!(!logs.contains("WARN"));

        let (resolved, logs) = with_logs(|| resolve_identity("app", None, path, &FixedOwner(Some("alice"))));
        assert_eq!(resolved.source, IdentitySource::FileOwner);
        assert_eq!(logs.matches("WARN").count(), 1);
        assert!(logs.contains("defaulting to the file owner"));
        assert!(logs.contains("owner=alice"));

        let (resolved, logs) = with_logs(|| resolve_identity("app", None, path, &NoOwnership));
        assert_eq!(resolved.source, IdentitySource::Supervisor);
        assert_eq!(logs.matches("WARN").count(), 1);
        assert!(logs.contains("defaulting to the current one"));

        let (_, logs) = with_logs(|| resolve_identity("app", None, path, &FixedOwner(None)));
        assert_eq!(logs.matches("WARN").count(), 1);
        assert!(logs.contains("defaulting to the current one"));
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_owner_of_own_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = nix::unistd::User::from_uid(nix::unistd::Uid::effective())
            .unwrap()
            .map(|u| u.name);

        let lookup = FsOwnerLookup;
        assert!(lookup.supported());
        assert_eq!(lookup.owner_of(file.path()), expected);
        assert_eq!(lookup.owner_of(Path::new("/nonexistent/file.toml")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_user_is_error() {
        let err = Identity::for_user("no-such-user-fpm-test").unwrap_err();
        assert!(matches!(err, SpawnError::UnknownUser { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_resolves() {
        let identity = Identity::for_user("root").unwrap();
        assert_eq!(
            identity,
            Identity::User {
                name: "root".to_string(),
                uid: 0,
                gid: 0
            }
        );
        assert_eq!(identity.to_string(), "root");
        assert_eq!(Identity::Current.user_name(), None);
    }
}
