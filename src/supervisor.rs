use crate::config::{ChildConfig, Config, InstanceType, SocketSpec};
use crate::error::{ConfigError, SpawnError};
use crate::identity::{resolve_identity, FsOwnerLookup, Identity, OwnerLookup};
use crate::listener::{
    connect, ConnectionHandoff, ConnectionListener, ListenerHandle, ListenerState, RelayHandoff,
    WorkerActivator,
};
use crate::privilege::SpawnRequest;
use crate::spawn::{ActiveWorker, OsSpawner, ProcessHandle, SpawnBackend, SpawnStrategy, Spawned};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// How long to wait for the OS to reap a process after SIGKILL
const KILL_REAP_TIMEOUT_MS: u64 = 2000;

/// Interval between readiness checks of a starting static child
const READY_POLL_INTERVAL_MS: u64 = 50;

/// One configured child
struct ChildRecord {
    /// Canonical path of the configuration file; identifies the child
    key: PathBuf,
    name: String,
    instance_type: InstanceType,
    config_path: PathBuf,
    /// Request that produces the child's worker: the FastCGI server itself for
    /// static children, a shim activation for on-demand ones
    spawn: SpawnRequest,
    /// Most recently spawned worker, if any
    process: Option<ProcessHandle>,
    /// Accept loop of an on-demand child
    listener: Option<ListenerHandle>,
    /// Serializes activations of this child only
    activation: Arc<Mutex<()>>,
}

impl ChildRecord {
    fn listening(&self) -> bool {
        self.listener.as_ref().is_some_and(ListenerHandle::is_active)
    }
}

/// The process in `slot`, if it is still running
async fn live(slot: &mut Option<ProcessHandle>) -> Option<&mut ProcessHandle> {
    let process = slot.as_mut()?;
    if process.has_exited().await {
        None
    } else {
        Some(process)
    }
}

/// Ordered collection of child records
#[derive(Default)]
struct Registry {
    records: Vec<ChildRecord>,
}

impl Registry {
    fn contains_key(&self, key: &Path) -> bool {
        self.records.iter().any(|r| r.key == key)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut ChildRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    fn on_demand_mut(&mut self, name: &str) -> Result<&mut ChildRecord, SpawnError> {
        let record = self.get_mut(name).ok_or_else(|| SpawnError::UnknownChild {
            name: name.to_string(),
        })?;
        if record.instance_type != InstanceType::OnDemand {
            return Err(SpawnError::NotOnDemand {
                name: name.to_string(),
            });
        }
        Ok(record)
    }

    /// Forget exited processes, then drop records left with neither a process
    /// nor an active listener
    async fn prune(&mut self) {
        for record in self.records.iter_mut() {
            if let Some(process) = record.process.as_mut() {
                if process.has_exited().await {
                    debug!(child = %record.name, "Worker exited");
                    record.process = None;
                }
            }
        }

        self.records.retain(|record| {
            let keep = record.process.is_some() || record.listening();
            if !keep {
                debug!(child = %record.name, "Removing child from registry");
            }
            keep
        });
    }
}

/// Point-in-time view of a registered child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildStatus {
    pub name: String,
    pub instance_type: InstanceType,
    pub config_path: PathBuf,
    /// User the child's processes run as, `None` for the manager's identity
    pub user: Option<String>,
    /// Pid of the current worker
    pub pid: Option<u32>,
    /// State of the on-demand listener
    pub listener: Option<ListenerState>,
    /// Socket of the on-demand listener
    pub socket: Option<SocketSpec>,
}

/// Builder for [`Supervisor`] with replaceable collaborators
pub struct SupervisorBuilder {
    config: Config,
    backend: Option<Arc<dyn SpawnBackend>>,
    owners: Option<Arc<dyn OwnerLookup>>,
    handoff: Option<Arc<dyn ConnectionHandoff>>,
}

impl SupervisorBuilder {
    /// Execute spawn requests through `backend` instead of creating OS
    /// processes directly
    pub fn with_backend(mut self, backend: Arc<dyn SpawnBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Resolve configuration file owners through `owners`
    pub fn with_owner_lookup(mut self, owners: Arc<dyn OwnerLookup>) -> Self {
        self.owners = Some(owners);
        self
    }

    /// Pass accepted connections to `handoff` instead of relaying them
    pub fn with_handoff(mut self, handoff: Arc<dyn ConnectionHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn build(self) -> Arc<Supervisor> {
        let handoff = self
            .handoff
            .unwrap_or_else(|| Arc::new(RelayHandoff::new(self.config.activation_timeout())));
        let (stop_tx, _) = watch::channel(false);

        Arc::new_cyclic(|weak| Supervisor {
            backend: self.backend.unwrap_or_else(|| Arc::new(OsSpawner)),
            owners: self.owners.unwrap_or_else(|| Arc::new(FsOwnerLookup)),
            handoff,
            registry: Mutex::new(Registry::default()),
            stop_tx,
            weak_self: weak.clone(),
            config: self.config,
        })
    }
}

/// Owns every child of the process manager.
///
/// # Usage
///
/// `Supervisor` is always used behind an `Arc`: listeners started for
/// on-demand children call back into it when a connection arrives. The
/// [`new`](Supervisor::new) constructor returns `Arc<Self>` directly.
///
/// ```ignore
/// let supervisor = Supervisor::new(config);
/// supervisor.start_all(&descriptors).await?;
/// // ...
/// supervisor.shutdown().await;
/// ```
///
/// # Locking
///
/// The registry sits behind one async mutex. Registration, kill and
/// terminate sweeps and pruning hold it for their whole run. An activation
/// only takes it to look up and to store the new worker: the shim round-trip
/// runs under a per-child lock, so a slow shim delays its own child and
/// nothing else.
pub struct Supervisor {
    config: Config,
    backend: Arc<dyn SpawnBackend>,
    owners: Arc<dyn OwnerLookup>,
    handoff: Arc<dyn ConnectionHandoff>,
    registry: Mutex<Registry>,
    /// Global stop flag observed by every accept loop
    stop_tx: watch::Sender<bool>,
    weak_self: Weak<Supervisor>,
}

impl Supervisor {
    /// Create a supervisor spawning real processes
    pub fn new(config: Config) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            backend: None,
            owners: None,
            handoff: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every child described by `descriptors`, in order.
    ///
    /// A child that cannot be configured or started is logged and skipped;
    /// the rest of the batch still starts. A configuration file that is
    /// already registered is not started again, so the call can be retried.
    /// Two files with the same file name are both started; the second is
    /// named by its full path. Only an unusable global configuration is
    /// returned as an error.
    pub async fn start_all(&self, descriptors: &[PathBuf]) -> Result<(), ConfigError> {
        self.config.validate()?;
        // Re-arm after a previous shutdown
        self.stop_tx.send_replace(false);

        for path in descriptors {
            if path.as_os_str().is_empty() {
                warn!("Skipping empty configuration entry");
                continue;
            }

            let mut name = child_name(path);
            let child = match ChildConfig::load(path, &name) {
                Ok(child) => child,
                Err(ConfigError::Read { path, source }) => {
                    warn!(child = %name, config = %path.display(), error = %source, "Skipping unreadable configuration");
                    continue;
                }
                Err(e) => {
                    error!(child = %name, error = %e, "Couldn't start child");
                    continue;
                }
            };

            let key = registry_key(path);
            {
                let registry = self.registry.lock().await;
                if registry.contains_key(&key) {
                    debug!(child = %name, config = %path.display(), "Child already registered, not starting it again");
                    continue;
                }
                if registry.name_taken(&name) {
                    let qualified = path.display().to_string();
                    warn!(child = %name, renamed = %qualified, "Another configuration uses the same name, naming this child by its path");
                    name = qualified;
                }
            }

            let resolved = resolve_identity(&name, child.explicit_user(), path, self.owners.as_ref());
            let identity = match resolved.into_identity() {
                Ok(identity) => identity,
                Err(e) => {
                    error!(child = %name, error = %e, code = e.code(), "Couldn't start child");
                    continue;
                }
            };

            let entry = Entry { key, name, path };
            match child.instance_type {
                InstanceType::Static => self.start_static(entry, &child, identity).await,
                InstanceType::OnDemand => self.start_on_demand(entry, &child, identity).await,
            }
        }

        info!(children = self.len().await, "Startup complete");
        Ok(())
    }

    async fn start_static(&self, entry: Entry<'_>, child: &ChildConfig, identity: Identity) {
        let Entry { key, name, path } = entry;
        let request = SpawnRequest::new(SpawnStrategy::Static {
            command: child.fastcgi_command(&self.config).to_string(),
            config_path: path.to_path_buf(),
        })
        .run_as(identity);

        let mut handle = match self.backend.spawn(&request).await {
            Ok(Spawned::Process(handle)) => handle,
            Ok(Spawned::Detached { .. }) => {
                error!(child = %name, "Couldn't start child: no process to track");
                return;
            }
            Err(e) => {
                error!(child = %name, error = %e, code = e.code(), "Couldn't start child");
                return;
            }
        };

        let pid = handle.pid();
        info!(child = %name, pid, user = %request.identity, "Started FastCGI daemon [static]");

        {
            let mut registry = self.registry.lock().await;
            if registry.contains_key(&key) {
                // Lost a race against a concurrent start of the same child
                handle.kill().await;
                return;
            }
            registry.records.push(ChildRecord {
                key: key.clone(),
                name: name.clone(),
                instance_type: InstanceType::Static,
                config_path: path.to_path_buf(),
                spawn: request,
                process: Some(handle),
                listener: None,
                activation: Arc::default(),
            });
        }

        self.wait_ready(&key, &name, child.socket.as_ref()).await;
        self.discard_if_exited(&key, &name).await;
    }

    /// Wait for a freshly started static child to accept connections, or a
    /// fixed delay when its socket is unknown. Gives up early if the child
    /// exits.
    async fn wait_ready(&self, key: &Path, name: &str, socket: Option<&SocketSpec>) {
        let Some(socket) = socket else {
            tokio::time::sleep(self.config.settle_delay()).await;
            return;
        };

        let timeout = self.config.ready_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if connect(socket).await.is_ok() {
                debug!(child = name, socket = %socket, "Child is accepting connections");
                return;
            }
            if self.child_exited(key).await {
                return;
            }
            if Instant::now() >= deadline {
                warn!(child = name, socket = %socket, timeout_ms = timeout.as_millis() as u64, "Child did not become ready in time");
                return;
            }
            tokio::time::sleep(Duration::from_millis(READY_POLL_INTERVAL_MS)).await;
        }
    }

    /// Whether the child registered under `key` has no running process
    async fn child_exited(&self, key: &Path) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.records.iter_mut().find(|r| r.key == key) {
            Some(record) => live(&mut record.process).await.is_none(),
            None => true,
        }
    }

    /// Drop a static child that died while starting up
    async fn discard_if_exited(&self, key: &Path, name: &str) {
        let mut registry = self.registry.lock().await;
        let Some(index) = registry.records.iter().position(|r| r.key == key) else {
            return;
        };
        if live(&mut registry.records[index].process).await.is_none() {
            error!(child = name, "Couldn't start child: exited during startup");
            registry.records.remove(index);
        }
    }

    async fn start_on_demand(&self, entry: Entry<'_>, child: &ChildConfig, identity: Identity) {
        let Entry { key, name, path } = entry;
        let (Some(socket), Some(shim_socket)) = (child.socket.clone(), child.shim_socket.clone()) else {
            // Rejected by ChildConfig::validate
            error!(child = %name, "Couldn't start child: on-demand sockets missing");
            return;
        };

        // Bind before starting the shim so a taken address leaves nothing behind
        let listener = match ConnectionListener::bind(socket.clone(), child.backlog) {
            Ok(listener) => listener,
            Err(e) => {
                error!(child = %name, socket = %socket, error = %e, "Couldn't start child");
                return;
            }
        };

        let shim = SpawnRequest::new(SpawnStrategy::Shim {
            shim_command: self.config.shim_command.clone(),
            shim_socket: shim_socket.clone(),
            config_path: path.to_path_buf(),
            command: child.fastcgi_command(&self.config).to_string(),
        })
        .run_as(identity.clone());

        match self.backend.spawn(&shim).await {
            Ok(spawned) => {
                info!(child = %name, pid = spawned.pid(), user = %identity, "Started FastCGI shim [ondemand]");
            }
            Err(e) => {
                error!(child = %name, error = %e, code = e.code(), "Couldn't start child");
                listener.close();
                return;
            }
        }

        let activator: Arc<dyn WorkerActivator> = Arc::new(Activator(self.weak_self.clone()));

        // Held while the accept loop starts so the first connection finds
        // the record
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&key) {
            listener.close();
            return;
        }

        let handle = match listener.start(
            name.clone(),
            activator,
            Arc::clone(&self.handoff),
            self.stop_tx.subscribe(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                error!(child = %name, socket = %socket, error = %e, "Couldn't start child");
                return;
            }
        };

        info!(child = %name, socket = %socket, "Waiting for connections [ondemand]");
        registry.records.push(ChildRecord {
            key,
            name,
            instance_type: InstanceType::OnDemand,
            config_path: path.to_path_buf(),
            spawn: SpawnRequest::new(SpawnStrategy::OnDemand {
                shim_socket,
                timeout: self.config.activation_timeout(),
            })
            .run_as(identity),
            process: None,
            listener: Some(handle),
            activation: Arc::default(),
        });
    }

    /// Produce a live worker for the on-demand child `name`, reusing the
    /// current one while it runs
    pub async fn activate(&self, name: &str) -> Result<ActiveWorker, SpawnError> {
        let gate = {
            let mut registry = self.registry.lock().await;
            let record = registry.on_demand_mut(name)?;
            if let Some(process) = live(&mut record.process).await {
                return Ok(process.worker());
            }
            Arc::clone(&record.activation)
        };

        let _turn = gate.lock().await;

        // Whoever held the turn before us may have started a worker already
        let request = {
            let mut registry = self.registry.lock().await;
            let record = registry.on_demand_mut(name)?;
            if let Some(process) = live(&mut record.process).await {
                return Ok(process.worker());
            }
            record.spawn.clone()
        };

        let mut handle = match self.backend.spawn(&request).await? {
            Spawned::Process(handle) => handle,
            Spawned::Detached { pid } => {
                return Ok(ActiveWorker { pid, socket: None });
            }
        };

        let worker = handle.worker();
        let mut registry = self.registry.lock().await;
        match registry.get_mut(name) {
            Some(record) if record.listening() => {
                info!(child = name, pid = worker.pid, "Started FastCGI worker [ondemand]");
                record.process = Some(handle);
                Ok(worker)
            }
            _ => {
                warn!(child = name, pid = worker.pid, "Child stopped while its worker was starting, killing the worker");
                handle.kill().await;
                Err(SpawnError::UnknownChild {
                    name: name.to_string(),
                })
            }
        }
    }

    /// SIGKILL every live process, reap them and prune the registry.
    ///
    /// Listeners are left running.
    pub async fn kill_force(&self) {
        let mut registry = self.registry.lock().await;

        for record in registry.records.iter_mut() {
            if let Some(process) = live(&mut record.process).await {
                info!(child = %record.name, pid = process.pid(), "Killing child");
                process.kill().await;
            }
        }

        reap_all(&mut registry, Duration::from_millis(KILL_REAP_TIMEOUT_MS)).await;
        registry.prune().await;
    }

    /// SIGTERM every live process and give them the grace period to exit;
    /// whatever is left is killed. Prunes the registry.
    pub async fn terminate_gracefully(&self) {
        let mut registry = self.registry.lock().await;

        let mut signalled = 0usize;
        for record in registry.records.iter_mut() {
            if let Some(process) = live(&mut record.process).await {
                info!(child = %record.name, pid = process.pid(), "Sending SIGTERM to child");
                process.terminate().await;
                signalled += 1;
            }
        }

        if signalled > 0 {
            let grace = self.config.shutdown_grace_period();
            let deadline = Instant::now() + grace;
            for record in registry.records.iter_mut() {
                let Some(process) = record.process.as_mut() else {
                    continue;
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !process.wait_exit(remaining).await {
                    warn!(
                        child = %record.name,
                        pid = process.pid(),
                        grace_secs = grace.as_secs(),
                        "Child did not exit in time, killing"
                    );
                    process.kill().await;
                }
            }
            reap_all(&mut registry, Duration::from_millis(KILL_REAP_TIMEOUT_MS)).await;
        }

        registry.prune().await;
    }

    /// Close every listening socket. Workers keep running.
    pub async fn stop_listeners(&self) {
        let mut registry = self.registry.lock().await;
        for record in registry.records.iter_mut() {
            if let Some(listener) = record.listener.as_mut() {
                listener.stop().await;
                debug!(child = %record.name, socket = %listener.spec(), "Listener stopped");
            }
        }
        registry.prune().await;
    }

    /// Stop accepting connections, then terminate every child gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down children");
        self.stop_tx.send_replace(true);
        self.stop_listeners().await;
        self.terminate_gracefully().await;
    }

    /// Snapshot of the registry, in registration order
    pub async fn status(&self) -> Vec<ChildStatus> {
        let registry = self.registry.lock().await;
        registry
            .records
            .iter()
            .map(|record| ChildStatus {
                name: record.name.clone(),
                instance_type: record.instance_type,
                config_path: record.config_path.clone(),
                user: record.spawn.identity.user_name().map(str::to_string),
                pid: record.process.as_ref().and_then(ProcessHandle::pid),
                listener: record.listener.as_ref().map(ListenerHandle::state),
                socket: record.listener.as_ref().map(|l| l.spec().clone()),
            })
            .collect()
    }

    /// Number of registered children
    pub async fn len(&self) -> usize {
        self.registry.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// A descriptor accepted for startup
struct Entry<'a> {
    key: PathBuf,
    name: String,
    path: &'a Path,
}

/// Wait, up to `timeout` overall, for every killed process to be reaped
async fn reap_all(registry: &mut Registry, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for record in registry.records.iter_mut() {
        let Some(process) = record.process.as_mut() else {
            continue;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !process.wait_exit(remaining).await {
            warn!(child = %record.name, pid = process.pid(), "Process still running after SIGKILL");
        }
    }
}

/// Routes listener activations back to the supervisor without keeping it
/// alive
struct Activator(Weak<Supervisor>);

#[async_trait]
impl WorkerActivator for Activator {
    async fn activate(&self, child: &str) -> Result<ActiveWorker, SpawnError> {
        match self.0.upgrade() {
            Some(supervisor) => supervisor.activate(child).await,
            None => Err(SpawnError::UnknownChild {
                name: child.to_string(),
            }),
        }
    }
}

/// Child name derived from its configuration file
fn child_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Identity of a configuration file, stable across spellings of its path
fn registry_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::build_command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs `sleep` for every request and counts them. A static child with
    /// its own `command` runs that command instead; activations of a child
    /// whose shim socket starts with "slow" take half a second.
    #[derive(Default)]
    struct SleepBackend {
        statics: AtomicUsize,
        shims: AtomicUsize,
        activations: AtomicUsize,
    }

    fn run(command_line: &str) -> Result<Spawned, SpawnError> {
        let (program, mut cmd) = build_command(command_line, Vec::<String>::new())?;
        let child = cmd
            .spawn()
            .map_err(|source| SpawnError::Os { program, source })?;
        Ok(Spawned::Process(ProcessHandle::Local(child)))
    }

    #[async_trait]
    impl SpawnBackend for SleepBackend {
        async fn spawn(&self, request: &SpawnRequest) -> Result<Spawned, SpawnError> {
            match &request.strategy {
                SpawnStrategy::Static { command, .. } => {
                    self.statics.fetch_add(1, Ordering::SeqCst);
                    if command == "fastcgi-server" {
                        run("sleep 30")
                    } else {
                        run(command)
                    }
                }
                SpawnStrategy::Shim { .. } => {
                    self.shims.fetch_add(1, Ordering::SeqCst);
                    Ok(Spawned::Detached { pid: None })
                }
                SpawnStrategy::OnDemand { shim_socket, .. } => {
                    self.activations.fetch_add(1, Ordering::SeqCst);
                    let slow = shim_socket
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with("slow"));
                    if slow {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    run("sleep 30")
                }
            }
        }
    }

    struct NoOwners;

    impl OwnerLookup for NoOwners {
        fn supported(&self) -> bool {
            false
        }

        fn owner_of(&self, _path: &Path) -> Option<String> {
            None
        }
    }

    fn test_config() -> Config {
        Config {
            settle_delay_ms: 0,
            ready_timeout_ms: 200,
            activation_timeout_ms: 500,
            shutdown_grace_period_secs: 2,
            ..Config::new("fastcgi-server")
        }
    }

    fn supervisor(backend: Arc<SleepBackend>) -> Arc<Supervisor> {
        Supervisor::builder(test_config())
            .with_backend(backend)
            .with_owner_lookup(Arc::new(NoOwners))
            .build()
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn on_demand(dir: &Path, name: &str) -> PathBuf {
        write(
            dir,
            &format!("{}.toml", name),
            &format!(
                "instance_type = \"ondemand\"\nsocket = \"unix:{}\"\nshim_socket = \"{}\"\n",
                dir.join(format!("{}.sock", name)).display(),
                dir.join(format!("{}-shim.sock", name)).display()
            ),
        )
    }

    #[test]
    fn test_child_name_from_path() {
        assert_eq!(child_name(Path::new("/etc/fpm/blog.toml")), "blog");
        assert_eq!(child_name(Path::new("wiki")), "wiki");
    }

    #[tokio::test]
    async fn test_invalid_global_config_is_returned() {
        let backend = Arc::new(SleepBackend::default());
        let supervisor = Supervisor::builder(Config::default())
            .with_backend(backend.clone())
            .build();

        let err = supervisor.start_all(&[]).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGlobal(_)));
        assert_eq!(backend.statics.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_and_missing_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());

        supervisor
            .start_all(&[PathBuf::new(), dir.path().join("missing.toml"), a])
            .await
            .unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "a");
        assert_eq!(status[0].instance_type, InstanceType::Static);
        assert!(status[0].pid.is_some());
        assert_eq!(status[0].user, None);

        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_retry_does_not_spawn_twice() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "instance_type = \"static\"\n");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());

        supervisor.start_all(&[a.clone()]).await.unwrap();
        supervisor.start_all(&[a]).await.unwrap();

        assert_eq!(backend.statics.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.len().await, 1);
        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_kill_force_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "");
        let b = write(dir.path(), "b.toml", "");
        let supervisor = supervisor(Arc::new(SleepBackend::default()));

        supervisor.start_all(&[a, b]).await.unwrap();
        assert_eq!(supervisor.len().await, 2);

        supervisor.kill_force().await;
        assert!(supervisor.is_empty().await);

        supervisor.kill_force().await;
        assert!(supervisor.is_empty().await);
    }

    #[tokio::test]
    async fn test_terminate_then_kill_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "");
        let supervisor = supervisor(Arc::new(SleepBackend::default()));
        supervisor.start_all(&[a]).await.unwrap();

        let terminate = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.terminate_gracefully().await })
        };
        supervisor.kill_force().await;
        terminate.await.unwrap();
        supervisor.terminate_gracefully().await;

        assert!(supervisor.is_empty().await);
    }

    #[tokio::test]
    async fn test_activate_reuses_live_worker() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("b.sock");
        let b = on_demand(dir.path(), "b");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());
        supervisor.start_all(&[b]).await.unwrap();
        assert_eq!(backend.shims.load(Ordering::SeqCst), 1);
        assert_eq!(backend.activations.load(Ordering::SeqCst), 0);

        let first = supervisor.activate("b").await.unwrap();
        let second = supervisor.activate("b").await.unwrap();
        assert_eq!(first.pid, second.pid);
        assert_eq!(backend.activations.load(Ordering::SeqCst), 1);

        // Killing the worker keeps the listener; the next activation respawns
        supervisor.kill_force().await;
        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].pid, None);
        assert_eq!(status[0].listener, Some(ListenerState::Listening));

        let third = supervisor.activate("b").await.unwrap();
        assert_ne!(third.pid, first.pid);
        assert_eq!(backend.activations.load(Ordering::SeqCst), 2);

        supervisor.shutdown().await;
        assert!(supervisor.is_empty().await);
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_activate_rejects_static_and_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "");
        let supervisor = supervisor(Arc::new(SleepBackend::default()));
        supervisor.start_all(&[a]).await.unwrap();

        let err = supervisor.activate("a").await.unwrap_err();
        assert!(matches!(err, SpawnError::NotOnDemand { .. }));
        let err = supervisor.activate("nope").await.unwrap_err();
        assert!(matches!(err, SpawnError::UnknownChild { .. }));

        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_unknown_user_skips_child() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "user = \"no-such-user-fpm-test\"\n");
        let b = write(dir.path(), "b.toml", "");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());

        supervisor.start_all(&[a, b]).await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "b");
        assert_eq!(backend.statics.load(Ordering::SeqCst), 1);
        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_same_file_name_in_two_directories() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let a = write(first.path(), "app.toml", "");
        let b = write(second.path(), "app.toml", "");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());

        supervisor.start_all(&[a.clone(), b.clone()]).await.unwrap();
        // Same files again, one spelled differently
        let respelled = first.path().join(".").join("app.toml");
        supervisor.start_all(&[respelled, b.clone()]).await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "app");
        assert_eq!(status[1].name, b.display().to_string());
        assert_eq!(status[1].config_path, b);
        assert_eq!(backend.statics.load(Ordering::SeqCst), 2);
        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_static_child_exiting_during_startup_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let crash = write(dir.path(), "crash.toml", "command = \"sh -c 'exit 1'\"\n");
        let steady = write(dir.path(), "steady.toml", "");
        let supervisor = Supervisor::builder(Config {
            settle_delay_ms: 300,
            ..test_config()
        })
        .with_backend(Arc::new(SleepBackend::default()))
        .with_owner_lookup(Arc::new(NoOwners))
        .build();

        supervisor.start_all(&[crash, steady]).await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "steady");
        supervisor.kill_force().await;
    }

    #[tokio::test]
    async fn test_readiness_wait_ends_when_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let crash = write(
            dir.path(),
            "crash.toml",
            &format!(
                "command = \"sh -c 'exit 1'\"\nsocket = \"unix:{}\"\n",
                dir.path().join("crash.sock").display()
            ),
        );
        let supervisor = Supervisor::builder(Config {
            ready_timeout_ms: 30_000,
            ..test_config()
        })
        .with_backend(Arc::new(SleepBackend::default()))
        .with_owner_lookup(Arc::new(NoOwners))
        .build();

        let started = Instant::now();
        supervisor.start_all(&[crash]).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(supervisor.is_empty().await);
    }

    #[tokio::test]
    async fn test_slow_activation_does_not_hold_up_other_children() {
        let dir = tempfile::tempdir().unwrap();
        let slow = on_demand(dir.path(), "slow");
        let fast = on_demand(dir.path(), "fast");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());
        supervisor.start_all(&[slow, fast]).await.unwrap();

        let pending = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.activate("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        supervisor.activate("fast").await.unwrap();
        assert_eq!(supervisor.len().await, 2);
        assert!(started.elapsed() < Duration::from_millis(400));

        pending.await.unwrap().unwrap();
        supervisor.shutdown().await;
        assert!(supervisor.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_activations_share_one_worker() {
        let dir = tempfile::tempdir().unwrap();
        let slow = on_demand(dir.path(), "slow");
        let backend = Arc::new(SleepBackend::default());
        let supervisor = supervisor(backend.clone());
        supervisor.start_all(&[slow]).await.unwrap();

        let first = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.activate("slow").await })
        };
        let second = supervisor.activate("slow").await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.pid, second.pid);
        assert_eq!(backend.activations.load(Ordering::SeqCst), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_started_after_listener_stop_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let slow = on_demand(dir.path(), "slow");
        let supervisor = supervisor(Arc::new(SleepBackend::default()));
        supervisor.start_all(&[slow]).await.unwrap();

        let pending = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.activate("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop_listeners().await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, SpawnError::UnknownChild { .. }));
        assert!(supervisor.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_stoppable() {
        let dir = tempfile::tempdir().unwrap();
        let b = on_demand(dir.path(), "b");
        let socket = dir.path().join("b.sock");
        let supervisor = supervisor(Arc::new(SleepBackend::default()));

        supervisor.start_all(&[b.clone()]).await.unwrap();
        supervisor.shutdown().await;
        assert!(supervisor.is_empty().await);
        assert!(*supervisor.stop_tx.borrow());

        supervisor.start_all(&[b]).await.unwrap();
        assert!(!*supervisor.stop_tx.borrow());
        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].listener, Some(ListenerState::Listening));
        assert!(socket.exists());

        supervisor.shutdown().await;
        assert!(supervisor.is_empty().await);
        assert!(!socket.exists());
    }
}
