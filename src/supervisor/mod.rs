//! Lifecycle coordinator for one supervised server.
//!
//! All mutable state (lifecycle state, port, pid, handle, in-flight
//! operations) sits behind one lock that is never held across an await.
//! Start and stop attempts run in their own tasks, so a caller dropping its
//! future does not abandon a half-finished start or stop.

mod listeners;

pub use self::listeners::{ListenerToken, PidCallback, PidListeners, Subscription};

use crate::configs::ManagedProcessConfig;
use crate::environment::{current_environment, derive_child_environment};
use crate::error::{StartFailure, SupervisorError};
use crate::port::find_free_port;
use crate::probe::{wait_until_ready, HttpProbe, ReadinessProbe};
use crate::process::{
    KillResult, Launcher, ProcessHandle, SpawnRequest, TokioLauncher, WaitOutcome,
};
use crate::provision::BinaryProvisioner;
use futures::future::{BoxFuture, FutureExt, Shared};
use new_string_template::template::Template;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::select;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

type PendingStart = Shared<BoxFuture<'static, Result<u16, SupervisorError>>>;
type PendingStop = Shared<BoxFuture<'static, KillResult>>;

struct Slot {
    state: LifecycleState,
    port: Option<u16>,
    pid: Option<u32>,
    handle: Option<Arc<dyn ProcessHandle>>,
    pending_start: Option<PendingStart>,
    pending_stop: Option<PendingStop>,
    /// Bumped on every start attempt; stale exit watchers compare against it.
    generation: u64,
}

impl Slot {
    fn clear_process(&mut self) {
        self.port = None;
        self.pid = None;
        self.handle = None;
    }
}

struct Inner {
    name: String,
    config: ManagedProcessConfig,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    provisioner: Option<Arc<dyn BinaryProvisioner>>,
    parent_env: HashMap<String, String>,
    slot: Mutex<Slot>,
    listeners: Arc<PidListeners>,
}

/// Supervises one server process: start with readiness, stop with the
/// two-phase kill, pid-change notifications.
///
/// Cloning gives another handle to the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

pub struct SupervisorBuilder {
    name: String,
    config: ManagedProcessConfig,
    launcher: Option<Arc<dyn Launcher>>,
    probe: Option<Arc<dyn ReadinessProbe>>,
    provisioner: Option<Arc<dyn BinaryProvisioner>>,
    parent_env: Option<HashMap<String, String>>,
}

impl SupervisorBuilder {
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn BinaryProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Environment the child's environment is derived from. Defaults to a
    /// snapshot of this process' environment taken at `build`.
    pub fn parent_environment(mut self, env: HashMap<String, String>) -> Self {
        self.parent_env = Some(env);
        self
    }

    pub fn build(self) -> Supervisor {
        let readiness = &self.config.readiness;
        let probe: Arc<dyn ReadinessProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::new(
                readiness.path.clone(),
                readiness.request_timeout,
            )),
        };
        let launcher: Arc<dyn Launcher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(TokioLauncher::new()),
        };
        Supervisor {
            inner: Arc::new(Inner {
                name: self.name,
                launcher,
                probe,
                provisioner: self.provisioner,
                parent_env: self.parent_env.unwrap_or_else(current_environment),
                config: self.config,
                slot: Mutex::new(Slot {
                    state: LifecycleState::Stopped,
                    port: None,
                    pid: None,
                    handle: None,
                    pending_start: None,
                    pending_stop: None,
                    generation: 0,
                }),
                listeners: Arc::new(PidListeners::default()),
            }),
        }
    }
}

enum Next {
    Ready(u16),
    AwaitStop(PendingStop),
    AwaitStart(PendingStart),
}

impl Supervisor {
    pub fn builder(name: impl Into<String>, config: ManagedProcessConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            name: name.into(),
            config,
            launcher: None,
            probe: None,
            provisioner: None,
            parent_env: None,
        }
    }

    pub fn new(name: impl Into<String>, config: ManagedProcessConfig) -> Self {
        Self::builder(name, config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ManagedProcessConfig {
        &self.inner.config
    }

    /// Make sure the server is up and return its port.
    ///
    /// Concurrent callers share one start attempt and all get its result. A
    /// call made while a stop is in progress waits for the stop first.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub async fn ensure_running(&self) -> Result<u16, SupervisorError> {
        loop {
            let next = {
                let mut slot = self.inner.slot.lock();
                let stopping = slot.pending_stop.clone();
                let starting = slot.pending_start.clone();
                match (slot.state, slot.port, stopping, starting) {
                    (LifecycleState::Running, Some(port), _, _) => Next::Ready(port),
                    (LifecycleState::Stopping, _, Some(stop), _) => Next::AwaitStop(stop),
                    (_, _, _, Some(start)) => Next::AwaitStart(start),
                    _ => Next::AwaitStart(self.begin_start(&mut slot)),
                }
            };
            match next {
                Next::Ready(port) => return Ok(port),
                Next::AwaitStop(stop) => {
                    debug!("Waiting for stop before starting");
                    stop.await;
                }
                Next::AwaitStart(start) => return start.await,
            }
        }
    }

    fn begin_start(&self, slot: &mut Slot) -> PendingStart {
        slot.state = LifecycleState::Starting;
        slot.generation += 1;
        let generation = slot.generation;

        let inner = self.inner.clone();
        let task = tokio::spawn(
            inner
                .clone()
                .run_start(generation)
                .instrument(info_span!("start", name = %inner.name, generation)),
        );
        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    error!(?err, "Start task died");
                    inner.settle_failed(generation);
                    Err(SupervisorError::Aborted {
                        name: inner.name.clone(),
                    })
                }
            }
        }
        .boxed()
        .shared();
        slot.pending_start = Some(pending.clone());
        pending
    }

    /// Stop the server. A no-op when nothing is running.
    ///
    /// A start in flight is allowed to settle first, then torn down. A stop
    /// already in progress is joined. Returns the kill outcome, or `None` if
    /// there was nothing to stop. Never fails: if the process survives both
    /// tiers the state is still reset.
    #[instrument(skip(self), fields(name = %self.inner.name))]
    pub async fn stop(&self) -> Option<KillResult> {
        let pending = self.inner.slot.lock().pending_start.clone();
        if let Some(pending) = pending {
            debug!("Waiting for in-flight start before stopping");
            let _ = pending.await;
        }

        let stop = {
            let mut slot = self.inner.slot.lock();
            let in_progress = slot.pending_stop.clone();
            if let Some(stop) = in_progress {
                stop
            } else {
                if slot.state == LifecycleState::Stopped {
                    return None;
                }
                let handle = slot.handle.take()?;
                slot.state = LifecycleState::Stopping;

                let inner = self.inner.clone();
                let task = tokio::spawn(
                    inner
                        .clone()
                        .run_stop(handle)
                        .instrument(info_span!("stop", name = %inner.name)),
                );
                let stop = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => {
                            error!(?err, "Stop task died");
                            inner.settle_stopped();
                            KillResult::survived()
                        }
                    }
                }
                .boxed()
                .shared();
                slot.pending_stop = Some(stop.clone());
                stop
            }
        };
        Some(stop.await)
    }

    pub fn is_running(&self) -> bool {
        self.inner.slot.lock().state == LifecycleState::Running
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.slot.lock().port
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().pid
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.slot.lock().state
    }

    /// The configured URL with the current port filled in, while running.
    pub fn url(&self) -> Option<String> {
        let port = {
            let slot = self.inner.slot.lock();
            if slot.state != LifecycleState::Running {
                return None;
            }
            slot.port?
        };
        match render(&self.inner.config.url, &self.inner.template_vars(port)) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(%err, "Failed to render url");
                None
            }
        }
    }

    /// Captured output of the current process.
    pub fn output(&self) -> Option<String> {
        let handle = self.inner.slot.lock().handle.clone()?;
        Some(handle.output())
    }

    /// Register a callback for pid changes: `Some(pid)` once a start
    /// succeeds, `None` when the process is stopped or dies.
    pub fn on_pid_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<u32>) + Send + Sync + 'static,
    {
        let token = self.inner.listeners.add(Arc::new(callback));
        Subscription::new(&self.inner.listeners, token)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Supervisor")
            .field("name", &self.inner.name)
            .field("state", &slot.state)
            .field("port", &slot.port)
            .field("pid", &slot.pid)
            .finish()
    }
}

impl Inner {
    async fn run_start(self: Arc<Self>, generation: u64) -> Result<u16, SupervisorError> {
        match self.start_attempt().await {
            Ok((port, pid, handle)) => {
                self.slot.lock().state = LifecycleState::Running;
                info!(port, pid, "Server ready");
                // stop() joins the pending start, so keep it published until
                // listeners have seen the pid
                self.listeners.notify(Some(pid));
                {
                    let mut slot = self.slot.lock();
                    if slot.generation == generation {
                        slot.pending_start = None;
                    }
                }
                self.watch_exit(generation, handle);
                Ok(port)
            }
            Err(cause) => {
                error!(%cause, "Failed to start server");
                self.settle_failed(generation);
                Err(SupervisorError::start_failed(self.name.clone(), cause))
            }
        }
    }

    async fn start_attempt(&self) -> Result<(u16, u32, Arc<dyn ProcessHandle>), StartFailure> {
        let config = &self.config;
        if let Some(provisioner) = &self.provisioner {
            if !provisioner.is_installed(&config.executable) {
                return Err(StartFailure::NotInstalled(config.executable.clone()));
            }
        }

        let port = match config.port {
            Some(port) => port,
            None => find_free_port()
                .await
                .map_err(StartFailure::PortAllocation)?,
        };

        let request = self.spawn_request(port)?;
        let handle = self.launcher.spawn(request).await;
        let Some(pid) = handle.pid() else {
            return Err(StartFailure::Spawn {
                program: config.executable.clone(),
                reason: handle
                    .spawn_error()
                    .unwrap_or_else(|| "no process id".into()),
            });
        };
        {
            let mut slot = self.slot.lock();
            slot.port = Some(port);
            slot.pid = Some(pid);
            slot.handle = Some(handle.clone());
        }
        debug!(port, pid, "Spawned, waiting for readiness");

        let readiness = &config.readiness;
        let ready = select! {
            result = wait_until_ready(
                self.probe.as_ref(),
                port,
                readiness.interval,
                readiness.timeout,
            ) => result.map_err(StartFailure::from),
            outcome = handle.wait(None) => {
                let exit = match outcome {
                    WaitOutcome::Exited(exit) => exit,
                    WaitOutcome::Running => Default::default(),
                };
                Err(StartFailure::ExitedBeforeReady { exit, output: handle.output() })
            }
        };

        if let Err(cause) = ready {
            // Don't leave a half-started server holding the port
            let result = handle
                .kill(config.stop.graceful_timeout, config.stop.forceful_timeout)
                .await;
            if !result.success {
                warn!(pid, "Failed to terminate server after failed start");
            }
            return Err(cause);
        }
        Ok((port, pid, handle))
    }

    fn spawn_request(&self, port: u16) -> Result<SpawnRequest, StartFailure> {
        let config = &self.config;
        let vars = self.template_vars(port);
        let args = config
            .args
            .iter()
            .map(|arg| render(arg, &vars))
            .collect::<Result<Vec<_>, _>>()?;
        let env = derive_child_environment(
            &self.parent_env,
            &config.environment_overrides(),
            &config.strip_env_prefixes,
            &config.path_prepend,
        );
        Ok(SpawnRequest {
            program: config.executable.clone(),
            args,
            working_directory: config.working_directory.clone(),
            env,
            capture_output: config.capture_output,
        })
    }

    fn template_vars(&self, port: u16) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("port", port.to_string());
        vars.insert(
            "folder",
            self.config
                .folder
                .as_ref()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        vars
    }

    fn settle_failed(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.state = LifecycleState::Failed;
            slot.clear_process();
            slot.pending_start = None;
        }
    }

    fn settle_stopped(&self) {
        {
            let mut slot = self.slot.lock();
            slot.clear_process();
            slot.pending_start = None;
            slot.pending_stop = None;
            slot.state = LifecycleState::Stopped;
        }
        self.listeners.notify(None);
    }

    async fn run_stop(self: Arc<Self>, handle: Arc<dyn ProcessHandle>) -> KillResult {
        let stop = self.config.stop;
        let result = handle
            .kill(stop.graceful_timeout, stop.forceful_timeout)
            .await;
        if result.success {
            info!(pid = ?handle.pid(), tier = ?result.tier, "Server stopped");
        } else {
            warn!(pid = ?handle.pid(), "Server survived both termination tiers");
        }
        self.settle_stopped();
        result
    }

    fn watch_exit(self: &Arc<Self>, generation: u64, handle: Arc<dyn ProcessHandle>) {
        let inner = Arc::downgrade(self);
        let pid = handle.pid();
        tokio::spawn(
            async move {
                let outcome = handle.wait(None).await;
                if let Some(inner) = inner.upgrade() {
                    inner.exited_unexpectedly(generation, outcome, handle.as_ref());
                }
            }
            .instrument(info_span!("watch_exit", name = %self.name, ?pid)),
        );
    }

    fn exited_unexpectedly(
        &self,
        generation: u64,
        outcome: WaitOutcome,
        handle: &dyn ProcessHandle,
    ) {
        {
            let mut slot = self.slot.lock();
            if slot.generation != generation || slot.state != LifecycleState::Running {
                return;
            }
            slot.state = LifecycleState::Failed;
            slot.clear_process();
        }
        let exit = match outcome {
            WaitOutcome::Exited(exit) => exit.to_string(),
            WaitOutcome::Running => "unknown status".to_string(),
        };
        warn!(%exit, output = %handle.output(), "Server exited unexpectedly");
        self.listeners.notify(None);
    }
}

fn render(template: &str, vars: &HashMap<&str, String>) -> Result<String, StartFailure> {
    if !template.contains('{') {
        return Ok(template.to_string());
    }
    Template::new(template)
        .render(vars)
        .map_err(|err| StartFailure::Template {
            template: template.to_string(),
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_port_and_folder() {
        let mut vars = HashMap::new();
        vars.insert("port", "8080".to_string());
        vars.insert("folder", "/work".to_string());

        assert_eq!(
            render("127.0.0.1:{port}", &vars).unwrap(),
            "127.0.0.1:8080"
        );
        assert_eq!(
            render("http://127.0.0.1:{port}/?folder={folder}", &vars).unwrap(),
            "http://127.0.0.1:8080/?folder=/work"
        );
        assert_eq!(render("--auth", &vars).unwrap(), "--auth");
    }
}
