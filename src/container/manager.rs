use crate::container::parse_container_config;
use crate::engine::{CONTAINER_RUN_DIR, ContainerEngine, EngineHandle};
use crate::jobs::{ExitStatus, JobManager};
use crate::util::{
    kill_process_group, read_self_mountinfo, wait_for_process_group_exit,
};
use anyhow::{Context, Result, anyhow};
use log::{info, trace, warn};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// The two declarative documents every container directory must hold.
pub const CONFIG_JSON_NAME: &str = "config.json";
pub const RUNTIME_JSON_NAME: &str = "runtime.json";

/// Default deadline for `ensure_job_exit` when tearing down a session's
/// containers. Graceful container shutdown needs up to a second on slow
/// hardware.
pub const CONTAINER_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether teardown must preserve the container's state. Stateless
/// containers take the fast path: no graceful stop, straight to a
/// process-group kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    Stateful,
    Stateless,
}

/// Invoked exactly once when the container's on-stopped hook fires.
pub type ExitCallback = Box<dyn FnOnce(Pid, bool) + Send>;

/// The two extension points a container variant may replace: how
/// termination is requested, and what happens once the container stopped.
/// State-machine transitions stay with [`ContainerManager`].
pub trait TerminationStrategy: Send {
    fn request_termination(
        &mut self,
        handle: &mut dyn EngineHandle,
        teardown: TeardownMode,
    ) -> Result<()>;

    fn on_stopped(&mut self, clean: bool);
}

/// Default strategy: ask the engine to kill the instance, or force-kill
/// the process group outright for stateless containers.
pub struct EngineTermination;

impl TerminationStrategy for EngineTermination {
    fn request_termination(
        &mut self,
        handle: &mut dyn EngineHandle,
        teardown: TeardownMode,
    ) -> Result<()> {
        match teardown {
            TeardownMode::Stateful => {
                handle.kill().context("Engine kill failed")
            }
            TeardownMode::Stateless => {
                if let Some(pid) = handle.current_pid() {
                    kill_process_group(pid);
                }
                Ok(())
            }
        }
    }

    fn on_stopped(&mut self, _clean: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopping,
}

pub fn is_valid_container_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.')
        })
}

/// Owns one named container's lifecycle end-to-end: compiles its config,
/// drives the runtime engine's create/start/kill/wait primitives, and
/// implements the job-manager contract so the dispatcher can route the
/// container's exit back here.
pub struct ContainerManager {
    name: String,
    container_dir: PathBuf,
    run_dir: PathBuf,
    cgroup_parent: String,
    engine: Box<dyn ContainerEngine>,
    strategy: Box<dyn TerminationStrategy>,
    teardown: TeardownMode,
    state: State,
    handle: Option<Box<dyn EngineHandle>>,
    instance_id: Option<String>,
    exit_callback: Option<ExitCallback>,
    termination_requested: bool,
}

impl ContainerManager {
    pub fn new(
        engine: Box<dyn ContainerEngine>,
        name: &str,
        container_dir: &Path,
        cgroup_parent: &str,
    ) -> Result<Self> {
        if !is_valid_container_name(name) {
            return Err(anyhow!("Invalid character in container name {}", name));
        }
        Ok(Self {
            name: name.to_string(),
            container_dir: container_dir.to_path_buf(),
            run_dir: PathBuf::from(CONTAINER_RUN_DIR),
            cgroup_parent: cgroup_parent.to_string(),
            engine,
            strategy: Box::new(EngineTermination),
            teardown: TeardownMode::Stateful,
            state: State::Idle,
            handle: None,
            instance_id: None,
            exit_callback: None,
            termination_requested: false,
        })
    }

    pub fn with_strategy(
        mut self,
        strategy: Box<dyn TerminationStrategy>,
    ) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_run_dir(mut self, run_dir: &Path) -> Self {
        self.run_dir = run_dir.to_path_buf();
        self
    }

    pub fn set_teardown_mode(&mut self, teardown: TeardownMode) {
        self.teardown = teardown;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine-reported pid of the running instance.
    pub fn current_pid(&self) -> Option<Pid> {
        self.handle.as_ref().and_then(|handle| handle.current_pid())
    }

    /// Where the running instance's rootfs is mounted on the host.
    pub fn root_path(&self) -> Option<PathBuf> {
        self.handle.as_ref().map(|handle| handle.root_path())
    }

    pub fn is_running(&self) -> bool {
        self.state != State::Idle
    }

    /// The per-start instance token, present while the container runs.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Compile this container's config and launch it through the engine.
    /// On any failure no partial state is retained; the manager stays
    /// Idle. `exit_callback` fires exactly once when the container stops.
    pub fn start(&mut self, exit_callback: ExitCallback) -> Result<()> {
        if self.state != State::Idle {
            return Err(anyhow!(
                "Container '{}' is already running",
                self.name
            ));
        }

        let config_path = self.container_dir.join(CONFIG_JSON_NAME);
        let config_json =
            std::fs::read_to_string(&config_path).context(format!(
                "failed to read {}",
                config_path.display()
            ))?;
        let runtime_path = self.container_dir.join(RUNTIME_JSON_NAME);
        let runtime_json =
            std::fs::read_to_string(&runtime_path).context(format!(
                "failed to read {}",
                runtime_path.display()
            ))?;
        let mountinfo = read_self_mountinfo()?;

        let config = parse_container_config(
            &config_json,
            &runtime_json,
            &mountinfo,
            &self.name,
            &self.cgroup_parent,
            &self.container_dir,
        )
        .context(format!("Compiling config for container '{}'", self.name))?;

        let mut handle = self
            .engine
            .create(&self.name, &self.run_dir)
            .context(format!("Creating container '{}'", self.name))?;
        if let Err(e) = handle.start(&config) {
            // Dropping the never-started handle releases the engine-side
            // bookkeeping.
            return Err(anyhow!(
                "Starting container '{}' failed: {}",
                self.name, e
            ));
        }

        let instance_id = Uuid::new_v4().to_string();
        info!(
            "Started container '{}' instance {} with pid {}",
            self.name,
            instance_id,
            handle
                .current_pid()
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "?".to_string())
        );

        self.handle = Some(handle);
        self.instance_id = Some(instance_id);
        self.exit_callback = Some(exit_callback);
        self.termination_requested = false;
        self.state = State::Running;
        Ok(())
    }

    /// Tear down the stopped (or force-killed) instance: run the
    /// on-stopped hook, fire the exit callback, reap the engine's own
    /// bookkeeping, and release the handle.
    fn cleanup(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let clean = self.termination_requested;
        let pid = handle.current_pid().unwrap_or(Pid::from_raw(-1));

        self.strategy.on_stopped(clean);
        if let Some(callback) = self.exit_callback.take() {
            callback(pid, clean);
        }
        if let Err(e) = handle.wait() {
            warn!(
                "Engine wait for container '{}' failed: {}",
                self.name, e
            );
        }

        info!(
            "Container '{}' instance {} stopped (clean: {})",
            self.name,
            self.instance_id.take().unwrap_or_else(|| "?".to_string()),
            clean
        );
        self.termination_requested = false;
        self.state = State::Idle;
    }
}

impl JobManager for ContainerManager {
    fn is_managed_job(&self, pid: Pid) -> bool {
        self.current_pid() == Some(pid)
    }

    fn handle_exit(&mut self, _status: &ExitStatus) {
        if self.handle.is_none() {
            trace!(
                "Spurious exit notification for container '{}'; ignoring",
                self.name
            );
            return;
        }
        self.cleanup();
    }

    fn request_job_exit(&mut self, reason: &str) {
        if self.state != State::Running {
            trace!(
                "Exit requested for container '{}' but it is not running",
                self.name
            );
            return;
        }
        info!("Requesting exit of container '{}': {}", self.name, reason);
        self.termination_requested = true;

        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        if let Err(e) =
            self.strategy.request_termination(handle.as_mut(), self.teardown)
        {
            // Not retried here; cleanup happens on handle_exit or a later
            // ensure_job_exit.
            warn!(
                "Termination request for container '{}' failed: {}",
                self.name, e
            );
        }
        self.state = State::Stopping;
    }

    fn ensure_job_exit(&mut self, timeout: Duration) {
        if self.handle.is_none() {
            return;
        }
        if let Some(pid) = self.current_pid() {
            if !wait_for_process_group_exit(pid, timeout) {
                // One forced kill, no re-check: the next reaped exit, if
                // any, still flows through handle_exit and is a no-op
                // once the handle is released below.
                warn!(
                    "Container '{}' outlived its exit deadline; killing \
                     process group {}",
                    self.name, pid
                );
                kill_process_group(pid);
            }
        }
        self.cleanup();
    }
}
