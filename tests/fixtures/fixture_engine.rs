use nix::unistd::Pid;
use sessiond::container::ContainerConfig;
use sessiond::engine::{
    ContainerEngine, EngineError, EngineHandle, EngineResult,
};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Call counters shared between a test and the engine it built, so the
/// test can observe engine traffic after handing the engine to a manager.
#[derive(Default)]
pub struct EngineCounters {
    pub creates: AtomicUsize,
    pub kills: AtomicUsize,
    pub waits: AtomicUsize,
}

/// Test double for the runtime engine. `start` launches a real `sleep`
/// child in its own process group so pid claims and process-group probes
/// behave like the real thing.
pub struct FakeEngine {
    pub counters: Arc<EngineCounters>,
    /// Pretend the sandboxed process ignores the engine's kill.
    pub ignore_kill: bool,
    /// Make `start` fail with this engine status.
    pub fail_start_status: Option<i32>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(EngineCounters::default()),
            ignore_kill: false,
            fail_start_status: None,
        }
    }

    pub fn ignoring_kill() -> Self {
        Self {
            ignore_kill: true,
            ..Self::new()
        }
    }

    pub fn failing_start(status: i32) -> Self {
        Self {
            fail_start_status: Some(status),
            ..Self::new()
        }
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEngine for FakeEngine {
    fn create(
        &self,
        name: &str,
        run_dir: &Path,
    ) -> EngineResult<Box<dyn EngineHandle>> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle {
            counters: self.counters.clone(),
            ignore_kill: self.ignore_kill,
            fail_start_status: self.fail_start_status,
            root: run_dir.join(name),
            child: None,
        }))
    }
}

pub struct FakeHandle {
    counters: Arc<EngineCounters>,
    ignore_kill: bool,
    fail_start_status: Option<i32>,
    root: PathBuf,
    child: Option<Child>,
}

impl EngineHandle for FakeHandle {
    fn start(&mut self, _config: &ContainerConfig) -> EngineResult<()> {
        if let Some(status) = self.fail_start_status {
            return Err(EngineError::new("start", status));
        }
        use std::os::unix::process::CommandExt;
        let mut command = Command::new("sleep");
        command.arg("30").process_group(0);
        let child = command
            .spawn()
            .map_err(|_| EngineError::new("start", -libc::ENOENT))?;
        self.child = Some(child);
        Ok(())
    }

    fn current_pid(&self) -> Option<Pid> {
        self.child
            .as_ref()
            .map(|child| Pid::from_raw(child.id() as i32))
    }

    fn root_path(&self) -> PathBuf {
        self.root.clone()
    }

    fn kill(&mut self) -> EngineResult<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        if self.ignore_kill {
            return Ok(());
        }
        if let Some(pid) = self.current_pid() {
            let _ = nix::sys::signal::kill(
                Pid::from_raw(-pid.as_raw()),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    fn wait(&mut self) -> EngineResult<i32> {
        self.counters.waits.fetch_add(1, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            // The child may already have been reaped by a dispatcher; any
            // error here just means there is nothing left to collect.
            let _ = child.wait();
        }
        Ok(0)
    }
}
