use crate::container::ContainerConfig;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Where engine-backed containers keep their runtime state.
pub const CONTAINER_RUN_DIR: &str = "/run/containers";

/// A non-zero status returned by the runtime engine, tagged with the call
/// that produced it. Engines report errors as negated errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineError {
    pub operation: &'static str,
    pub status: i32,
}

impl EngineError {
    pub fn new(operation: &'static str, status: i32) -> Self {
        Self { operation, status }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "engine {} failed with status {} ({})",
            self.operation,
            self.status,
            Errno::from_raw(self.status.abs())
        )
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// The external component that enforces namespaces, cgroups, and mounts
/// given a compiled config. Consumed, never reimplemented, by this crate.
pub trait ContainerEngine: Send {
    /// Create a container instance named `name` with its runtime state
    /// under `run_dir`. The instance is inert until started.
    fn create(
        &self,
        name: &str,
        run_dir: &Path,
    ) -> EngineResult<Box<dyn EngineHandle>>;
}

/// A live (or startable) engine-side container instance. Dropping the
/// handle destroys the engine-side bookkeeping.
pub trait EngineHandle: Send {
    /// Launch the container's process group from the compiled config.
    fn start(&mut self, config: &ContainerConfig) -> EngineResult<()>;

    /// The pid of the container's init process, once started.
    fn current_pid(&self) -> Option<Pid>;

    /// Where the container's rootfs is mounted on the host.
    fn root_path(&self) -> PathBuf;

    /// Ask the engine to kill the container's process group.
    fn kill(&mut self) -> EngineResult<()>;

    /// Block until the process group is fully gone and reap the engine's
    /// own bookkeeping. Returns the container's exit status.
    fn wait(&mut self) -> EngineResult<i32>;
}
