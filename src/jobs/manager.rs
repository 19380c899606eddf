use crate::jobs::ExitStatus;
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The capability every supervisable job must implement so the dispatcher
/// can route a reaped child back to its owner, and so the embedding daemon
/// can tear the job down within a deadline.
///
/// All four operations on one job must be serialized by the caller; holding
/// each implementation behind a `Mutex` (see [`SharedJobManager`]) gives a
/// threaded embedding the same ordering the original single event loop had.
pub trait JobManager: Send {
    /// Whether `pid` is the job this manager currently owns.
    fn is_managed_job(&self, pid: Pid) -> bool;

    /// A child claimed via `is_managed_job` was reaped. Must be a no-op if
    /// the job was already cleaned up (spurious notification).
    fn handle_exit(&mut self, status: &ExitStatus);

    /// Ask the job to exit gracefully. Fire-and-forget: failures are
    /// logged, and cleanup happens on `handle_exit` or a later
    /// `ensure_job_exit`.
    fn request_job_exit(&mut self, reason: &str);

    /// Wait up to `timeout` for the job's process group to disappear, then
    /// force-kill it. Does not confirm the forced kill; callers needing
    /// confirmed termination wait for the exit notification.
    fn ensure_job_exit(&mut self, timeout: Duration);
}

pub type SharedJobManager = Arc<Mutex<dyn JobManager>>;
