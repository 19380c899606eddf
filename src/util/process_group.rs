use log::trace;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How often to re-probe while waiting for a process group to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Whether the process group led by `pgid` has fully disappeared.
///
/// Probes with a reaping wait: zombies still count as group members for
/// signal delivery, so a pure `kill(-pgid, 0)` check would never turn
/// true for our own children. Draining them here is what releases the
/// group; a later exit notification for a drained pid is spurious and
/// must be ignored by its manager.
pub fn process_group_gone(pgid: Pid) -> bool {
    loop {
        match waitpid(
            Pid::from_raw(-pgid.as_raw()),
            Some(WaitPidFlag::WNOHANG),
        ) {
            Ok(WaitStatus::StillAlive) => return false,
            Ok(_) => continue, // reaped a member; keep draining
            Err(Errno::ECHILD) => return true,
            Err(e) => {
                trace!("waitpid on process group {} failed: {}", pgid, e);
                return false;
            }
        }
    }
}

/// Poll until the process group led by `pgid` is gone or `timeout`
/// elapses. Returns true if the group disappeared in time.
pub fn wait_for_process_group_exit(pgid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if process_group_gone(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Force-kill the whole process group led by `pgid`. Fire-and-forget: the
/// kernel either delivers SIGKILL or the group is already gone.
pub fn kill_process_group(pgid: Pid) {
    trace!("Sending SIGKILL to process group {}", pgid);
    if let Err(e) = kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGKILL) {
        trace!("Failed to SIGKILL process group {}: {}", pgid, e);
    }
}
