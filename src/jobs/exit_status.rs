use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Exit codes that mean the supervision contract itself is broken: the
/// child could not even assume its identity or exec its payload. Reaping
/// one of these from a managed job is unrecoverable.
pub const CHILD_EXIT_CANT_SET_UID: i32 = 224;
pub const CHILD_EXIT_CANT_SET_GID: i32 = 225;
pub const CHILD_EXIT_CANT_SET_GROUPS: i32 = 226;
pub const CHILD_EXIT_CANT_EXEC: i32 = 227;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    Exited,
    Killed,
    Stopped,
    Continued,
    Other,
}

/// One terminated (or stopped/continued) child, as reported by the reap
/// loop. Produced exactly once per terminated OS process.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub pid: Pid,
    pub kind: TerminationKind,
    /// Exit code for `Exited`, signal number for `Killed`, zero otherwise.
    pub status: i32,
}

impl ExitStatus {
    pub fn from_wait_status(status: &WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(ExitStatus {
                pid: *pid,
                kind: TerminationKind::Exited,
                status: *code,
            }),
            WaitStatus::Signaled(pid, signal, _core_dumped) => {
                Some(ExitStatus {
                    pid: *pid,
                    kind: TerminationKind::Killed,
                    status: *signal as i32,
                })
            }
            WaitStatus::Stopped(pid, _) => Some(ExitStatus {
                pid: *pid,
                kind: TerminationKind::Stopped,
                status: 0,
            }),
            WaitStatus::Continued(pid) => Some(ExitStatus {
                pid: *pid,
                kind: TerminationKind::Continued,
                status: 0,
            }),
            WaitStatus::StillAlive => None,
            _ => Some(ExitStatus {
                pid: Pid::from_raw(-1),
                kind: TerminationKind::Other,
                status: 0,
            }),
        }
    }

    /// True when this is a terminal notification for the child.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            TerminationKind::Exited | TerminationKind::Killed
        )
    }

    /// True when the exit code is one of the sentinel codes that indicate
    /// the child never made it past its own setup.
    pub fn is_fatal_sentinel(&self) -> bool {
        self.kind == TerminationKind::Exited
            && (CHILD_EXIT_CANT_SET_UID..=CHILD_EXIT_CANT_EXEC)
                .contains(&self.status)
    }
}
