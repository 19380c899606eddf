use crate::jobs::{ExitStatus, SharedJobManager, TerminationKind};
use anyhow::{Result, anyhow};
use log::{error, trace, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{Pid, pipe2};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

/// Only one dispatcher may own the process's SIGCHLD disposition.
static DISPATCHER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Written by the signal handler, consumed by `service()`.
static SIGCHLD_PENDING: AtomicBool = AtomicBool::new(false);

/// Write end of the self-pipe, published for the signal handler. -1 when no
/// dispatcher is live.
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe SIGCHLD handler: one atomic store and one byte down
/// the self-pipe, nothing else.
extern "C" fn handle_sigchld(_signal: libc::c_int) {
    SIGCHLD_PENDING.store(true, Ordering::SeqCst);
    let fd = WAKE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Process-wide singleton that reaps every terminated child and routes each
/// one to the first registered manager that claims its pid.
///
/// The manager list is fixed at construction and scanned linearly; the
/// first manager whose `is_managed_job` answers true wins.
pub struct ChildExitDispatcher {
    managers: Vec<SharedJobManager>,
    wake_read: OwnedFd,
    // Keeps the write end alive for the handler; the raw fd is published
    // through WAKE_WRITE_FD.
    _wake_write: OwnedFd,
    previous_action: SigAction,
}

impl std::fmt::Debug for ChildExitDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildExitDispatcher")
            .field("managers", &self.managers.len())
            .field("wake_read", &self.wake_read)
            .finish_non_exhaustive()
    }
}

impl ChildExitDispatcher {
    pub fn new(managers: Vec<SharedJobManager>) -> Result<Self> {
        if DISPATCHER_INSTALLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(anyhow!(
                "A ChildExitDispatcher is already installed in this process"
            ));
        }

        let (wake_read, wake_write) =
            match pipe2(nix::fcntl::OFlag::O_CLOEXEC | nix::fcntl::OFlag::O_NONBLOCK) {
                Ok(fds) => fds,
                Err(e) => {
                    DISPATCHER_INSTALLED.store(false, Ordering::SeqCst);
                    return Err(anyhow!("Failed to create wake pipe: {}", e));
                }
            };
        WAKE_WRITE_FD.store(wake_write.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(handle_sigchld),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let previous_action =
            match unsafe { sigaction(Signal::SIGCHLD, &action) } {
                Ok(previous) => previous,
                Err(e) => {
                    WAKE_WRITE_FD.store(-1, Ordering::SeqCst);
                    DISPATCHER_INSTALLED.store(false, Ordering::SeqCst);
                    return Err(anyhow!(
                        "Failed to install SIGCHLD handler: {}",
                        e
                    ));
                }
            };

        Ok(Self {
            managers,
            wake_read,
            _wake_write: wake_write,
            previous_action,
        })
    }

    /// The fd an event loop should poll for readability; a readable wake fd
    /// means `service()` has work to do.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_read.as_fd()
    }

    /// Block up to `timeout` waiting for a SIGCHLD wakeup. Returns true if
    /// the wake fd became readable.
    pub fn wait_for_exit_notification(&self, timeout: Duration) -> bool {
        let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
        let mut fds =
            [PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(n) => n > 0,
            Err(Errno::EINTR) => true, // a signal landed; worth servicing
            Err(e) => {
                warn!("poll on SIGCHLD wake pipe failed: {}", e);
                false
            }
        }
    }

    /// Reap every currently-terminated child and route each to its owner.
    ///
    /// Called from the event loop thread whenever the wake fd fires; also
    /// safe to call spuriously. One signal delivery can coalesce several
    /// child terminations, so this drains until the kernel reports no more
    /// reapable children.
    pub fn service(&self) {
        SIGCHLD_PENDING.store(false, Ordering::SeqCst);
        self.drain_wake_pipe();

        loop {
            let flags = WaitPidFlag::WNOHANG
                | WaitPidFlag::WUNTRACED
                | WaitPidFlag::WCONTINUED;
            let status = match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break, // no children at all
                Err(e) => {
                    // The process table can no longer be trusted; continuing
                    // to supervise would be guesswork.
                    error!("waitpid failed while reaping children: {}", e);
                    std::process::abort();
                }
            };

            let status = match ExitStatus::from_wait_status(&status) {
                Some(status) => status,
                None => break, // StillAlive: drain complete
            };

            match status.kind {
                TerminationKind::Stopped | TerminationKind::Continued => {
                    trace!(
                        "Ignoring non-terminal notification for pid {}",
                        status.pid
                    );
                    return;
                }
                _ => {}
            }

            self.route(&status);
        }
    }

    fn route(&self, status: &ExitStatus) {
        for manager in &self.managers {
            let mut manager =
                manager.lock().expect("Failed to lock job manager");
            if !manager.is_managed_job(status.pid) {
                continue;
            }
            if status.is_fatal_sentinel() {
                error!(
                    "Managed child {} exited with sentinel code {}; \
                     supervision contract is broken",
                    status.pid, status.status
                );
                std::process::abort();
            }
            trace!(
                "Routing exit of pid {} (status {})",
                status.pid, status.status
            );
            manager.handle_exit(status);
            return;
        }
        warn!(
            "Reaped untracked child {} (status {}); dropping",
            status.pid, status.status
        );
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for ChildExitDispatcher {
    fn drop(&mut self) {
        WAKE_WRITE_FD.store(-1, Ordering::SeqCst);
        if let Err(e) =
            unsafe { sigaction(Signal::SIGCHLD, &self.previous_action) }
        {
            warn!("Failed to restore SIGCHLD disposition: {}", e);
        }
        SIGCHLD_PENDING.store(false, Ordering::SeqCst);
        DISPATCHER_INSTALLED.store(false, Ordering::SeqCst);
    }
}
