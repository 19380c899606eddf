use crate::container::{TeardownMode, TerminationStrategy};
use crate::engine::EngineHandle;
use anyhow::{Context, Result};
use log::{trace, warn};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// Privileged helper that can run commands inside the Android guest.
pub const ANDROID_SHELL: &str = "/usr/sbin/android-sh";

/// Setting this property asks the guest's init to shut the system down on
/// its own, giving it a chance to flush state before we escalate.
pub const ANDROID_SHUTDOWN_COMMAND: &str =
    "/system/bin/setprop sys.powerctl shutdown";

/// Shutdown-latency telemetry lands here as decimal milliseconds.
pub const ANDROID_SHUTDOWN_METRICS_PATH: &str =
    "/run/sessiond/android_shutdown_time_ms";

/// Termination strategy for Android-style containers: cooperative
/// shutdown via a guest property instead of an engine kill, plus
/// shutdown-latency telemetry on clean stops.
pub struct AndroidTermination {
    shell: PathBuf,
    metrics_path: PathBuf,
    shutdown_requested_at: Option<Instant>,
}

impl AndroidTermination {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from(ANDROID_SHELL),
            metrics_path: PathBuf::from(ANDROID_SHUTDOWN_METRICS_PATH),
            shutdown_requested_at: None,
        }
    }

    /// Override the helper and metrics locations (tests, alternate
    /// images).
    pub fn with_paths(shell: &Path, metrics_path: &Path) -> Self {
        Self {
            shell: shell.to_path_buf(),
            metrics_path: metrics_path.to_path_buf(),
            shutdown_requested_at: None,
        }
    }

    fn write_shutdown_metric(&self, elapsed_ms: u128) {
        // Telemetry only; a failed write must never block teardown.
        if let Err(e) =
            std::fs::write(&self.metrics_path, format!("{}", elapsed_ms))
        {
            warn!(
                "Failed to write shutdown time to {}: {}",
                self.metrics_path.display(),
                e
            );
        } else {
            trace!(
                "Android container shut down in {} ms",
                elapsed_ms
            );
        }
    }
}

impl Default for AndroidTermination {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationStrategy for AndroidTermination {
    fn request_termination(
        &mut self,
        _handle: &mut dyn EngineHandle,
        _teardown: TeardownMode,
    ) -> Result<()> {
        self.shutdown_requested_at = Some(Instant::now());
        // The helper's own exit is reaped by the dispatcher like any other
        // untracked child; we only need it launched.
        Command::new(&self.shell)
            .arg("-c")
            .arg(ANDROID_SHUTDOWN_COMMAND)
            .spawn()
            .map(|_child| ())
            .context(format!(
                "failed to spawn {} for guest shutdown",
                self.shell.display()
            ))
    }

    fn on_stopped(&mut self, clean: bool) {
        let Some(requested_at) = self.shutdown_requested_at.take() else {
            return;
        };
        if !clean {
            return;
        }
        self.write_shutdown_metric(requested_at.elapsed().as_millis());
    }
}
