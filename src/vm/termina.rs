use crate::container::is_valid_container_name;
use crate::jobs::{ExitStatus, JobManager};
use anyhow::{Result, anyhow};
use log::{info, trace, warn};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// External tool that launches and controls the VM and the containers
/// hosted inside it.
pub const VM_LAUNCHER_PATH: &str = "/usr/bin/vm_launcher";

fn is_valid_container_path(path: &Path) -> bool {
    let Some(path) = path.to_str() else {
        return false;
    };
    !path.is_empty()
        && path.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '+' | '-' | '_' | '.' | '/')
        })
}

/// Supervises containers that run inside a VM rather than under the local
/// runtime engine. All control flows through the external launcher tool;
/// no engine handle is ever held.
pub struct TerminaManager {
    launcher: PathBuf,
}

impl TerminaManager {
    pub fn new() -> Self {
        Self {
            launcher: PathBuf::from(VM_LAUNCHER_PATH),
        }
    }

    /// Point at a different launcher binary (tests, alternate installs).
    pub fn with_launcher(launcher: &Path) -> Self {
        Self {
            launcher: launcher.to_path_buf(),
        }
    }

    fn run_launcher(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.launcher).args(args).output().map_err(
            |e| {
                anyhow!(
                    "failed to run {} {}: {}",
                    self.launcher.display(),
                    args.join(" "),
                    e
                )
            },
        )?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} {} failed: {}",
                self.launcher.display(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// The VM name owning `pid`, if the launcher recognizes it.
    fn vm_name_for_pid(&self, pid: Pid) -> Option<String> {
        let pid = pid.to_string();
        match self.run_launcher(&["getname", &pid]) {
            Ok(name) if !name.is_empty() => Some(name),
            Ok(_) => None,
            Err(e) => {
                trace!("VM launcher getname {} failed: {}", pid, e);
                None
            }
        }
    }

    /// Start the container image at `container_path` inside the VM under
    /// `name`. Job-specific operation, not part of the shared contract.
    pub fn start_vm_container(
        &self,
        container_path: &Path,
        name: &str,
        writable: bool,
    ) -> Result<()> {
        if !is_valid_container_name(name) {
            return Err(anyhow!("Invalid character in container name {}", name));
        }
        if !is_valid_container_path(container_path) {
            return Err(anyhow!(
                "Invalid character in container path {}",
                container_path.display()
            ));
        }

        let disk_arg = format!(
            "--{}container={}",
            if writable { "rw" } else { "" },
            container_path.display()
        );
        self.run_launcher(&["start", &disk_arg, name])?;
        info!("Started VM container '{}'", name);
        Ok(())
    }

    /// Stop one named VM container. Job-specific operation, not part of
    /// the shared contract.
    pub fn stop_vm_container(&self, name: &str) -> Result<()> {
        if !is_valid_container_name(name) {
            return Err(anyhow!("Invalid character in container name {}", name));
        }
        self.run_launcher(&["stop", name])?;
        info!("Stopped VM container '{}'", name);
        Ok(())
    }
}

impl Default for TerminaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager for TerminaManager {
    fn is_managed_job(&self, pid: Pid) -> bool {
        self.vm_name_for_pid(pid).is_some()
    }

    fn handle_exit(&mut self, status: &ExitStatus) {
        // A launcher child died on its own; make sure nothing it hosted
        // stays behind.
        info!(
            "VM launcher child {} exited (status {}); stopping all VMs",
            status.pid, status.status
        );
        if let Err(e) = self.run_launcher(&["stop", "--force", "all"]) {
            warn!("Failed to stop VMs after child exit: {}", e);
        }
    }

    fn request_job_exit(&mut self, reason: &str) {
        info!("Requesting exit of all VMs: {}", reason);
        if let Err(e) = self.run_launcher(&["stop", "all"]) {
            warn!("Failed to request VM stop: {}", e);
        }
    }

    fn ensure_job_exit(&mut self, _timeout: Duration) {
        // The launcher's forced stop blocks until the VMs are gone, so
        // there is nothing to poll here.
        if let Err(e) = self.run_launcher(&["stop", "--force", "all"]) {
            warn!("Failed to force VM stop: {}", e);
        }
    }
}
