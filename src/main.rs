#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::unwrap_used,
    clippy::use_debug
)]

mod cli;

use anyhow::{Context, Result, anyhow};
use clap::CommandFactory;
use clap::Parser;
use clap_complete::CompleteEnv;
use log::Log;
use sessiond::container::parse_container_config;
use sessiond::logger;
use sessiond::util::read_self_mountinfo;
use sessiond::vm::TerminaManager;

pub fn main() -> Result<()> {
    let logger = logger::DaemonLogger::new(log::LevelFilter::Trace)
        .init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;
    let cli: cli::Args = cli::Args::parse();

    if std::env::var("COMPLETE").is_ok() {
        CompleteEnv::with_factory(cli::Args::command).complete();
        return Ok(());
    }

    logger.set_level(cli.log_level.unwrap_or(log::LevelFilter::Info));
    logger.print_deferred();

    let result = match cli.action.clone() {
        cli::Action::CheckConfig {
            container_dir,
            name,
            cgroup_parent,
        } => check_config(&container_dir, name, &cgroup_parent, cli.json),
        cli::Action::VmStart {
            container_path,
            name,
            writable,
        } => TerminaManager::new().start_vm_container(
            &container_path,
            &name,
            writable,
        ),
        cli::Action::VmStop { name } => {
            TerminaManager::new().stop_vm_container(&name)
        }
    };

    logger.flush();
    result
}

#[allow(clippy::print_stdout)]
fn check_config(
    container_dir: &std::path::Path,
    name: Option<String>,
    cgroup_parent: &str,
    json: bool,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => container_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                anyhow!(
                    "Cannot derive a container name from {}",
                    container_dir.display()
                )
            })?,
    };

    let config_path = container_dir.join(sessiond::container::CONFIG_JSON_NAME);
    let config_json = std::fs::read_to_string(&config_path)
        .context(format!("failed to read {}", config_path.display()))?;
    let runtime_path =
        container_dir.join(sessiond::container::RUNTIME_JSON_NAME);
    let runtime_json = std::fs::read_to_string(&runtime_path)
        .context(format!("failed to read {}", runtime_path.display()))?;
    let mountinfo = read_self_mountinfo()?;

    let config = parse_container_config(
        &config_json,
        &runtime_json,
        &mountinfo,
        &name,
        cgroup_parent,
        container_dir,
    )
    .context(format!("Compiling config for container '{}'", name))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&config)
                .context("Error serializing compiled config")?
        );
        return Ok(());
    }

    println!("container:      {}", name);
    println!("rootfs:         {}", config.rootfs.display());
    println!(
        "rootfs flags:   {}{}",
        config.rootfs_mount_flags.bits(),
        if config
            .rootfs_mount_flags
            .contains(nix::mount::MsFlags::MS_RDONLY)
        {
            " (ro)"
        } else {
            " (rw)"
        }
    );
    println!("uid/gid:        {}/{}", config.uid, config.gid);
    println!("argv:           {}", config.argv.join(" "));
    println!("cgroup parent:  {}", config.cgroup_parent.display());
    println!("alt syscall:    {}", config.alt_syscall_table);
    println!("mounts:         {}", config.mounts.len());
    for mount in &config.mounts {
        println!(
            "  {} {} -> {} [type={}, flags={}, options={}]",
            mount.name,
            mount.source.display(),
            mount.destination.display(),
            mount.fstype,
            mount.flags.bits(),
            if mount.options.is_empty() {
                "-"
            } else {
                mount.options.as_str()
            }
        );
    }
    println!("devices:        {}", config.devices.len());
    for device in &config.devices {
        println!(
            "  {} major={} minor={}{}",
            device.path.display(),
            device.major,
            device.minor,
            if device.copy_minor { " (mirror host)" } else { "" }
        );
    }
    if let Some(setfiles) = &config.run_setfiles {
        println!("post-create:    {}", setfiles.display());
    }
    Ok(())
}
