use crate::container::{
    ContainerConfig, CpuBandwidth, CpuParams, CpuRealtime, DeviceKind,
    DeviceSpec, MountSpec,
};
use crate::util::is_mount_point_read_only;
use anyhow::{Context, Result, anyhow};
use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Containers whose name carries this marker get the post-create
/// relabeling hook attached.
const ANDROID_NAME_MARKER: &str = "android";
const SETFILES_PATH: &str = "/sbin/setfiles";

/// Compile the two per-container JSON documents plus the host's live mount
/// table into one fully-resolved configuration for the runtime engine.
///
/// `config_json` describes what to run (rootfs, process, mount names);
/// `runtime_json` describes how to sandbox it (mount details, namespace
/// mappings, device whitelist, cgroup CPU parameters). Pure except for the
/// caller-supplied mount table text.
pub fn parse_container_config(
    config_json: &str,
    runtime_json: &str,
    mountinfo_data: &str,
    container_name: &str,
    cgroup_parent_name: &str,
    container_dir: &Path,
) -> Result<ContainerConfig> {
    let config_root: Value = serde_json::from_str(config_json).context(
        format!("Failed to parse config document for {}", container_name),
    )?;
    let config_root = config_root.as_object().ok_or_else(|| {
        anyhow!(
            "Config document for {} is not a JSON object",
            container_name
        )
    })?;

    let runtime_root: Value = serde_json::from_str(runtime_json).context(
        format!("Failed to parse runtime document for {}", container_name),
    )?;
    let runtime_root = runtime_root.as_object().ok_or_else(|| {
        anyhow!(
            "Runtime document for {} is not a JSON object",
            container_name
        )
    })?;

    let (rootfs, rootfs_mount_flags) =
        parse_rootfs(config_root, container_dir, mountinfo_data)?;
    let (uid, gid, argv) = parse_process(config_root)?;
    let mounts =
        parse_mounts(config_root, runtime_root, container_dir, uid, gid)?;
    let linux = get_object(runtime_root, "linux", "runtime document")?;
    let uid_map = get_string(linux, "uidMappings", "linux node")?;
    let gid_map = get_string(linux, "gidMappings", "linux node")?;
    let alt_syscall_table = get_string(linux, "altSysCallTable", "linux node")?;
    let devices = parse_devices(linux)?;
    let cpu = parse_cpu(linux)?;

    // The cgroup parent is namespaced per container owner.
    let cgroup_parent =
        Path::new(cgroup_parent_name).join(uid.as_raw().to_string());

    let run_setfiles = if container_name.contains(ANDROID_NAME_MARKER) {
        Some(PathBuf::from(SETFILES_PATH))
    } else {
        None
    };

    Ok(ContainerConfig {
        rootfs,
        rootfs_mount_flags,
        uid,
        gid,
        argv,
        mounts,
        devices,
        uid_map,
        gid_map,
        alt_syscall_table,
        cgroup_parent,
        cpu,
        run_setfiles,
    })
}

fn get_object<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    what: &str,
) -> Result<&'a Map<String, Value>> {
    parent
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("Failed to get '{}' object from {}", key, what))
}

fn get_array<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    what: &str,
) -> Result<&'a Vec<Value>> {
    parent
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Failed to get '{}' list from {}", key, what))
}

fn get_string(
    parent: &Map<String, Value>,
    key: &str,
    what: &str,
) -> Result<String> {
    parent
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Failed to get '{}' string from {}", key, what))
}

fn get_integer(
    parent: &Map<String, Value>,
    key: &str,
    what: &str,
) -> Result<i64> {
    parent
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("Failed to get '{}' integer from {}", key, what))
}

/// Resolve the rootfs path and decide its mount flags. Only the ro/rw bit
/// of the host's mount survives: the host mounts its filesystems nosuid,
/// nodev, noexec, and a container rootfs remounted with any of those flags
/// would not work, so they are always cleared for the in-namespace mount.
fn parse_rootfs(
    config_root: &Map<String, Value>,
    container_dir: &Path,
    mountinfo_data: &str,
) -> Result<(PathBuf, MsFlags)> {
    let root = get_object(config_root, "root", "config document")?;
    let path = get_string(root, "path", "config root node")?;
    let rootfs = container_dir.join(path);

    let mut flags = MsFlags::empty();
    if is_mount_point_read_only(mountinfo_data, &rootfs) {
        flags |= MsFlags::MS_RDONLY;
    }
    Ok((rootfs, flags))
}

/// The main process to run and the user to run it as. The ids are from the
/// initial user namespace, not ids inside the container.
fn parse_process(
    config_root: &Map<String, Value>,
) -> Result<(Uid, Gid, Vec<String>)> {
    let process = get_object(config_root, "process", "config document")?;
    let user = get_object(process, "user", "process node")?;
    let uid = Uid::from_raw(
        u32::try_from(get_integer(user, "uid", "process user node")?)
            .context("process uid out of range")?,
    );
    let gid = Gid::from_raw(
        u32::try_from(get_integer(user, "gid", "process user node")?)
            .context("process gid out of range")?,
    );

    let args = get_array(process, "args", "process node")?;
    let argv = args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            arg.as_str().map(str::to_string).ok_or_else(|| {
                anyhow!("Process arg {} is not a string", i)
            })
        })
        .collect::<Result<Vec<String>>>()?;
    if argv.is_empty() {
        return Err(anyhow!("Process args list is empty"));
    }

    Ok((uid, gid, argv))
}

#[derive(Debug)]
struct MountOptions {
    flags: MsFlags,
    option_string: String,
    mount_in_ns: bool,
    create_mount_point: bool,
    root_relative: bool,
}

/// Recognize the fixed mount-option vocabulary; anything else is preserved
/// verbatim and comma-joined into the string handed to the mount call.
fn parse_mount_options(
    options: &[Value],
    mount_name: &str,
) -> Result<MountOptions> {
    let mut parsed = MountOptions {
        flags: MsFlags::empty(),
        option_string: String::new(),
        mount_in_ns: true,
        create_mount_point: true,
        root_relative: false,
    };

    for (i, option) in options.iter().enumerate() {
        let option = option.as_str().ok_or_else(|| {
            anyhow!(
                "Option {} of mount '{}' is not a string",
                i, mount_name
            )
        })?;
        match option {
            "nodev" => parsed.flags |= MsFlags::MS_NODEV,
            "noexec" => parsed.flags |= MsFlags::MS_NOEXEC,
            "nosuid" => parsed.flags |= MsFlags::MS_NOSUID,
            "bind" => parsed.flags |= MsFlags::MS_BIND,
            "ro" => parsed.flags |= MsFlags::MS_RDONLY,
            "private" => parsed.flags |= MsFlags::MS_PRIVATE,
            "recursive" => parsed.flags |= MsFlags::MS_REC,
            "slave" => parsed.flags |= MsFlags::MS_SLAVE,
            "remount" => parsed.flags |= MsFlags::MS_REMOUNT,
            "root_relative" => parsed.root_relative = true,
            "mount_outside" => parsed.mount_in_ns = false,
            "nocreate" => parsed.create_mount_point = false,
            other => {
                if !parsed.option_string.is_empty() {
                    parsed.option_string.push(',');
                }
                parsed.option_string.push_str(other);
            }
        }
    }

    Ok(parsed)
}

/// Mount information is split between the two documents: the config
/// document names the mounts and their destinations, the runtime document
/// holds the per-mount details. Every config-side name must resolve in the
/// runtime-side map.
fn parse_mounts(
    config_root: &Map<String, Value>,
    runtime_root: &Map<String, Value>,
    container_dir: &Path,
    uid: Uid,
    gid: Gid,
) -> Result<Vec<MountSpec>> {
    let config_mounts = get_array(config_root, "mounts", "config document")?;
    let runtime_mounts =
        get_object(runtime_root, "mounts", "runtime document")?;

    let mut mounts = Vec::with_capacity(config_mounts.len());
    for (i, entry) in config_mounts.iter().enumerate() {
        let entry = entry.as_object().ok_or_else(|| {
            anyhow!("Mount {} in config document is not an object", i)
        })?;
        let name = get_string(entry, "name", &format!("config mount {}", i))?;
        let destination =
            get_string(entry, "path", &format!("config mount {}", i))?;

        let detail =
            get_object(runtime_mounts, &name, "runtime mounts map").context(
                format!("No runtime mount entry for config mount '{}'", name),
            )?;
        let fstype =
            get_string(detail, "type", &format!("runtime mount '{}'", name))?;
        let options = get_array(
            detail,
            "options",
            &format!("runtime mount '{}'", name),
        )?;
        let parsed = parse_mount_options(options, &name)?;
        let source =
            get_string(detail, "source", &format!("runtime mount '{}'", name))?;

        let mut source = PathBuf::from(source);
        if parsed.flags.contains(MsFlags::MS_BIND)
            && !parsed.root_relative
            && !source.is_absolute()
        {
            source = container_dir.join(source);
        }

        mounts.push(MountSpec {
            name,
            source,
            destination: PathBuf::from(destination),
            fstype,
            options: parsed.option_string,
            flags: parsed.flags,
            uid,
            gid,
            mount_in_ns: parsed.mount_in_ns,
            create_mount_point: parsed.create_mount_point,
        });
    }

    Ok(mounts)
}

fn parse_device_kind(device: &Map<String, Value>, path: &Path) -> Result<DeviceKind> {
    // The type is a single character; accept it either as a string or as
    // the character's integer value.
    let kind = match device.get("type") {
        Some(Value::String(s)) => s.chars().next(),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .and_then(char::from_u32),
        _ => None,
    };
    match kind {
        Some('b') => Ok(DeviceKind::Block),
        Some('c') => Ok(DeviceKind::Char),
        _ => Err(anyhow!("Invalid device type for {}", path.display())),
    }
}

/// The whitelist of device nodes created, and given permissions, when the
/// container starts.
fn parse_devices(linux: &Map<String, Value>) -> Result<Vec<DeviceSpec>> {
    let device_list = get_array(linux, "devices", "linux node")?;

    let mut devices = Vec::with_capacity(device_list.len());
    for (i, device) in device_list.iter().enumerate() {
        let device = device.as_object().ok_or_else(|| {
            anyhow!("Device {} in linux node is not an object", i)
        })?;
        let path = PathBuf::from(get_string(
            device,
            "path",
            &format!("device {}", i),
        )?);
        let what = format!("device {}", path.display());
        let kind = parse_device_kind(device, &path)?;
        let major = get_integer(device, "major", &what)?;
        let minor = get_integer(device, "minor", &what)?;
        // A negative minor means "mirror the host device's current minor".
        let copy_minor = path != Path::new("nodev") && minor < 0;
        let permissions = get_string(device, "permissions", &what)?;
        let file_mode = u32::try_from(get_integer(device, "fileMode", &what)?)
            .context(format!("fileMode out of range for {}", what))?;
        let uid = Uid::from_raw(
            u32::try_from(get_integer(device, "uid", &what)?)
                .context(format!("uid out of range for {}", what))?,
        );
        let gid = Gid::from_raw(
            u32::try_from(get_integer(device, "gid", &what)?)
                .context(format!("gid out of range for {}", what))?,
        );

        devices.push(DeviceSpec {
            kind,
            path,
            major,
            minor,
            copy_minor,
            read_allowed: permissions.contains('r'),
            write_allowed: permissions.contains('w'),
            modify_allowed: permissions.contains('m'),
            file_mode,
            uid,
            gid,
        });
    }

    Ok(devices)
}

/// CPU cgroup parameters are optional, and each setting inside the block
/// is itself optional; the paired settings only apply together.
fn parse_cpu(linux: &Map<String, Value>) -> Result<CpuParams> {
    let mut cpu = CpuParams::default();
    let Some(cpu_node) = linux.get("cpu").and_then(Value::as_object) else {
        return Ok(cpu);
    };

    cpu.shares = cpu_node.get("shares").and_then(Value::as_i64);

    if let (Some(quota), Some(period)) = (
        cpu_node.get("quota").and_then(Value::as_i64),
        cpu_node.get("period").and_then(Value::as_i64),
    ) {
        cpu.bandwidth = Some(CpuBandwidth { quota, period });
    }

    if let (Some(runtime), Some(period)) = (
        cpu_node.get("realtimeRuntime").and_then(Value::as_i64),
        cpu_node.get("realtimePeriod").and_then(Value::as_i64),
    ) {
        cpu.realtime = Some(CpuRealtime { runtime, period });
    }

    Ok(cpu)
}
