use nix::mount::MsFlags;
use nix::unistd::{Gid, Uid};
use serde::{Serialize, Serializer};
use std::path::PathBuf;

fn serialize_flags<S: Serializer>(
    flags: &MsFlags,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(flags.bits() as u64)
}

fn serialize_uid<S: Serializer>(
    uid: &Uid,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(uid.as_raw())
}

fn serialize_gid<S: Serializer>(
    gid: &Gid,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(gid.as_raw())
}

/// One mount inside the compiled container configuration. Details come
/// from the runtime document; the name and destination come from the
/// config document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub fstype: String,
    /// Unrecognized option tokens, comma-joined, passed through verbatim
    /// to the mount call.
    pub options: String,
    #[serde(serialize_with = "serialize_flags")]
    pub flags: MsFlags,
    #[serde(serialize_with = "serialize_uid")]
    pub uid: Uid,
    #[serde(serialize_with = "serialize_gid")]
    pub gid: Gid,
    /// Mount inside the container's namespace (false: host side).
    pub mount_in_ns: bool,
    pub create_mount_point: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceKind {
    Char,
    Block,
}

/// A device node the container is allowed to have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub path: PathBuf,
    pub major: i64,
    pub minor: i64,
    /// Mirror the host device's current minor number instead of `minor`.
    pub copy_minor: bool,
    pub read_allowed: bool,
    pub write_allowed: bool,
    pub modify_allowed: bool,
    pub file_mode: u32,
    #[serde(serialize_with = "serialize_uid")]
    pub uid: Uid,
    #[serde(serialize_with = "serialize_gid")]
    pub gid: Gid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuBandwidth {
    pub quota: i64,
    pub period: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuRealtime {
    pub runtime: i64,
    pub period: i64,
}

/// Optional CPU cgroup parameters. Absence of the whole block is normal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuParams {
    pub shares: Option<i64>,
    pub bandwidth: Option<CpuBandwidth>,
    pub realtime: Option<CpuRealtime>,
}

/// A fully-resolved container configuration, built once per container
/// start and handed to the runtime engine.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    pub rootfs: PathBuf,
    /// Derived, not user-supplied: only the ro bit survives from the
    /// host's mount of the rootfs; nosuid/nodev/noexec are always cleared
    /// so execution semantics inside the sandbox are normalized.
    #[serde(serialize_with = "serialize_flags")]
    pub rootfs_mount_flags: MsFlags,
    #[serde(serialize_with = "serialize_uid")]
    pub uid: Uid,
    #[serde(serialize_with = "serialize_gid")]
    pub gid: Gid,
    pub argv: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub devices: Vec<DeviceSpec>,
    /// Opaque uid/gid mapping strings for the user namespace.
    pub uid_map: String,
    pub gid_map: String,
    pub alt_syscall_table: String,
    pub cgroup_parent: PathBuf,
    pub cpu: CpuParams,
    /// Post-create hook (file relabeling) run inside the new rootfs.
    pub run_setfiles: Option<PathBuf>,
}
