use anyhow::{Context, Result};
use log::warn;
use std::path::Path;

/// Field positions in a /proc/self/mountinfo line. Later fields are
/// optional, so a line only needs enough tokens to cover these two.
const MOUNT_POINT_INDEX: usize = 4;
const MOUNT_OPTIONS_INDEX: usize = 5;

/// Read the live mount table of this process.
pub fn read_self_mountinfo() -> Result<String> {
    std::fs::read_to_string("/proc/self/mountinfo")
        .context("failed to read /proc/self/mountinfo")
}

/// Scan `mountinfo_data` for the row whose mount point is `mount_point`
/// and report whether its option list contains `ro`. If no row matches,
/// assume read-only.
pub fn is_mount_point_read_only(
    mountinfo_data: &str,
    mount_point: &Path,
) -> bool {
    for line in mountinfo_data.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() <= MOUNT_OPTIONS_INDEX {
            continue;
        }
        if Path::new(tokens[MOUNT_POINT_INDEX]) != mount_point {
            continue;
        }
        return tokens[MOUNT_OPTIONS_INDEX]
            .split(',')
            .any(|option| option == "ro");
    }

    warn!(
        "No mount information found for {}; assuming read-only",
        mount_point.display()
    );
    true
}
