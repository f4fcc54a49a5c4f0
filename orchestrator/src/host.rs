//! Host facts used by preflight checks and run records

use std::path::Path;

use sysinfo::{Disks, System};

/// Hostname, or "unknown"
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Free bytes on the volume holding `path`.
///
/// The volume is the mounted disk with the longest mount point that prefixes
/// the canonical path. `None` when no disk matches.
pub fn available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
