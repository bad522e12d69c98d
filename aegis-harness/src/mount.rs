//! Filesystem bootstrap.
//!
//! Mounts `proc` and the `tmpfs` scratch directories the rest of the
//! harness and the user's command need. An `EBUSY` return (already
//! mounted, e.g. a restarted harness) is treated as success; any other
//! error is logged and non-fatal, since a developer box without these
//! mounts can still run the rest of the dispatch loop for testing.
//!
//! The workspace mount is the one exception: a failed workspace mount is
//! fatal, since silently proceeding without it would silently hide the
//! user's project files.

use crate::klog::{fatal, log};

#[cfg(target_os = "linux")]
pub fn mount_essential() {
    use nix::mount::{mount, MsFlags};
    use nix::errno::Errno;

    let _ = std::fs::create_dir_all("/proc");
    try_mount("proc", "/proc", "proc", MsFlags::empty(), None::<&str>);

    let _ = std::fs::create_dir_all("/tmp");
    try_mount("tmpfs", "/tmp", "tmpfs", MsFlags::empty(), Some("mode=1777"));

    let _ = std::fs::create_dir_all("/run");
    try_mount("tmpfs", "/run", "tmpfs", MsFlags::empty(), Some("mode=0755"));

    fn try_mount(source: &str, target: &str, fstype: &str, flags: MsFlags, data: Option<&str>) {
        let result = mount(Some(source), target, Some(fstype), flags, data);
        match result {
            Ok(()) => {}
            Err(Errno::EBUSY) => {}
            Err(e) => log(&format!("mount {target} ({fstype}) failed: {e}")),
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn mount_essential() {
    log("mount_essential is a no-op on this platform");
}

/// Mounts the `workspace` virtiofs tag at `/workspace` if the environment
/// declares one configured (`AEGIS_WORKSPACE=1`). Fatal on failure.
#[cfg(target_os = "linux")]
pub fn mount_workspace_if_configured() {
    let Some(flag) = crate::env::lookup("AEGIS_WORKSPACE") else {
        return;
    };
    if flag != "1" {
        return;
    }

    use nix::mount::{mount, MsFlags};

    let _ = std::fs::create_dir_all("/workspace");
    match mount(
        Some("workspace"),
        "/workspace",
        Some("virtiofs"),
        MsFlags::empty(),
        None::<&str>,
    ) {
        Ok(()) => log("mounted workspace at /workspace"),
        Err(e) => fatal(&format!("workspace mount requested but failed: {e}")),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn mount_workspace_if_configured() {
    if crate::env::lookup("AEGIS_WORKSPACE").as_deref() == Some("1") {
        fatal("workspace mount requested but this platform cannot mount virtiofs");
    }
}
