//! `aegis-harness`: the guest PID-1 process inside an Aegis microVM.
//!
//! Boot sequence:
//! 1. Mount `proc` and scratch `tmpfs`.
//! 2. Mount the `workspace` virtiofs tag if the host attached one — fatal
//!    on failure.
//! 3. Configure `eth0` for gvproxy mode if `AEGIS_NET_IP` is present —
//!    fatal on failure.
//! 4. Dial the host at `AEGIS_HOST_ADDR` (mandatory), retrying up to 30
//!    times at 500 ms — abort on exhaustion.
//! 5. Start the Guest API HTTP server on `127.0.0.1:7777`.
//! 6. Start the activity monitor and enter the JSON-RPC dispatch loop,
//!    waiting for the host's `run` request.

mod activity;
mod connection;
mod env;
mod guestapi;
mod klog;
mod mount;
mod netlink;
mod portproxy;

use klog::{fatal, log};

#[tokio::main]
async fn main() {
    log("booting");

    mount::mount_essential();
    mount::mount_workspace_if_configured();
    netlink::configure_if_requested().await;

    let Some(host_addr) = env::lookup("AEGIS_HOST_ADDR") else {
        fatal("AEGIS_HOST_ADDR not set, nothing to dial");
    };

    let conn = connection::Connection::dial(&host_addr).await;
    log(&format!("connected to host at {host_addr}"));

    tokio::spawn(guestapi::serve(conn.clone()));
    tokio::spawn(activity::run(conn.clone()));

    // The reader task spawned inside `Connection::dial` drives the rest
    // of this process's life: it dispatches `run`/`exec`/`health`/
    // `shutdown` requests and exits the process on disconnect or
    // `shutdown`. Nothing more to do on this task but wait.
    std::future::pending::<()>().await;
}

/// Monotonic-enough wall clock in milliseconds since the epoch, used to
/// stamp exec start times and tether frames. `std::time` rather than
/// `tokio::time::Instant` since these values cross the wire to the host.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
