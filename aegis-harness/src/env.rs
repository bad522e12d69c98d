//! Reads the guest environment the host injected: `AEGIS_HOST_ADDR`,
//! `AEGIS_WORKSPACE`, `AEGIS_NET_IP`, `AEGIS_INSTANCE_ID`, plus user `env`
//! and resolved secrets. A real VMM passes these as kernel-cmdline
//! `key=value` pairs; since `/proc/cmdline` parsing is Linux-only and this
//! crate must stay cross-compilable for dev-host unit tests, process
//! environment variables are consulted first and `/proc/cmdline` is a
//! Linux-only fallback.

use std::collections::HashMap;

pub fn lookup(key: &str) -> Option<String> {
    if let Ok(v) = std::env::var(key) {
        return Some(v);
    }
    cmdline_params().get(key).cloned()
}

#[cfg(target_os = "linux")]
fn cmdline_params() -> HashMap<String, String> {
    let cmdline = std::fs::read_to_string("/proc/cmdline").unwrap_or_default();
    cmdline
        .split_whitespace()
        .filter_map(|param| param.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn cmdline_params() -> HashMap<String, String> {
    HashMap::new()
}
