//! Daemon configuration, loaded from the environment in the same
//! `from_env()` style as `observe::otlp::OtlpConfig::from_env`.

use std::time::Duration;

/// Tunables governing boot, idle, and buffer sizing across the whole
/// daemon. Every field is overridable via `AEGIS_*` environment variables
/// so a single binary can be tuned without a recompile.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the unix-domain socket the host HTTP API listens on.
    pub socket_path: String,
    /// How long `ensure` waits for the harness to dial back after
    /// `vmm.start` (default 60s).
    pub boot_timeout: Duration,
    /// Default timeout for `exec` at the API boundary (default 2min).
    pub exec_timeout: Duration,
    /// How long a `running` instance may sit with no keepalive lease,
    /// no active connections, and no activity before the idle policy
    /// pauses or stops it.
    pub idle_threshold: Duration,
    /// How often the idle-policy background loop re-scans instances.
    pub idle_scan_interval: Duration,
    /// Per-instance Log Store ring capacity (default ~10000).
    pub log_ring_capacity: usize,
    /// Per-session Tether bus buffer capacity.
    pub tether_buffer_capacity: usize,
    /// Fixed loopback port the Guest API listens on inside the VM
    /// (non-configurable on the guest side, but surfaced here so the
    /// host can document/inject it consistently).
    pub guest_api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/run/aegis/aegis.sock".to_string(),
            boot_timeout: Duration::from_secs(60),
            exec_timeout: Duration::from_secs(120),
            idle_threshold: Duration::from_secs(15 * 60),
            idle_scan_interval: Duration::from_secs(5),
            log_ring_capacity: 10_000,
            tether_buffer_capacity: 2048,
            guest_api_port: 7777,
        }
    }
}

impl Config {
    /// Build a `Config` from `AEGIS_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            socket_path: std::env::var("AEGIS_SOCKET_PATH").unwrap_or(defaults.socket_path),
            boot_timeout: env_secs("AEGIS_BOOT_TIMEOUT_SECS", defaults.boot_timeout),
            exec_timeout: env_secs("AEGIS_EXEC_TIMEOUT_SECS", defaults.exec_timeout),
            idle_threshold: env_secs("AEGIS_IDLE_THRESHOLD_SECS", defaults.idle_threshold),
            idle_scan_interval: env_secs(
                "AEGIS_IDLE_SCAN_INTERVAL_SECS",
                defaults.idle_scan_interval,
            ),
            log_ring_capacity: env_usize("AEGIS_LOG_RING_CAPACITY", defaults.log_ring_capacity),
            tether_buffer_capacity: env_usize(
                "AEGIS_TETHER_BUFFER_CAPACITY",
                defaults.tether_buffer_capacity,
            ),
            guest_api_port: env_u16("AEGIS_GUEST_API_PORT", defaults.guest_api_port),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let c = Config::default();
        assert_eq!(c.boot_timeout, Duration::from_secs(60));
        assert_eq!(c.exec_timeout, Duration::from_secs(120));
        assert_eq!(c.log_ring_capacity, 10_000);
        assert_eq!(c.guest_api_port, 7777);
    }

    #[test]
    fn unset_env_vars_fall_back_to_defaults() {
        std::env::remove_var("AEGIS_BOOT_TIMEOUT_SECS");
        let c = Config::from_env();
        assert_eq!(c.boot_timeout, Duration::from_secs(60));
    }
}
