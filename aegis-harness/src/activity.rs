//! Activity sampling: periodically measures how "alive" the guest looks
//! and reports a delta-encoded sample to the host so the idle policy can
//! decide whether to pause or stop it.
//!
//! Three signals, each best-effort: established TCP connection count from
//! `/proc/net/tcp{,6}`, primary CPU ticks from `/proc/<pid>/stat`, and
//! `eth0` byte counters from `/sys/class/net/eth0/statistics/`. Any signal
//! that can't be read (non-Linux, missing pid, no NIC) contributes zero
//! rather than aborting the sample.

use std::time::Duration;

use aegis_protocol::{method, ActivityNotification};

use crate::connection::Connection;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(conn: Connection) {
    let mut prev_cpu_ticks: u64 = 0;
    let mut prev_tx: u64 = 0;
    let mut prev_rx: u64 = 0;

    loop {
        tokio::time::sleep(SAMPLE_INTERVAL).await;

        let conns = established_connections();
        let pid = conn.primary_pid().await;
        let cpu_ticks = pid.and_then(cpu_ticks_for_pid).unwrap_or(prev_cpu_ticks);
        let (tx_bytes, rx_bytes) = nic_byte_counters().unwrap_or((prev_tx, prev_rx));

        let sample = ActivityNotification {
            conns,
            cpu_ticks,
            tx_bytes_delta: tx_bytes.saturating_sub(prev_tx),
            rx_bytes_delta: rx_bytes.saturating_sub(prev_rx),
        };
        prev_cpu_ticks = cpu_ticks;
        prev_tx = tx_bytes;
        prev_rx = rx_bytes;

        conn.notify(method::ACTIVITY, serde_json::to_value(sample).unwrap_or_default());
    }
}

/// Counts `ESTABLISHED` (hex state `01`) rows across both `/proc/net/tcp`
/// and `/proc/net/tcp6`.
fn established_connections() -> u32 {
    ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .map(|path| count_established(path))
        .sum()
}

fn count_established(path: &str) -> u32 {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return 0;
    };
    contents
        .lines()
        .skip(1)
        .filter(|line| {
            line.split_whitespace()
                .nth(3)
                .map(|state| state == "01")
                .unwrap_or(false)
        })
        .count() as u32
}

/// Reads `utime + stime` (fields 14 and 15) from `/proc/<pid>/stat`. The
/// comm field can itself contain spaces and parentheses, so fields are
/// counted from the last `)` rather than split naively on whitespace.
fn cpu_ticks_for_pid(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = contents.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Field 3 (state) is fields[0] here; utime is field 14 overall, i.e.
    // fields[11], stime is field 15, fields[12].
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn nic_byte_counters() -> Option<(u64, u64)> {
    let tx = std::fs::read_to_string("/sys/class/net/eth0/statistics/tx_bytes")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let rx = std::fs::read_to_string("/sys/class/net/eth0/statistics/rx_bytes")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some((tx, rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_ticks_parses_past_comm_field() {
        // pid 1 (comm), state S, ppid 0, ... utime=7 stime=3 at fields 14/15.
        let line = "1 (init (weird) name) S 0 1 1 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 2 0";
        let after_comm = line.rsplit_once(')').unwrap().1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields[11].parse().unwrap();
        let stime: u64 = fields[12].parse().unwrap();
        assert_eq!(utime + stime, 10);
    }

    #[test]
    fn missing_stat_file_yields_none() {
        assert_eq!(cpu_ticks_for_pid(u32::MAX), None);
    }
}
