//! Log Store: per-instance bounded ring buffer with multi-subscriber
//! fan-out.
//!
//! Each instance gets its own [`InstanceLog`]: a ring of [`LogEntry`]
//! values plus a `tokio::sync::broadcast` channel for live tailing.
//! `subscribe()` takes the buffer snapshot and registers the broadcast
//! receiver under the same lock, so no entry can be produced between the
//! snapshot and the live stream (no duplicates or gaps).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::instance::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Primary,
    Exec,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub instance_id: String,
    #[serde(default)]
    pub exec_id: Option<String>,
    pub stream: Stream,
    pub line: String,
    pub source: Source,
    pub ts: u64,
}

impl LogEntry {
    pub fn matches(&self, exec_id: Option<&str>, stream: Option<Stream>) -> bool {
        if let Some(id) = exec_id {
            if self.exec_id.as_deref() != Some(id) {
                return false;
            }
        }
        if let Some(s) = stream {
            if self.stream != s {
                return false;
            }
        }
        true
    }
}

const DEFAULT_CAPACITY: usize = 10_000;
const BROADCAST_CAPACITY: usize = 4096;

struct InstanceLog {
    ring: VecDeque<LogEntry>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
}

impl InstanceLog {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            tx,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(entry.clone());
        // Broadcast send fails only when there are no receivers; that's
        // expected when nobody is tailing this instance right now.
        let _ = self.tx.send(entry);
    }
}

/// A live subscription: a snapshot of the buffer at subscribe time plus a
/// receiver for everything appended afterward.
pub struct Subscription {
    pub snapshot: Vec<LogEntry>,
    pub rx: broadcast::Receiver<LogEntry>,
}

/// The host-wide Log Store, keyed by instance id.
#[derive(Default)]
pub struct LogStore {
    capacity: usize,
    instances: Mutex<HashMap<String, InstanceLog>>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { DEFAULT_CAPACITY } else { capacity },
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Append a line of output. Creates the instance's log on first use.
    pub fn append(
        &self,
        instance_id: &str,
        exec_id: Option<String>,
        stream: Stream,
        source: Source,
        line: String,
    ) {
        let entry = LogEntry {
            instance_id: instance_id.to_string(),
            exec_id,
            stream,
            line,
            source,
            ts: now_ms(),
        };
        let mut instances = self.instances.lock().unwrap();
        instances
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceLog::new(self.capacity))
            .push(entry);
    }

    /// Atomically snapshot the existing buffer and register a live
    /// subscriber so no entries are missed or duplicated in between.
    pub fn subscribe(&self, instance_id: &str) -> Subscription {
        let mut instances = self.instances.lock().unwrap();
        let log = instances
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceLog::new(self.capacity));
        Subscription {
            snapshot: log.ring.iter().cloned().collect(),
            rx: log.tx.subscribe(),
        }
    }

    /// Drop all buffered entries for an instance. Called by
    /// `instance_delete`; `instance_disable` intentionally does *not* call
    /// this (see DESIGN.md open-question decision).
    pub fn clear(&self, instance_id: &str) {
        self.instances.lock().unwrap().remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_when_full() {
        let store = LogStore::new(2);
        for i in 0..3 {
            store.append(
                "i1",
                None,
                Stream::Stdout,
                Source::Primary,
                format!("line{i}"),
            );
        }
        let sub = store.subscribe("i1");
        assert_eq!(sub.snapshot.len(), 2);
        assert_eq!(sub.snapshot[0].line, "line1");
        assert_eq!(sub.snapshot[1].line, "line2");
    }

    #[tokio::test]
    async fn subscribe_then_append_is_seen_live() {
        let store = LogStore::new(10);
        store.append("i1", None, Stream::Stdout, Source::Primary, "before".into());
        let mut sub = store.subscribe("i1");
        assert_eq!(sub.snapshot.len(), 1);

        store.append("i1", None, Stream::Stdout, Source::Primary, "after".into());
        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.line, "after");
    }

    #[test]
    fn filter_by_exec_id_and_stream() {
        let entry = LogEntry {
            instance_id: "i1".into(),
            exec_id: Some("e1".into()),
            stream: Stream::Stderr,
            line: "oops".into(),
            source: Source::Exec,
            ts: 0,
        };
        assert!(entry.matches(Some("e1"), Some(Stream::Stderr)));
        assert!(!entry.matches(Some("e2"), None));
        assert!(!entry.matches(None, Some(Stream::Stdout)));
    }

    #[test]
    fn clear_removes_buffered_entries() {
        let store = LogStore::new(10);
        store.append("i1", None, Stream::Stdout, Source::Primary, "x".into());
        store.clear("i1");
        let sub = store.subscribe("i1");
        assert!(sub.snapshot.is_empty());
    }
}
