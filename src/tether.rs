//! Tether bus: per-(instance, channel, session) ordered append-only frame
//! log with long-poll readers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use aegis_protocol::{TetherChannel, TetherFrameNotification, TetherSession};

use crate::instance::now_ms;

const DEFAULT_BUFFER_CAPACITY: usize = 2048;
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct StoredFrame {
    pub seq: u64,
    pub frame_type: String,
    pub ts_ms: u64,
    pub msg_id: Option<String>,
    pub payload: Value,
}

impl StoredFrame {
    pub fn to_notification(&self, session: TetherSession) -> TetherFrameNotification {
        TetherFrameNotification {
            session,
            seq: self.seq,
            frame_type: self.frame_type.clone(),
            ts_ms: self.ts_ms,
            msg_id: self.msg_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

struct SessionLog {
    next_seq: u64,
    frames: std::collections::VecDeque<StoredFrame>,
    capacity: usize,
    notify: Arc<Notify>,
}

impl SessionLog {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            frames: std::collections::VecDeque::new(),
            capacity,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, frame_type: String, msg_id: Option<String>, payload: Value) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(StoredFrame {
            seq,
            frame_type,
            ts_ms: now_ms(),
            msg_id,
            payload,
        });
        self.notify.notify_waiters();
        seq
    }

    fn after(&self, after_seq: u64, limit: usize) -> (Vec<StoredFrame>, u64) {
        let frames: Vec<StoredFrame> = self
            .frames
            .iter()
            .filter(|f| f.seq > after_seq)
            .take(limit.max(1))
            .cloned()
            .collect();
        let next = frames.last().map(|f| f.seq).unwrap_or(after_seq);
        (frames, next)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    instance_id: String,
    channel: TetherChannelKey,
    session_id: String,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum TetherChannelKey {
    Host,
    Guest,
}

impl From<TetherChannel> for TetherChannelKey {
    fn from(c: TetherChannel) -> Self {
        match c {
            TetherChannel::Host => TetherChannelKey::Host,
            TetherChannel::Guest => TetherChannelKey::Guest,
        }
    }
}

pub struct PollResult {
    pub frames: Vec<StoredFrame>,
    pub next_seq: u64,
    pub timed_out: bool,
}

/// The host-wide Tether bus.
pub struct TetherBus {
    buffer_capacity: usize,
    sessions: Mutex<HashMap<Key, SessionLog>>,
}

impl TetherBus {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: if buffer_capacity == 0 {
                DEFAULT_BUFFER_CAPACITY
            } else {
                buffer_capacity
            },
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Append a frame, returning its assigned `seq`.
    pub async fn send(
        &self,
        instance_id: &str,
        channel: TetherChannel,
        session_id: &str,
        frame_type: String,
        msg_id: Option<String>,
        payload: Value,
    ) -> u64 {
        let key = Key {
            instance_id: instance_id.to_string(),
            channel: channel.into(),
            session_id: session_id.to_string(),
        };
        let mut sessions = self.sessions.lock().await;
        let log = sessions
            .entry(key)
            .or_insert_with(|| SessionLog::new(self.buffer_capacity));
        log.push(frame_type, msg_id, payload)
    }

    /// Long-poll for frames with `seq > after_seq`. Returns immediately if
    /// any already exist; otherwise waits up to `wait_ms` (capped at 30s)
    /// for new ones to arrive.
    pub async fn poll(
        &self,
        instance_id: &str,
        channel: TetherChannel,
        session_id: &str,
        after_seq: u64,
        limit: usize,
        wait_ms: u64,
    ) -> PollResult {
        let key = Key {
            instance_id: instance_id.to_string(),
            channel: channel.into(),
            session_id: session_id.to_string(),
        };
        let wait = Duration::from_millis(wait_ms.min(MAX_WAIT_MS));

        loop {
            let notify = {
                let mut sessions = self.sessions.lock().await;
                let log = sessions
                    .entry(key.clone())
                    .or_insert_with(|| SessionLog::new(self.buffer_capacity));
                let (frames, next_seq) = log.after(after_seq, limit);
                if !frames.is_empty() || wait.is_zero() {
                    return PollResult {
                        timed_out: frames.is_empty(),
                        frames,
                        next_seq,
                    };
                }
                log.notify.clone()
            };

            if tokio::time::timeout(wait, notify.notified()).await.is_err() {
                let sessions = self.sessions.lock().await;
                let (frames, next_seq) = sessions
                    .get(&key)
                    .map(|l| l.after(after_seq, limit))
                    .unwrap_or_default();
                return PollResult {
                    timed_out: frames.is_empty(),
                    frames,
                    next_seq,
                };
            }
            // Woken up: loop back around and re-check under the lock,
            // since another waiter may have already drained what woke us.
        }
    }
}
