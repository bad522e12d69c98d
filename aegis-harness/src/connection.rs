//! The host connection: dial-with-retry, the JSON-RPC dispatch loop, and
//! the primary/exec process bookkeeping that sits behind it.
//!
//! Mirrors the shape of the host's own mock harness
//! (`LocalProcessVmm::run_fake_harness`): one reader task decodes frames
//! off the socket, requests from the host are dispatched inline, and
//! outbound notifications/requests go through an unbounded channel to a
//! single writer task so the two directions never interleave badly on
//! the wire.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use aegis_protocol::{
    method, ExecDoneNotification, ExecParams, ExecResult, Frame, FrameReader, FrameWriter,
    HealthResult, LogNotification, LogStream, ProcessExitedNotification, RpcError, RpcId,
    RpcRequest, RpcResponse, RunParams, RunResult,
};

use crate::klog::{fatal, log};

const DIAL_RETRIES: u32 = 30;
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// State for the single primary process this harness may run at a time:
/// exactly one primary, with self-restart semantics.
struct PrimaryState {
    command: Vec<String>,
    env: HashMap<String, String>,
    workdir: Option<String>,
    pid: Option<u32>,
    self_restart: bool,
}

/// Shared handle passed to the Guest API server and the activity monitor.
/// Cloning is cheap; all state lives behind the inner `Arc`s.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<HashMap<RpcId, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>,
    next_id: Arc<AtomicI64>,
    primary: Arc<Mutex<PrimaryState>>,
    /// Every live primary or exec pid, so `shutdown` and transport teardown
    /// can kill them explicitly: on return, all tracked child processes
    /// must be killed. `std::process::exit` skips destructors, so
    /// `kill_on_drop` alone never fires for PID 1.
    children: Arc<std::sync::Mutex<std::collections::HashSet<u32>>>,
    started_at: std::time::Instant,
}

impl Connection {
    /// Dials `host_addr`, retrying up to [`DIAL_RETRIES`] times. Aborts the
    /// process if every attempt fails.
    pub async fn dial(host_addr: &str) -> Self {
        let mut last_err = None;
        for attempt in 0..DIAL_RETRIES {
            match TcpStream::connect(host_addr).await {
                Ok(stream) => return Self::start(stream),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < DIAL_RETRIES {
                        tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
                    }
                }
            }
        }
        fatal(&format!(
            "failed to dial host at {host_addr} after {DIAL_RETRIES} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ));
    }

    fn start(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(frame) = rx.recv().await {
                if writer.write_frame(&frame).await.is_err() {
                    break;
                }
            }
        });

        let conn = Connection {
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            primary: Arc::new(Mutex::new(PrimaryState {
                command: Vec::new(),
                env: HashMap::new(),
                workdir: None,
                pid: None,
                self_restart: false,
            })),
            children: Arc::new(std::sync::Mutex::new(std::collections::HashSet::new())),
            started_at: std::time::Instant::now(),
        };

        let reader_conn = conn.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(BufReader::new(read_half));
            loop {
                match reader.next_frame().await {
                    Ok(Some(frame)) => reader_conn.dispatch(frame).await,
                    _ => break,
                }
            }
            log("host connection closed, killing tracked children and exiting");
            reader_conn.kill_tracked_children();
            std::process::exit(0);
        });

        conn
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Request(req) if req.is_notification() => {
                // The host never sends notifications to the guest in the
                // current contract; tolerate unknown ones regardless.
                log(&format!("ignoring unexpected notification {}", req.method));
            }
            Frame::Request(req) => self.handle_host_request(req).await,
            Frame::Response(resp) => {
                if let Some(waiter) = self.pending.lock().await.remove(&resp.id) {
                    let result = match resp.error {
                        Some(e) => Err(e),
                        None => Ok(resp.result.unwrap_or(serde_json::Value::Null)),
                    };
                    let _ = waiter.send(result);
                }
            }
        }
    }

    async fn handle_host_request(&self, req: RpcRequest) {
        let id = req.id.clone();
        let response = match req.method.as_str() {
            m if m == method::RUN => self.handle_run(req.params).await,
            m if m == method::EXEC => self.handle_exec(req.params).await,
            m if m == method::HEALTH => self.handle_health().await,
            m if m == method::SHUTDOWN => {
                self.reply(id.clone(), Ok(json!({})));
                log("received shutdown, killing tracked children and exiting");
                self.kill_tracked_children();
                std::process::exit(0);
            }
            other => Err(RpcError::method_not_found(other)),
        };
        if let Some(id) = id {
            self.reply(Some(id), response);
        }
    }

    fn reply(&self, id: Option<RpcId>, result: Result<serde_json::Value, RpcError>) {
        let Some(id) = id else { return };
        let frame = match result {
            Ok(v) => Frame::Response(RpcResponse::ok(id, v)),
            Err(e) => Frame::Response(RpcResponse::err(id, e)),
        };
        let _ = self.tx.send(frame);
    }

    async fn handle_run(&self, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let params: RunParams = serde_json::from_value(params)
            .map_err(|e| RpcError::new(aegis_protocol::error_codes::INVALID_PARAMS, e.to_string()))?;

        {
            let mut primary = self.primary.lock().await;
            if primary.pid.is_some() {
                return Err(RpcError::execution("primary process already running"));
            }
            primary.command = params.command.clone();
            primary.env = params.env.clone();
            primary.workdir = params.workdir.clone();
        }

        // Port proxies start immediately before the primary process so an
        // app that binds loopback-only is reachable as soon as it comes up.
        if !params.expose_ports.is_empty() {
            if let Some(ip) = crate::env::lookup("AEGIS_NET_IP")
                .and_then(|cidr| cidr.split('/').next().and_then(|a| a.parse().ok()))
            {
                crate::portproxy::start_all(ip, &params.expose_ports);
            }
        }

        let pid = self.spawn_primary().await?;
        Ok(serde_json::to_value(RunResult { pid }).unwrap_or(json!({})))
    }

    /// Spawns the current primary command, wiring its exit to
    /// `processExited` and, if `self_restart` was set before it exits,
    /// immediately respawning before the notification goes out: decide
    /// self-restart, then emit, so a racing `health` call never observes a
    /// gap where the host believes the instance dead while a restart is
    /// actually in flight.
    async fn spawn_primary(&self) -> Result<u32, RpcError> {
        let (command, env, workdir) = {
            let primary = self.primary.lock().await;
            (primary.command.clone(), primary.env.clone(), primary.workdir.clone())
        };
        if command.is_empty() {
            return Err(RpcError::execution("no command configured"));
        }

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::execution(format!("failed to spawn primary: {e}")))?;
        let pid = child.id().unwrap_or(0);
        self.primary.lock().await.pid = Some(pid);
        self.children.lock().unwrap().insert(pid);

        stream_output(&mut child, LogStream::Stdout, None, self.tx.clone());
        stream_output(&mut child, LogStream::Stderr, None, self.tx.clone());

        let conn = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let code = status.and_then(|s| s.code()).unwrap_or(-1);
            conn.children.lock().unwrap().remove(&pid);

            let restart = {
                let mut primary = conn.primary.lock().await;
                primary.pid = None;
                std::mem::replace(&mut primary.self_restart, false)
            };

            if restart {
                log("self-restart requested, respawning primary instead of reporting exit");
                if conn.spawn_primary().await.is_err() {
                    log("self-restart failed to respawn primary");
                } else {
                    // Restart succeeded: no processExited, a fresh primary
                    // (and a fresh activity stream) is already live.
                    return;
                }
            }

            let note = RpcRequest::notification(
                method::PROCESS_EXITED,
                serde_json::to_value(ProcessExitedNotification { exit_code: code })
                    .unwrap_or(json!({})),
            );
            let _ = conn.tx.send(Frame::Request(note));
        });

        Ok(pid)
    }

    /// Flags the primary for a self-initiated restart the next time it
    /// exits. A no-op if there is no primary running yet.
    pub async fn request_self_restart(&self) -> bool {
        let mut primary = self.primary.lock().await;
        if primary.pid.is_some() {
            primary.self_restart = true;
            true
        } else {
            false
        }
    }

    async fn handle_exec(&self, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let params: ExecParams = serde_json::from_value(params)
            .map_err(|e| RpcError::new(aegis_protocol::error_codes::INVALID_PARAMS, e.to_string()))?;

        let mut cmd = Command::new(params.command.first().cloned().unwrap_or_default());
        if params.command.len() > 1 {
            cmd.args(&params.command[1..]);
        }
        cmd.envs(&params.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::execution(format!("failed to spawn exec: {e}")))?;
        let started_at_ms = crate::now_ms();
        let exec_id = params.exec_id.clone();
        let pid = child.id().unwrap_or(0);
        self.children.lock().unwrap().insert(pid);

        stream_output(&mut child, LogStream::Stdout, Some(exec_id.clone()), self.tx.clone());
        stream_output(&mut child, LogStream::Stderr, Some(exec_id.clone()), self.tx.clone());

        let tx = self.tx.clone();
        let children = self.children.clone();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let code = status.and_then(|s| s.code()).unwrap_or(-1);
            children.lock().unwrap().remove(&pid);
            let note = RpcRequest::notification(
                method::EXEC_DONE,
                serde_json::to_value(ExecDoneNotification { exec_id, exit_code: code })
                    .unwrap_or(json!({})),
            );
            let _ = tx.send(Frame::Request(note));
        });

        Ok(serde_json::to_value(ExecResult {
            exec_id: params.exec_id,
            started_at_ms,
        })
        .unwrap_or(json!({})))
    }

    async fn handle_health(&self) -> Result<serde_json::Value, RpcError> {
        let primary_running = self.primary.lock().await.pid.is_some();
        Ok(serde_json::to_value(HealthResult {
            primary_running,
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
        .unwrap_or(json!({})))
    }

    /// Sends a `guest.*` request to the host and awaits the response.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let id = RpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), done_tx);

        let req = RpcRequest::request(id.clone(), method, params);
        if self.tx.send(Frame::Request(req)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::execution("host connection closed"));
        }

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::execution("host connection closed before reply")),
        }
    }

    /// Sends a fire-and-forget notification to the host.
    pub fn notify(&self, method: &str, params: serde_json::Value) {
        let _ = self
            .tx
            .send(Frame::Request(RpcRequest::notification(method, params)));
    }

    pub async fn primary_pid(&self) -> Option<u32> {
        self.primary.lock().await.pid
    }

    /// Sends `SIGTERM` to the primary process, if one is running. Used by
    /// `POST /v1/self/restart`: the harness doesn't kill-and-respawn
    /// itself directly, it asks the process to exit and lets the normal
    /// exit handler in [`Self::spawn_primary`] perform the restart.
    #[cfg(target_os = "linux")]
    pub async fn terminate_primary(&self) {
        if let Some(pid) = self.primary.lock().await.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn terminate_primary(&self) {
        log("terminate_primary is unsupported on this platform");
    }

    /// Sends `SIGKILL` to every tracked primary/exec pid. Called right
    /// before this process exits (`shutdown` or host disconnect) since
    /// `std::process::exit` skips destructors and `kill_on_drop` would
    /// otherwise never run, leaving children as orphans under the new PID 1.
    #[cfg(target_os = "linux")]
    fn kill_tracked_children(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        for pid in self.children.lock().unwrap().drain() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn kill_tracked_children(&self) {
        self.children.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_protocol::RpcId;
    use tokio::net::TcpListener;

    /// Minimal host-side stand-in: accepts one guest connection and gives
    /// the test a request/response handle on it.
    async fn accept_one() -> (
        FrameReader<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
        Connection,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Connection::dial(&addr.to_string()).await;
        let (guest_stream, _) = listener.accept().await.unwrap();
        let (r, w) = guest_stream.into_split();
        (FrameReader::new(BufReader::new(r)), FrameWriter::new(w), conn)
    }

    async fn send_run(
        writer: &mut FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
        id: i64,
        command: Vec<&str>,
    ) {
        let req = RpcRequest::request(
            RpcId::Number(id),
            method::RUN,
            serde_json::to_value(RunParams {
                command: command.into_iter().map(String::from).collect(),
                env: HashMap::new(),
                workdir: None,
                expose_ports: Vec::new(),
            })
            .unwrap(),
        );
        writer.write_frame(&Frame::Request(req)).await.unwrap();
    }

    async fn next_notification(
        reader: &mut FrameReader<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    ) -> RpcRequest {
        loop {
            match reader.next_frame().await.unwrap().unwrap() {
                Frame::Request(req) if req.is_notification() => return req,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn exit_without_self_restart_emits_process_exited() {
        let (mut reader, mut writer, _conn) = accept_one().await;
        send_run(&mut writer, 1, vec!["sh", "-c", "exit 7"]).await;

        // Drain the `run` response, then the exit notification.
        loop {
            match reader.next_frame().await.unwrap().unwrap() {
                Frame::Response(_) => break,
                _ => continue,
            }
        }
        let note = next_notification(&mut reader).await;
        assert_eq!(note.method, method::PROCESS_EXITED);
        let payload: ProcessExitedNotification = serde_json::from_value(note.params).unwrap();
        assert_eq!(payload.exit_code, 7);
    }

    #[tokio::test]
    async fn self_restart_suppresses_process_exited_and_respawns() {
        let (mut reader, mut writer, conn) = accept_one().await;
        send_run(&mut writer, 1, vec!["sh", "-c", "sleep 0.3"]).await;

        loop {
            match reader.next_frame().await.unwrap().unwrap() {
                Frame::Response(_) => break,
                _ => continue,
            }
        }

        let first_pid = conn.primary_pid().await;
        assert!(first_pid.is_some());
        assert!(conn.request_self_restart().await);

        // Wait past the first primary's natural exit; the respawned
        // primary should now be alive under a fresh pid, and no
        // `processExited` notification should ever arrive for the exit
        // that triggered the restart.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let second_pid = conn.primary_pid().await;
        assert!(second_pid.is_some());
        assert_ne!(first_pid, second_pid);

        // A second `run` must be rejected: exactly one primary process
        // is allowed to be alive at a time, and the respawned one counts.
        send_run(&mut writer, 2, vec!["sh", "-c", "true"]).await;
        let resp = loop {
            match reader.next_frame().await.unwrap().unwrap() {
                Frame::Response(r) => break r,
                _ => continue,
            }
        };
        assert!(resp.error.is_some());
    }
}

fn stream_output(
    child: &mut Child,
    stream: LogStream,
    exec_id: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
) {
    let reader: Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>> = match stream {
        LogStream::Stdout => child.stdout.take().map(|s| Box::new(s) as _),
        LogStream::Stderr => child.stderr.take().map(|s| Box::new(s) as _),
    };
    let Some(reader) = reader else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let note = RpcRequest::notification(
                method::LOG,
                serde_json::to_value(LogNotification {
                    stream,
                    line,
                    exec_id: exec_id.clone(),
                })
                .unwrap_or(json!({})),
            );
            if tx.send(Frame::Request(note)).is_err() {
                break;
            }
        }
    });
}
