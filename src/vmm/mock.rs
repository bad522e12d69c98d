//! `LocalProcessVmm`: a [`VmmDriver`] test double that runs the "guest"
//! command directly on the test host instead of inside a real microVM.
//!
//! Rather than faking responses in-process, it speaks the real
//! `aegis-protocol` wire format over a real loopback TCP connection, so
//! the Lifecycle Manager, Transport, and idle policy are exercised
//! end-to-end in tests without a hypervisor. "Guest ports" are simply
//! ports the command binds on `127.0.0.1` of the test host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use aegis_protocol::{
    method, ExecDoneNotification, ExecParams, ExecResult, Frame, FrameReader, FrameWriter,
    HealthResult, LogNotification, LogStream, ProcessExitedNotification, RpcError, RpcRequest,
    RpcResponse, RunParams, RunResult,
};

use crate::error::{Error, Result};
use crate::instance::now_ms;
use crate::vmm::{VmHandle, VmSpec, VmmCapabilities, VmmDriver};

pub struct LocalProcessVmm;

impl LocalProcessVmm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalProcessVmm {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LocalVmHandle {
    host_transport_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    driver_task: Mutex<Option<JoinHandle<()>>>,
}

impl VmHandle for LocalVmHandle {
    fn forwarding_endpoint(&self, guest_port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], guest_port))
    }

    fn host_transport_addr(&self) -> SocketAddr {
        self.host_transport_addr
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl VmmDriver for LocalProcessVmm {
    fn capabilities(&self) -> VmmCapabilities {
        VmmCapabilities {
            supports_pause: true,
        }
    }

    async fn start(&self, spec: VmSpec) -> Result<Box<dyn VmHandle>> {
        let host_addr: SocketAddr = spec
            .kernel_args
            .get("AEGIS_HOST_ADDR")
            .ok_or_else(|| Error::Vmm("VmSpec missing AEGIS_HOST_ADDR".into()))?
            .parse()
            .map_err(|e| Error::Vmm(format!("invalid AEGIS_HOST_ADDR: {e}")))?;

        let stream = TcpStream::connect(host_addr)
            .await
            .map_err(|e| Error::Transport(format!("mock harness failed to dial host: {e}")))?;

        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_task = stopped.clone();
        let driver_task = tokio::spawn(async move {
            let _ = run_fake_harness(stream, stopped_task).await;
        });

        Ok(Box::new(LocalVmHandle {
            host_transport_addr: host_addr,
            stopped,
            driver_task: Mutex::new(Some(driver_task)),
        }))
    }

    async fn pause(&self, _handle: &dyn VmHandle) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _handle: &dyn VmHandle) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, handle: &dyn VmHandle) -> Result<()> {
        let handle = handle
            .as_any()
            .downcast_ref::<LocalVmHandle>()
            .ok_or_else(|| Error::Vmm("stop called on a handle from a different VMM".into()))?;
        handle.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = handle.driver_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Stands in for `aegis-harness`'s RPC dispatch loop: handles `run` and
/// `exec`, streams output as `log` notifications, and emits
/// `processExited`/`execDone`.
async fn run_fake_harness(stream: TcpStream, stopped: Arc<AtomicBool>) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(BufReader::new(read_half));
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half);
        while let Some(frame) = rx.recv().await {
            if writer.write_frame(&frame).await.is_err() {
                break;
            }
        }
    });

    let started_at = now_ms();

    while !stopped.load(Ordering::SeqCst) {
        let frame = match reader.next_frame().await {
            Ok(Some(f)) => f,
            _ => break,
        };
        let Frame::Request(req) = frame else { continue };

        match req.method.as_str() {
            m if m == method::RUN => {
                if let Ok(params) = serde_json::from_value::<RunParams>(req.params.clone()) {
                    spawn_tracked(
                        params.command,
                        params.env,
                        None,
                        tx.clone(),
                        req.id.clone(),
                        None,
                    );
                }
            }
            m if m == method::EXEC => {
                if let Ok(params) = serde_json::from_value::<ExecParams>(req.params.clone()) {
                    spawn_tracked(
                        params.command,
                        params.env,
                        None,
                        tx.clone(),
                        req.id.clone(),
                        Some(params.exec_id),
                    );
                }
            }
            m if m == method::HEALTH => {
                if let Some(id) = req.id.clone() {
                    let result = HealthResult {
                        primary_running: true,
                        uptime_secs: (now_ms().saturating_sub(started_at)) / 1000,
                    };
                    let _ = tx.send(Frame::Response(RpcResponse::ok(
                        id,
                        serde_json::to_value(result).unwrap_or(json!({})),
                    )));
                }
            }
            m if m == method::SHUTDOWN => {
                if let Some(id) = req.id.clone() {
                    let _ = tx.send(Frame::Response(RpcResponse::ok(id, json!({}))));
                }
                break;
            }
            other => {
                if let Some(id) = req.id.clone() {
                    let _ = tx.send(Frame::Response(RpcResponse::err(
                        id,
                        RpcError::method_not_found(other),
                    )));
                }
            }
        }
    }

    drop(tx);
    let _ = writer_task.await;
    Ok(())
}

fn spawn_tracked(
    command: Vec<String>,
    env: HashMap<String, String>,
    workdir: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
    req_id: Option<aegis_protocol::RpcId>,
    exec_id: Option<String>,
) {
    tokio::spawn(async move {
        if command.is_empty() {
            return;
        }
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                if let (Some(id), Some(exec_id)) = (req_id.clone(), exec_id.clone()) {
                    let _ = tx.send(Frame::Response(RpcResponse::err(
                        id,
                        RpcError::execution(format!("failed to spawn: {e}")),
                    )));
                    let _ = exec_id;
                }
                return;
            }
        };

        if let Some(id) = req_id.clone() {
            let result = match &exec_id {
                Some(eid) => serde_json::to_value(ExecResult {
                    exec_id: eid.clone(),
                    started_at_ms: now_ms(),
                })
                .unwrap_or(json!({})),
                None => serde_json::to_value(RunResult {
                    pid: child.id().unwrap_or(0),
                })
                .unwrap_or(json!({})),
            };
            let _ = tx.send(Frame::Response(RpcResponse::ok(id, result)));
        }

        stream_output(&mut child, LogStream::Stdout, exec_id.clone(), tx.clone());
        stream_output(&mut child, LogStream::Stderr, exec_id.clone(), tx.clone());

        let status = child.wait().await.ok();
        let code = status.and_then(|s| s.code()).unwrap_or(-1);

        let note = match &exec_id {
            Some(eid) => RpcRequest::notification(
                method::EXEC_DONE,
                serde_json::to_value(ExecDoneNotification {
                    exec_id: eid.clone(),
                    exit_code: code,
                })
                .unwrap_or(json!({})),
            ),
            None => RpcRequest::notification(
                method::PROCESS_EXITED,
                serde_json::to_value(ProcessExitedNotification { exit_code: code })
                    .unwrap_or(json!({})),
            ),
        };
        let _ = tx.send(Frame::Request(note));
    });
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
