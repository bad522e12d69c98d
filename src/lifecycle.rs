//! Lifecycle Manager: the host's orchestration core.
//!
//! Owns the Instance table, drives VM boot through the [`VmmDriver`],
//! dispatches the JSON-RPC [`Transport`] for each running instance,
//! reconciles `guest.spawn` requests against capability policy, and runs
//! the idle-policy background loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use aegis_protocol::{
    method, ExecDoneNotification, ExecParams, GuestChildDescriptor, GuestExposePortParams,
    GuestListChildrenResult, GuestSelfInfoResult, GuestSpawnParams, GuestSpawnResult,
    GuestStopChildParams, GuestUnexposePortParams, KeepaliveNotification, LogNotification,
    ProcessExitedNotification, RunParams, TetherChannel, TetherFrameNotification,
};

use crate::error::{Error, Result};
use crate::instance::{now_ms, Capabilities, Instance, InstanceSpec, InstanceState};
use crate::logstore::{LogStore, Source, Stream as LogStream2};
use crate::observe::{ActivityIngest, Observer};
use crate::portalloc::PortAllocator;
use crate::secrets::{NoopSecretResolver, SecretResolver};
use crate::tether::TetherBus;
use crate::transport::{Inbound, Transport};
use crate::vmm::{VmSpec, VmmDriver};

struct KeepaliveLease {
    #[allow(dead_code)]
    reason: String,
    expires_at_ms: u64,
}

struct ExecWaiter {
    done_tx: oneshot::Sender<i32>,
}

/// Everything the Lifecycle Manager keeps in memory for a live instance,
/// beyond the [`Instance`] record itself.
struct Connection {
    transport: Arc<Transport>,
    vm_handle: Box<dyn crate::vmm::VmHandle>,
}

pub struct LifecycleManager {
    vmm: Arc<dyn VmmDriver>,
    instances: Mutex<HashMap<String, Instance>>,
    connections: Mutex<HashMap<String, Connection>>,
    leases: Mutex<HashMap<String, Vec<KeepaliveLease>>>,
    exec_waiters: Mutex<HashMap<String, ExecWaiter>>,
    logs: Arc<LogStore>,
    tether: Arc<TetherBus>,
    ports: Arc<PortAllocator>,
    observer: Option<Arc<Observer>>,
    activity: Option<ActivityIngest>,
    secret_resolver: Arc<dyn SecretResolver>,
    boot_timeout: Duration,
    exec_timeout: Duration,
}

/// Everything returned to a caller of [`LifecycleManager::exec`].
pub struct ExecHandle {
    pub exec_id: String,
    pub started_at_ms: u64,
    pub done_rx: oneshot::Receiver<i32>,
}

impl LifecycleManager {
    pub fn new(
        vmm: Arc<dyn VmmDriver>,
        logs: Arc<LogStore>,
        tether: Arc<TetherBus>,
        ports: Arc<PortAllocator>,
        boot_timeout: Duration,
        exec_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            vmm,
            instances: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            exec_waiters: Mutex::new(HashMap::new()),
            logs,
            tether,
            ports,
            observer: None,
            activity: None,
            secret_resolver: Arc::new(NoopSecretResolver),
            boot_timeout,
            exec_timeout,
        })
    }

    pub fn with_observer(mut self: Arc<Self>, observer: Arc<Observer>) -> Arc<Self> {
        let activity = ActivityIngest::new(observer.metrics().clone());
        let inner = Arc::get_mut(&mut self).expect("observer must be attached before sharing");
        inner.observer = Some(observer);
        inner.activity = Some(activity);
        self
    }

    /// Attach a real secret store. Without this, instances with `secrets`
    /// set still boot; nothing gets injected (see [`NoopSecretResolver`]).
    pub fn with_secret_resolver(mut self: Arc<Self>, resolver: Arc<dyn SecretResolver>) -> Arc<Self> {
        let inner = Arc::get_mut(&mut self).expect("secret resolver must be attached before sharing");
        inner.secret_resolver = resolver;
        self
    }

    // -----------------------------------------------------------------
    // create / lookup
    // -----------------------------------------------------------------

    pub async fn create(&self, spec: InstanceSpec) -> Result<String> {
        if let Some(handle) = &spec.handle {
            let instances = self.instances.lock().await;
            if instances.values().any(|i| i.handle.as_deref() == Some(handle.as_str())) {
                return Err(Error::Conflict(format!("handle {handle} already in use")));
            }
        }
        if spec.command.is_empty() {
            return Err(Error::InvalidRequest("command must not be empty".into()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let instance = Instance::new(id.clone(), spec, None);
        self.instances.lock().await.insert(id.clone(), instance);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Instance> {
        self.instances
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.instances.lock().await.values().cloned().collect()
    }

    /// The Log Store backing this manager, for API layers that need to
    /// subscribe to an instance's stdout/stderr directly (e.g. the
    /// `/v1/instances/{id}/logs` route).
    pub fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }

    // -----------------------------------------------------------------
    // ensure: boot sequence
    // -----------------------------------------------------------------

    /// Ensure `id` is `running`: idempotent, boots the VM if necessary.
    pub async fn ensure(self: &Arc<Self>, id: &str) -> Result<()> {
        {
            let instances = self.instances.lock().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
            if instance.state == InstanceState::Running {
                return Ok(());
            }
            if instance.state == InstanceState::Disabled {
                return Err(Error::Conflict(format!("instance {id} is disabled")));
            }
        }

        if self.wake_if_paused(id).await? {
            return Ok(());
        }

        let span = self
            .observer
            .as_ref()
            .map(|o| o.start_instance_span("ensure", id));

        let result = self.boot(id).await;
        if let Some(span) = span {
            match &result {
                Ok(()) => span.set_ok(),
                Err(e) => span.set_error(&e.to_string()),
            }
        }
        result
    }

    async fn wake_if_paused(self: &Arc<Self>, id: &str) -> Result<bool> {
        let was_paused = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
            if instance.state == InstanceState::Paused {
                instance.state = InstanceState::Running;
                instance.touch();
                true
            } else {
                false
            }
        };
        if was_paused {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(id) {
                self.vmm.resume(conn.vm_handle.as_ref()).await?;
            }
        }
        Ok(was_paused)
    }

    async fn boot(self: &Arc<Self>, id: &str) -> Result<()> {
        {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
            instance.state = InstanceState::Starting;
        }

        let (host_addr, listener) = Transport::bind_ephemeral().await?;

        let spec_snapshot = self.get(id).await?;
        let mut kernel_args = HashMap::new();
        kernel_args.insert("AEGIS_HOST_ADDR".to_string(), host_addr.to_string());
        kernel_args.insert("AEGIS_INSTANCE_ID".to_string(), id.to_string());
        if spec_snapshot.workspace.is_some() {
            kernel_args.insert("AEGIS_WORKSPACE".to_string(), "1".to_string());
        }

        let vm_spec = VmSpec {
            instance_id: id.to_string(),
            memory_mb: spec_snapshot.memory_mb,
            vcpus: spec_snapshot.vcpus,
            rootfs_path: spec_snapshot.image_ref.clone(),
            workspace_path: spec_snapshot.workspace.clone(),
            kernel_args,
        };

        let vm_handle = match self.vmm.start(vm_spec).await {
            Ok(h) => h,
            Err(e) => {
                self.mark_stopped(id).await;
                return Err(e);
            }
        };

        let stream = match Transport::accept(listener, self.boot_timeout).await {
            Ok(s) => s,
            Err(e) => {
                let _ = self.vmm.stop(vm_handle.as_ref()).await;
                self.mark_stopped(id).await;
                return Err(e);
            }
        };

        let (transport, inbound) = Transport::spawn(stream);

        self.connections.lock().await.insert(
            id.to_string(),
            Connection {
                transport: transport.clone(),
                vm_handle,
            },
        );

        let manager = self.clone();
        let instance_id = id.to_string();
        tokio::spawn(async move {
            manager.dispatch_inbound(instance_id, inbound).await;
        });

        let mut env = spec_snapshot.env.clone();
        if !spec_snapshot.secrets.is_empty() {
            use secrecy::ExposeSecret;
            let resolved = self.secret_resolver.resolve(&spec_snapshot.secrets).await?;
            for (k, v) in resolved {
                env.entry(k).or_insert_with(|| v.expose_secret().to_string());
            }
        }

        let run_params = RunParams {
            command: spec_snapshot.command.clone(),
            env,
            workdir: spec_snapshot.workspace.clone(),
            expose_ports: spec_snapshot.expose_ports.iter().copied().collect(),
        };
        let run_result = transport
            .call_with_timeout(method::RUN, serde_json::to_value(run_params)?, self.boot_timeout)
            .await;

        if let Err(e) = run_result {
            self.teardown(id).await;
            return Err(e);
        }

        self.open_exposed_ports(id).await?;

        {
            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(id) {
                instance.state = InstanceState::Running;
                instance.touch();
            }
        }

        Ok(())
    }

    async fn open_exposed_ports(self: &Arc<Self>, id: &str) -> Result<()> {
        let ports: Vec<u16> = {
            let instances = self.instances.lock().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
            instance.expose_ports.iter().copied().collect()
        };

        let hook = self.activity_hook();

        let mut endpoints = HashMap::new();
        for guest_port in ports {
            let connections = self.connections.lock().await;
            let conn = connections
                .get(id)
                .ok_or_else(|| Error::Transport("no live connection".into()))?;
            let endpoint = conn.vm_handle.forwarding_endpoint(guest_port);
            drop(connections);
            let host_port = self
                .ports
                .expose(id, guest_port, None, endpoint, hook.clone())
                .await?;
            endpoints.insert(guest_port, host_port);
        }

        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.endpoints = endpoints;
        }
        Ok(())
    }

    /// A [`crate::portalloc::ConnectHook`] that marks an instance active on
    /// every accepted proxied connection. Runs outside the accept loop's own
    /// task so a slow lock acquisition never delays splicing.
    fn activity_hook(self: &Arc<Self>) -> crate::portalloc::ConnectHook {
        let manager = self.clone();
        Arc::new(move |instance_id: &str| {
            let manager = manager.clone();
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                let mut instances = manager.instances.lock().await;
                if let Some(instance) = instances.get_mut(&instance_id) {
                    instance.touch();
                }
            });
        })
    }

    async fn mark_stopped(&self, id: &str) {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Stopped;
        }
    }

    async fn teardown(&self, id: &str) {
        self.ports.unexpose_all(id).await;
        if let Some(conn) = self.connections.lock().await.remove(id) {
            let _ = self.vmm.stop(conn.vm_handle.as_ref()).await;
        }
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Stopped;
            instance.endpoints.clear();
        }
    }

    // -----------------------------------------------------------------
    // exec
    // -----------------------------------------------------------------

    pub async fn exec(
        self: &Arc<Self>,
        id: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
    ) -> Result<ExecHandle> {
        self.ensure(id).await?;

        let transport = {
            let connections = self.connections.lock().await;
            connections
                .get(id)
                .ok_or_else(|| Error::Transport("instance has no live connection".into()))?
                .transport
                .clone()
        };

        let exec_id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        self.exec_waiters
            .lock()
            .await
            .insert(exec_id.clone(), ExecWaiter { done_tx });

        let params = ExecParams {
            exec_id: exec_id.clone(),
            command,
            env,
            workdir: None,
        };
        let result = transport
            .call_with_timeout(method::EXEC, serde_json::to_value(params)?, self.exec_timeout)
            .await;

        if let Err(e) = result {
            self.exec_waiters.lock().await.remove(&exec_id);
            return Err(e);
        }

        Ok(ExecHandle {
            exec_id,
            started_at_ms: now_ms(),
            done_rx,
        })
    }

    // -----------------------------------------------------------------
    // pause / stop / disable / delete
    // -----------------------------------------------------------------

    pub async fn pause(&self, id: &str) -> Result<()> {
        let connections = self.connections.lock().await;
        let conn = connections
            .get(id)
            .ok_or_else(|| Error::Conflict(format!("instance {id} is not running")))?;
        if !self.vmm.capabilities().supports_pause {
            return Err(Error::Vmm("VMM driver does not support pause".into()));
        }
        self.vmm.pause(conn.vm_handle.as_ref()).await?;
        drop(connections);

        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Paused;
        }
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.get(id).await?;
        self.teardown(id).await;
        Ok(())
    }

    pub async fn disable(&self, id: &str) -> Result<()> {
        let instance = self.get(id).await?;
        if instance.state != InstanceState::Disabled {
            self.teardown(id).await;
        }
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Disabled;
        }
        // Disabling an instance preserves its log ring; only delete clears it.
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let children = {
            let instances = self.instances.lock().await;
            instances
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("instance {id}")))?
                .children
                .iter()
                .cloned()
                .collect::<Vec<_>>()
        };
        for child in children {
            Box::pin(self.delete(&child)).await.ok();
        }
        self.teardown(id).await;
        self.instances.lock().await.remove(id);
        self.logs.clear(id);
        Ok(())
    }

    /// Closes the host listener for `guest_port` on `id`, the API-surface
    /// counterpart of the `guest.unexpose_port` RPC handled in
    /// [`Self::handle_guest_request`]. Idempotent: unexposing a port that
    /// isn't currently exposed is not an error.
    pub async fn unexpose(&self, id: &str, guest_port: u16) -> Result<()> {
        self.get(id).await?;
        self.ports.unexpose(id, guest_port).await;
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.expose_ports.remove(&guest_port);
            instance.endpoints.remove(&guest_port);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tether
    // -----------------------------------------------------------------

    pub async fn send_tether(
        self: &Arc<Self>,
        id: &str,
        session_id: &str,
        frame_type: String,
        msg_id: Option<String>,
        payload: Value,
    ) -> Result<u64> {
        self.ensure(id).await?;
        let seq = self
            .tether
            .send(id, TetherChannel::Host, session_id, frame_type.clone(), msg_id.clone(), payload.clone())
            .await;

        if let Some(transport) = self.connections.lock().await.get(id).map(|c| c.transport.clone()) {
            let note = TetherFrameNotification {
                session: aegis_protocol::TetherSession {
                    channel: TetherChannel::Host,
                    id: session_id.to_string(),
                },
                seq,
                frame_type,
                ts_ms: now_ms(),
                msg_id,
                payload,
            };
            let _ = transport.notify(method::TETHER_FRAME, serde_json::to_value(note)?);
        }

        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.touch();
        }
        Ok(seq)
    }

    pub async fn poll_tether(
        &self,
        id: &str,
        channel: TetherChannel,
        session_id: &str,
        after_seq: u64,
        limit: usize,
        wait_ms: u64,
    ) -> crate::tether::PollResult {
        self.tether
            .poll(id, channel, session_id, after_seq, limit, wait_ms)
            .await
    }

    // -----------------------------------------------------------------
    // Inbound dispatch: guest->host requests and notifications
    // -----------------------------------------------------------------

    async fn dispatch_inbound(
        self: Arc<Self>,
        instance_id: String,
        mut inbound: tokio::sync::mpsc::UnboundedReceiver<Inbound>,
    ) {
        while let Some(msg) = inbound.recv().await {
            match msg {
                Inbound::Notification { method, params } => {
                    self.handle_notification(&instance_id, &method, params).await;
                }
                Inbound::Request {
                    method,
                    params,
                    responder,
                } => {
                    let result = self.handle_guest_request(&instance_id, &method, params).await;
                    let _ = responder.send(
                        result.map_err(|e| aegis_protocol::RpcError::new(e.rpc_code(), e.to_string())),
                    );
                }
            }
        }
        // Reader task ended: the transport died. Reflect that in state.
        self.mark_stopped(&instance_id).await;
    }

    async fn handle_notification(&self, instance_id: &str, method: &str, params: Value) {
        match method {
            m if m == aegis_protocol::method::LOG => {
                if let Ok(note) = serde_json::from_value::<LogNotification>(params) {
                    let stream = match note.stream {
                        aegis_protocol::LogStream::Stdout => LogStream2::Stdout,
                        aegis_protocol::LogStream::Stderr => LogStream2::Stderr,
                    };
                    let source = if note.exec_id.is_some() {
                        Source::Exec
                    } else {
                        Source::Primary
                    };
                    self.logs
                        .append(instance_id, note.exec_id, stream, source, note.line);
                }
            }
            m if m == aegis_protocol::method::EXEC_DONE => {
                if let Ok(note) = serde_json::from_value::<ExecDoneNotification>(params) {
                    if let Some(waiter) = self.exec_waiters.lock().await.remove(&note.exec_id) {
                        let _ = waiter.done_tx.send(note.exit_code);
                    }
                }
            }
            m if m == aegis_protocol::method::PROCESS_EXITED => {
                if let Ok(_note) = serde_json::from_value::<ProcessExitedNotification>(params) {
                    self.teardown(instance_id).await;
                }
            }
            m if m == aegis_protocol::method::ACTIVITY => {
                if let Ok(sample) = serde_json::from_value::<aegis_protocol::ActivityNotification>(params) {
                    if let Some(activity) = &self.activity {
                        activity.record(instance_id, &sample);
                    }
                    let mut instances = self.instances.lock().await;
                    if let Some(instance) = instances.get_mut(instance_id) {
                        instance.active_connections = sample.conns;
                        instance.touch();
                    }
                }
            }
            m if m == aegis_protocol::method::KEEPALIVE => {
                if let Ok(note) = serde_json::from_value::<KeepaliveNotification>(params) {
                    let expires_at_ms = now_ms() + note.ttl_secs * 1000;
                    self.leases
                        .lock()
                        .await
                        .entry(instance_id.to_string())
                        .or_default()
                        .push(KeepaliveLease {
                            reason: note.reason,
                            expires_at_ms,
                        });
                }
            }
            m if m == aegis_protocol::method::KEEPALIVE_RELEASE => {
                self.leases.lock().await.remove(instance_id);
            }
            m if m == aegis_protocol::method::TETHER_FRAME => {
                if let Ok(note) = serde_json::from_value::<TetherFrameNotification>(params) {
                    self.tether
                        .send(
                            instance_id,
                            TetherChannel::Guest,
                            &note.session.id,
                            note.frame_type,
                            note.msg_id,
                            note.payload,
                        )
                        .await;
                }
            }
            _ => {
                // Unknown notifications are tolerated and simply ignored.
            }
        }
    }

    async fn handle_guest_request(
        self: &Arc<Self>,
        caller_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        match method {
            m if m == aegis_protocol::method::GUEST_SPAWN => {
                let req: GuestSpawnParams = serde_json::from_value(params)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                let child_id = self.reconcile_spawn(caller_id, req).await?;
                let child = self.get(&child_id).await?;
                Ok(serde_json::to_value(GuestSpawnResult {
                    id: child_id,
                    spawn_depth: child.capabilities.spawn_depth,
                })?)
            }
            m if m == aegis_protocol::method::GUEST_LIST_CHILDREN => {
                let parent = self.get(caller_id).await?;
                let mut children = Vec::new();
                for child_id in &parent.children {
                    if let Ok(child) = self.get(child_id).await {
                        children.push(GuestChildDescriptor {
                            id: child.id,
                            state: format!("{:?}", child.state).to_lowercase(),
                        });
                    }
                }
                Ok(serde_json::to_value(GuestListChildrenResult { children })?)
            }
            m if m == aegis_protocol::method::GUEST_STOP_CHILD => {
                let req: GuestStopChildParams = serde_json::from_value(params)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                let parent = self.get(caller_id).await?;
                if !parent.children.contains(&req.id) {
                    return Err(Error::NotFound(format!("no such child {}", req.id)));
                }
                self.stop(&req.id).await?;
                Ok(json!({}))
            }
            m if m == aegis_protocol::method::GUEST_SELF_INFO => {
                let instance = self.get(caller_id).await?;
                Ok(serde_json::to_value(GuestSelfInfoResult {
                    id: instance.id,
                    state: format!("{:?}", instance.state).to_lowercase(),
                    spawn_depth: instance.capabilities.spawn_depth,
                    endpoints: instance.endpoints,
                })?)
            }
            m if m == aegis_protocol::method::GUEST_EXPOSE_PORT => {
                let req: GuestExposePortParams = serde_json::from_value(params)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                let forward_to = {
                    let connections = self.connections.lock().await;
                    let conn = connections
                        .get(caller_id)
                        .ok_or_else(|| Error::Transport("no live connection".into()))?;
                    conn.vm_handle.forwarding_endpoint(req.guest_port)
                };
                let host_port = self
                    .ports
                    .expose(caller_id, req.guest_port, None, forward_to, self.activity_hook())
                    .await?;
                let mut instances = self.instances.lock().await;
                if let Some(instance) = instances.get_mut(caller_id) {
                    instance.expose_ports.insert(req.guest_port);
                    instance.endpoints.insert(req.guest_port, host_port);
                }
                Ok(serde_json::to_value(aegis_protocol::GuestExposePortResult {
                    guest_port: req.guest_port,
                    host_port,
                })?)
            }
            m if m == aegis_protocol::method::GUEST_UNEXPOSE_PORT => {
                let req: GuestUnexposePortParams = serde_json::from_value(params)
                    .map_err(|e| Error::InvalidRequest(e.to_string()))?;
                self.ports.unexpose(caller_id, req.guest_port).await;
                let mut instances = self.instances.lock().await;
                if let Some(instance) = instances.get_mut(caller_id) {
                    instance.expose_ports.remove(&req.guest_port);
                    instance.endpoints.remove(&req.guest_port);
                }
                Ok(json!({}))
            }
            other => Err(Error::InvalidRequest(format!("unknown guest method {other}"))),
        }
    }

    async fn reconcile_spawn(
        self: &Arc<Self>,
        parent_id: &str,
        req: GuestSpawnParams,
    ) -> Result<String> {
        let (parent_caps, children_count) = {
            let instances = self.instances.lock().await;
            let parent = instances
                .get(parent_id)
                .ok_or_else(|| Error::NotFound(format!("instance {parent_id}")))?;
            (parent.capabilities.clone(), parent.children.len() as u32)
        };

        let memory_mb = req.memory_mb.unwrap_or(512);
        let vcpus = req.vcpus.unwrap_or(1);
        let image = req.image.clone().unwrap_or_default();
        let expose_ports = req.expose_ports.len() as u32;

        let child_caps: Capabilities = parent_caps.check_spawn(
            children_count,
            &image,
            memory_mb,
            vcpus,
            expose_ports,
        )?;

        let child_spec = InstanceSpec {
            handle: None,
            command: req.command,
            workspace: None,
            image_ref: req.image,
            env: req.env,
            secrets: Vec::new(),
            memory_mb,
            vcpus,
            capabilities: child_caps,
            expose_ports: req.expose_ports,
            app_id: None,
            release_id: None,
        };

        let child_id = self.create(child_spec).await?;
        {
            let mut instances = self.instances.lock().await;
            if let Some(instance) = instances.get_mut(&child_id) {
                instance.parent_id = Some(parent_id.to_string());
            }
            if let Some(parent) = instances.get_mut(parent_id) {
                parent.children.insert(child_id.clone());
            }
        }
        self.ensure(&child_id).await?;
        Ok(child_id)
    }

    // -----------------------------------------------------------------
    // Idle policy
    // -----------------------------------------------------------------

    pub async fn run_idle_loop(self: Arc<Self>, interval: Duration, idle_threshold: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.idle_scan_once(idle_threshold).await;
        }
    }

    async fn idle_scan_once(&self, idle_threshold: Duration) {
        let now = now_ms();
        let idle_ids: Vec<String> = {
            let instances = self.instances.lock().await;
            let leases = self.leases.lock().await;
            instances
                .values()
                .filter(|i| i.state == InstanceState::Running)
                .filter(|i| {
                    let has_lease = leases
                        .get(&i.id)
                        .map(|ls| ls.iter().any(|l| l.expires_at_ms > now))
                        .unwrap_or(false);
                    i.is_idle(idle_threshold.as_millis() as u64, has_lease)
                })
                .map(|i| i.id.clone())
                .collect()
        };

        for id in idle_ids {
            if self.vmm.capabilities().supports_pause {
                let _ = self.pause(&id).await;
            } else {
                self.teardown(&id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::mock::LocalProcessVmm;

    fn manager() -> Arc<LifecycleManager> {
        LifecycleManager::new(
            Arc::new(LocalProcessVmm::new()),
            Arc::new(LogStore::new(100)),
            Arc::new(TetherBus::new(100)),
            Arc::new(PortAllocator::new()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    fn spec(command: Vec<&str>) -> InstanceSpec {
        InstanceSpec {
            command: command.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cold_boot_and_exec_yields_expected_output() {
        let manager = manager();
        let id = manager.create(spec(vec!["sleep", "5"])).await.unwrap();
        manager.ensure(&id).await.unwrap();

        let instance = manager.get(&id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);

        let handle = manager
            .exec(&id, vec!["echo".into(), "hello".into()], HashMap::new())
            .await
            .unwrap();
        let exit_code = tokio::time::timeout(Duration::from_secs(5), handle.done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_code, 0);
    }

    #[tokio::test]
    async fn spawn_denied_for_disallowed_image() {
        let manager = manager();
        let mut parent_spec = spec(vec!["sleep", "5"]);
        parent_spec.capabilities = Capabilities {
            spawn: true,
            spawn_depth: 1,
            max_children: 4,
            allowed_images: vec!["python:*".into()],
            max_memory_mb: 512,
            max_vcpus: 2,
            max_expose_ports: 2,
        };
        let id = manager.create(parent_spec).await.unwrap();
        manager.ensure(&id).await.unwrap();

        let err = manager
            .reconcile_spawn(
                &id,
                GuestSpawnParams {
                    command: vec!["node".into()],
                    image: Some("node:20".into()),
                    env: HashMap::new(),
                    memory_mb: None,
                    vcpus: None,
                    expose_ports: Vec::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityDenied(_)));
    }

    #[tokio::test]
    async fn resolved_secrets_are_injected_into_the_primary_env() {
        struct FakeResolver;
        #[async_trait::async_trait]
        impl crate::secrets::SecretResolver for FakeResolver {
            async fn resolve(
                &self,
                keys: &[String],
            ) -> Result<HashMap<String, secrecy::SecretString>> {
                assert_eq!(keys, &["db_password".to_string()]);
                Ok(HashMap::from([(
                    "db_password".to_string(),
                    secrecy::SecretString::from("hunter2".to_string()),
                )]))
            }
        }

        let manager = manager().with_secret_resolver(Arc::new(FakeResolver));
        let mut instance_spec = spec(vec!["sh", "-c", "echo \"pw=$db_password\""]);
        instance_spec.secrets = vec!["db_password".to_string()];
        let id = manager.create(instance_spec).await.unwrap();
        manager.ensure(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sub = manager.logs().subscribe(&id);
        assert!(sub.snapshot.iter().any(|e| e.line == "pw=hunter2"));
    }

    #[tokio::test]
    async fn delete_of_nonexistent_instance_is_not_found() {
        let manager = manager();
        let err = manager.delete("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn disable_then_disable_is_idempotent() {
        let manager = manager();
        let id = manager.create(spec(vec!["sleep", "5"])).await.unwrap();
        manager.ensure(&id).await.unwrap();
        manager.disable(&id).await.unwrap();
        manager.disable(&id).await.unwrap();
        let instance = manager.get(&id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Disabled);
    }
}
