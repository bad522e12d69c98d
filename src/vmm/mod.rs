//! VMM driver abstraction.
//!
//! The real hypervisor backend is an external collaborator this crate
//! doesn't own: this module is the abstract interface (`start`, `pause`,
//! `resume`, `stop`, plus a capabilities descriptor) a concrete backend
//! would implement, plus a [`mock::LocalProcessVmm`] test double so the
//! Lifecycle Manager is fully testable without a real hypervisor.

pub mod mock;

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::Result;

/// What a VMM backend can do. The Lifecycle Manager consults this before
/// choosing `pause` vs `stop` for idle instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmmCapabilities {
    pub supports_pause: bool,
}

/// Everything the VMM needs to start a VM for one instance.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub instance_id: String,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub rootfs_path: Option<String>,
    pub workspace_path: Option<String>,
    /// Kernel-cmdline-style key/value pairs, including `AEGIS_HOST_ADDR`,
    /// `AEGIS_WORKSPACE`, `AEGIS_NET_IP`, `AEGIS_INSTANCE_ID`, injected
    /// secrets, and user `env`.
    pub kernel_args: HashMap<String, String>,
}

/// An opaque handle to a running VM. The Lifecycle Manager keeps this
/// alongside the `Instance` record and uses it for the pause/resume/stop
/// calls and for discovering the VM's port-forwarding endpoint.
pub trait VmHandle: Send + Sync {
    /// Where the Port Allocator should dial to reach a guest port exposed
    /// on this VM's NIC.
    fn forwarding_endpoint(&self, guest_port: u16) -> SocketAddr;

    /// The address the guest harness dials back on to establish the
    /// Transport connection.
    fn host_transport_addr(&self) -> SocketAddr;

    /// Lets a `VmmDriver` recover its own concrete handle type back from
    /// the trait object it handed the Lifecycle Manager.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The abstract VMM driver: `start`, `pause`, `resume`, `stop`, plus a
/// capabilities descriptor.
#[async_trait]
pub trait VmmDriver: Send + Sync {
    fn capabilities(&self) -> VmmCapabilities;

    async fn start(&self, spec: VmSpec) -> Result<Box<dyn VmHandle>>;
    async fn pause(&self, handle: &dyn VmHandle) -> Result<()>;
    async fn resume(&self, handle: &dyn VmHandle) -> Result<()>;
    async fn stop(&self, handle: &dyn VmHandle) -> Result<()>;
}
