//! Instance data model and state machine.
//!
//! The [`Instance`] record is the Lifecycle Manager's authoritative view of
//! a microVM: its spec, its current state, and its activity accounting.
//! State transitions are expressed as an explicit enum plus a small set of
//! guarded mutation methods rather than free-form field writes, so the
//! invariants stay enforced in one place.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Monotonic millisecond timestamp. Kept as a plain function (rather than
/// a `chrono`/`time` dependency) since the daemon only ever needs
/// `SystemTime::now()` deltas, not calendar arithmetic.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Paused,
    Disabled,
}

impl InstanceState {
    pub fn holds_listeners(&self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Paused)
    }
}

/// Policy bounding what an instance may request of the host via
/// `guest.spawn` and friends. `None` means the instance cannot spawn at
/// all, equivalent to `spawn: false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub spawn: bool,
    #[serde(default)]
    pub spawn_depth: u32,
    #[serde(default)]
    pub max_children: u32,
    /// `["*"]` means unrestricted.
    #[serde(default)]
    pub allowed_images: Vec<String>,
    #[serde(default)]
    pub max_memory_mb: u32,
    #[serde(default)]
    pub max_vcpus: u32,
    #[serde(default)]
    pub max_expose_ports: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            spawn: false,
            spawn_depth: 0,
            max_children: 0,
            allowed_images: Vec::new(),
            max_memory_mb: 0,
            max_vcpus: 0,
            max_expose_ports: 0,
        }
    }
}

impl Capabilities {
    fn image_allowed(&self, image: &str) -> bool {
        self.allowed_images.iter().any(|a| a == "*") || self.allowed_images.iter().any(|a| a == image)
    }

    /// Evaluate a `guest.spawn` request against this (the parent's)
    /// capability policy. Returns the capabilities to install on the
    /// child on success.
    pub fn check_spawn(
        &self,
        children_count: u32,
        image: &str,
        memory_mb: u32,
        vcpus: u32,
        expose_ports: u32,
    ) -> Result<Capabilities> {
        if !self.spawn || self.spawn_depth == 0 {
            return Err(Error::CapabilityDenied(
                "spawn not permitted at this depth".into(),
            ));
        }
        if children_count >= self.max_children {
            return Err(Error::CapabilityDenied("max_children exceeded".into()));
        }
        if !self.image_allowed(image) {
            return Err(Error::CapabilityDenied(format!(
                "image {image} not in allowed_images"
            )));
        }
        if memory_mb > self.max_memory_mb {
            return Err(Error::CapabilityDenied("memory_mb exceeds max_memory_mb".into()));
        }
        if vcpus > self.max_vcpus {
            return Err(Error::CapabilityDenied("vcpus exceeds max_vcpus".into()));
        }
        if expose_ports > self.max_expose_ports {
            return Err(Error::CapabilityDenied(
                "expose_ports exceeds max_expose_ports".into(),
            ));
        }
        Ok(Capabilities {
            spawn: self.spawn,
            spawn_depth: self.spawn_depth - 1,
            max_children: self.max_children,
            allowed_images: self.allowed_images.clone(),
            max_memory_mb: self.max_memory_mb,
            max_vcpus: self.max_vcpus,
            max_expose_ports: self.max_expose_ports,
        })
    }
}

/// Everything needed to create an instance: the full field list for the
/// Instance data model, minus host-assigned bookkeeping (`id`, `state`,
/// `created_at`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub handle: Option<String>,
    pub command: Vec<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub expose_ports: Vec<u16>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub release_id: Option<String>,
}

fn default_memory_mb() -> u32 {
    512
}

fn default_vcpus() -> u32 {
    1
}

/// The host's authoritative record for one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub handle: Option<String>,
    pub command: Vec<String>,
    pub workspace: Option<String>,
    pub image_ref: Option<String>,
    pub env: HashMap<String, String>,
    pub secrets: Vec<String>,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub capabilities: Capabilities,
    pub expose_ports: HashSet<u16>,
    pub endpoints: HashMap<u16, u16>,
    pub app_id: Option<String>,
    pub release_id: Option<String>,
    pub created_at: u64,
    pub last_active_at: u64,
    pub active_connections: u32,
    pub state: InstanceState,
    pub parent_id: Option<String>,
    pub children: HashSet<String>,
}

impl Instance {
    pub fn new(id: String, spec: InstanceSpec, parent_id: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id,
            handle: spec.handle,
            command: spec.command,
            workspace: spec.workspace,
            image_ref: spec.image_ref,
            env: spec.env,
            secrets: spec.secrets,
            memory_mb: spec.memory_mb,
            vcpus: spec.vcpus,
            capabilities: spec.capabilities,
            expose_ports: spec.expose_ports.into_iter().collect(),
            endpoints: HashMap::new(),
            app_id: spec.app_id,
            release_id: spec.release_id,
            created_at: now,
            last_active_at: now,
            active_connections: 0,
            state: InstanceState::Stopped,
            parent_id,
            children: HashSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = now_ms();
    }

    pub fn is_idle(&self, idle_threshold_ms: u64, has_lease: bool) -> bool {
        self.state == InstanceState::Running
            && !has_lease
            && self.active_connections == 0
            && now_ms().saturating_sub(self.last_active_at) >= idle_threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(spawn_depth: u32) -> Capabilities {
        Capabilities {
            spawn: true,
            spawn_depth,
            max_children: 4,
            allowed_images: vec!["python:*".into()],
            max_memory_mb: 512,
            max_vcpus: 2,
            max_expose_ports: 2,
        }
    }

    #[test]
    fn spawn_denied_when_image_not_allowed() {
        let parent = caps(1);
        let err = parent.check_spawn(0, "node:20", 128, 1, 0).unwrap_err();
        assert!(matches!(err, Error::CapabilityDenied(_)));
    }

    #[test]
    fn spawn_succeeds_and_decrements_depth() {
        let parent = caps(1);
        let child = parent.check_spawn(0, "python:3.12", 128, 1, 0).unwrap();
        assert_eq!(child.spawn_depth, 0);
    }

    #[test]
    fn spawn_denied_at_zero_depth() {
        let parent = caps(0);
        let err = parent
            .check_spawn(0, "python:3.12", 128, 1, 0)
            .unwrap_err();
        assert!(matches!(err, Error::CapabilityDenied(_)));
    }

    #[test]
    fn spawn_denied_over_resource_caps() {
        let parent = caps(2);
        assert!(parent.check_spawn(0, "python:3.12", 1024, 1, 0).is_err());
        assert!(parent.check_spawn(0, "python:3.12", 128, 8, 0).is_err());
        assert!(parent.check_spawn(0, "python:3.12", 128, 1, 5).is_err());
    }

    #[test]
    fn wildcard_image_allows_anything() {
        let parent = Capabilities {
            allowed_images: vec!["*".into()],
            ..caps(1)
        };
        assert!(parent.check_spawn(0, "anything:latest", 128, 1, 0).is_ok());
    }

    #[test]
    fn idle_requires_no_lease_no_conns_and_elapsed_time() {
        let mut inst = Instance::new(
            "i1".into(),
            InstanceSpec {
                command: vec!["sleep".into(), "60".into()],
                ..Default::default()
            },
            None,
        );
        inst.state = InstanceState::Running;
        inst.last_active_at = 0;
        assert!(inst.is_idle(0, false));
        assert!(!inst.is_idle(0, true));
        inst.active_connections = 1;
        assert!(!inst.is_idle(0, false));
    }
}
