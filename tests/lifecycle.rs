//! End-to-end Lifecycle Manager tests over the public API, using
//! `LocalProcessVmm` so boot/exec/idle actually exercise real child
//! processes on the test host instead of a hypervisor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis::instance::{Capabilities, InstanceSpec, InstanceState};
use aegis::lifecycle::LifecycleManager;
use aegis::logstore::LogStore;
use aegis::portalloc::PortAllocator;
use aegis::tether::TetherBus;
use aegis::vmm::mock::LocalProcessVmm;

fn manager() -> Arc<LifecycleManager> {
    LifecycleManager::new(
        Arc::new(LocalProcessVmm::new()),
        Arc::new(LogStore::new(1000)),
        Arc::new(TetherBus::new(1000)),
        Arc::new(PortAllocator::new()),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
}

fn spec(command: &[&str]) -> InstanceSpec {
    InstanceSpec {
        command: command.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn create_ensure_exec_reaches_running_and_returns_output() {
    let manager = manager();
    let id = manager.create(spec(&["sleep", "30"])).await.unwrap();

    let instance = manager.get(&id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);

    manager.ensure(&id).await.unwrap();
    let instance = manager.get(&id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Running);

    let handle = manager
        .exec(&id, vec!["echo".into(), "hello".into()], HashMap::new())
        .await
        .unwrap();
    let exit_code = tokio::time::timeout(Duration::from_secs(5), handle.done_rx)
        .await
        .expect("exec did not finish in time")
        .unwrap();
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn ensure_is_idempotent() {
    let manager = manager();
    let id = manager.create(spec(&["sleep", "30"])).await.unwrap();
    manager.ensure(&id).await.unwrap();
    manager.ensure(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, InstanceState::Running);
}

#[tokio::test]
async fn pause_then_stop_transitions_are_reflected_in_state() {
    let manager = manager();
    let id = manager.create(spec(&["sleep", "30"])).await.unwrap();
    manager.ensure(&id).await.unwrap();

    manager.pause(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, InstanceState::Paused);

    manager.stop(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, InstanceState::Stopped);
}

#[tokio::test]
async fn disable_then_disable_is_idempotent() {
    let manager = manager();
    let id = manager.create(spec(&["sleep", "5"])).await.unwrap();
    manager.disable(&id).await.unwrap();
    manager.disable(&id).await.unwrap();
    assert_eq!(manager.get(&id).await.unwrap().state, InstanceState::Disabled);
}

#[tokio::test]
async fn delete_removes_instance_and_is_not_found_afterwards() {
    let manager = manager();
    let id = manager.create(spec(&["sleep", "5"])).await.unwrap();
    manager.ensure(&id).await.unwrap();
    manager.delete(&id).await.unwrap();
    assert!(manager.get(&id).await.is_err());
}

#[tokio::test]
async fn delete_of_nonexistent_instance_is_not_found() {
    let manager = manager();
    let err = manager.delete("no-such-instance").await.unwrap_err();
    assert!(matches!(err, aegis::error::Error::NotFound(_)));
}

#[tokio::test]
async fn spawn_denied_when_child_would_exceed_capacity_caps() {
    let manager = manager();
    let mut parent = spec(&["sleep", "30"]);
    parent.capabilities = Capabilities {
        spawn: true,
        spawn_depth: 2,
        max_children: 4,
        allowed_images: vec!["*".into()],
        max_memory_mb: 256,
        max_vcpus: 1,
        max_expose_ports: 0,
    };
    let id = manager.create(parent).await.unwrap();
    manager.ensure(&id).await.unwrap();

    let denied = manager
        .get(&id)
        .await
        .unwrap()
        .capabilities
        .check_spawn(0, "any:latest", 1024, 1, 0);
    assert!(denied.is_err(), "memory request over cap must be rejected");
}

#[tokio::test]
async fn list_reflects_all_created_instances() {
    let manager = manager();
    let a = manager.create(spec(&["sleep", "5"])).await.unwrap();
    let b = manager.create(spec(&["sleep", "5"])).await.unwrap();
    let ids: Vec<String> = manager.list().await.into_iter().map(|i| i.id).collect();
    assert!(ids.contains(&a));
    assert!(ids.contains(&b));
}
