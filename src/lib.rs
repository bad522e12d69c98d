//! Aegis: a local microVM orchestrator.
//!
//! This crate is the host daemon side of Aegis: it owns VM lifecycle, port
//! exposure, per-instance logs, and the JSON-RPC control channel to each
//! guest harness. The companion crates are `aegis-protocol` (the shared
//! wire format), `aegis-harness` (the in-guest PID-1 binary), and
//! `aegis-agentctl` (an in-guest CLI over the Guest API).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use aegis::config::Config;
//! use aegis::instance::InstanceSpec;
//! use aegis::lifecycle::LifecycleManager;
//! use aegis::logstore::LogStore;
//! use aegis::portalloc::PortAllocator;
//! use aegis::tether::TetherBus;
//! use aegis::vmm::mock::LocalProcessVmm;
//!
//! #[tokio::main]
//! async fn main() -> aegis::error::Result<()> {
//!     let config = Config::default();
//!     let manager = LifecycleManager::new(
//!         Arc::new(LocalProcessVmm::new()),
//!         Arc::new(LogStore::new(config.log_ring_capacity)),
//!         Arc::new(TetherBus::new(config.tether_buffer_capacity)),
//!         Arc::new(PortAllocator::new()),
//!         config.boot_timeout,
//!         config.exec_timeout,
//!     );
//!
//!     let id = manager
//!         .create(InstanceSpec {
//!             command: vec!["sleep".into(), "5".into()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     manager.ensure(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod logstore;
pub mod observe;
pub mod portalloc;
pub mod secrets;
pub mod tether;
pub mod transport;
pub mod vmm;

pub use error::{Error, Result};
pub use lifecycle::LifecycleManager;

/// Common imports for building on top of the Lifecycle Manager.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::instance::{Capabilities, Instance, InstanceSpec, InstanceState};
    pub use crate::lifecycle::LifecycleManager;
    pub use crate::logstore::LogStore;
    pub use crate::portalloc::PortAllocator;
    pub use crate::tether::TetherBus;
    pub use crate::vmm::VmmDriver;
}
