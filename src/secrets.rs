//! Boundary trait for resolving an instance's `secrets` key names into
//! injectable environment values.
//!
//! The encrypted secret store itself is a pure crypto collaborator with
//! encrypt/decrypt string primitives, out of scope for this crate, same as
//! the real VMM backend. This trait exists so the Lifecycle Manager's boot
//! sequence has the right shape to call across that boundary without
//! owning it.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::Result;

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve the given secret key names (or `["*"]` for "all secrets
    /// configured for this app") into environment-ready values. Values
    /// come back wrapped in [`SecretString`] so the only place a value
    /// is plaintext is the one call to `.expose_secret()` at the point
    /// it's merged into the guest's env map.
    async fn resolve(&self, keys: &[String]) -> Result<HashMap<String, SecretString>>;
}

/// Default resolver used when no real secret store is wired up: every
/// request resolves to no values, so instances with `secrets` set still
/// boot, just without anything injected.
pub struct NoopSecretResolver;

#[async_trait]
impl SecretResolver for NoopSecretResolver {
    async fn resolve(&self, _keys: &[String]) -> Result<HashMap<String, SecretString>> {
        Ok(HashMap::new())
    }
}
