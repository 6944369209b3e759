//! Backend abstraction
//!
//! A [`BackendModule`] knows how to connect to one kind of store and hands
//! out [`Backend`] clients. The client handle only talks to these traits.

use crate::error::Result;
use crate::lease::{Lease, LeaseConfig};
use async_trait::async_trait;
use std::sync::Arc;

/// Operations the client needs from a coordination store
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Write the lease key, failing if another owner holds it
    ///
    /// A key left behind by the same owner is taken over.
    async fn grant_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()>;

    /// Extend the lease if the key still holds this lease
    async fn renew_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()>;

    /// Drop the lease if the key still holds this lease
    async fn revoke_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()>;

    /// Delete every key starting with `prefix`; returns the number deleted
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// All keys starting with `prefix` with their values
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Factory for backend clients
#[async_trait]
pub trait BackendModule: Send + Sync {
    fn name(&self) -> &str;

    /// Connect and return a new client
    async fn new_client(&self) -> Result<Arc<dyn Backend>>;
}
