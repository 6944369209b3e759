//! Kvstore client handle
//!
//! [`KvstoreClient`] is constructed once at process start and passed to
//! whoever needs the store. It owns the backend and the default lease:
//!
//! 1. [`init`](KvstoreClient::init) connects through a [`BackendModule`],
//!    deletes legacy key prefixes and grants the lease. The backend only
//!    becomes visible through [`current_backend`](KvstoreClient::current_backend)
//!    once the lease is held.
//! 2. [`renew_periodically`](KvstoreClient::renew_periodically) keeps the
//!    lease alive. A failed renewal tears the backend down; the client is
//!    never re-initialized implicitly.

use crate::backend::{Backend, BackendModule};
use crate::error::{KvstoreError, Result};
use crate::lease::{Lease, LeaseConfig};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Coordination store client with lease-based liveness
pub struct KvstoreClient {
    owner: String,
    lease_config: LeaseConfig,
    legacy_prefixes: Vec<String>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    lease: RwLock<Option<Lease>>,
}

impl KvstoreClient {
    pub fn new(owner: impl Into<String>, lease_config: LeaseConfig) -> Self {
        Self {
            owner: owner.into(),
            lease_config,
            legacy_prefixes: Vec::new(),
            backend: RwLock::new(None),
            lease: RwLock::new(None),
        }
    }

    /// Key prefixes deleted during initialization
    pub fn with_legacy_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.legacy_prefixes = prefixes;
        self
    }

    pub fn lease_config(&self) -> &LeaseConfig {
        &self.lease_config
    }

    /// The backend, or `None` until initialization completed or after the
    /// lease was lost
    pub fn current_backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.read().clone()
    }

    /// The lease as last granted or renewed
    pub fn lease(&self) -> Option<Lease> {
        self.lease.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Connect, delete legacy prefixes and grant the default lease
    #[instrument(skip(self, module), fields(module = module.name(), owner = %self.owner))]
    pub async fn init(&self, module: &dyn BackendModule) -> Result<()> {
        if self.is_initialized() {
            return Err(KvstoreError::Backend(
                "kvstore client already initialized".to_string(),
            ));
        }

        let backend = module.new_client().await?;

        self.delete_legacy_prefixes(backend.as_ref()).await;

        let lease = Lease::new(self.owner.clone(), self.lease_config.ttl_secs);
        if let Err(e) = backend.grant_lease(&self.lease_config, &lease).await {
            error!(error = %e, "Unable to create default lease");
            return Err(e);
        }

        *self.lease.write() = Some(lease);
        *self.backend.write() = Some(backend);
        info!(ttl = self.lease_config.ttl_secs, "Kvstore client initialized");
        Ok(())
    }

    async fn delete_legacy_prefixes(&self, backend: &dyn Backend) {
        for prefix in &self.legacy_prefixes {
            match backend.delete_prefix(prefix).await {
                Ok(0) => {}
                Ok(deleted) => info!(prefix = %prefix, deleted, "Deleted legacy keys"),
                Err(e) => warn!(prefix = %prefix, error = %e, "Unable to delete legacy prefix"),
            }
        }
    }

    /// Renew the default lease; on failure the backend is torn down
    pub async fn renew_lease(&self) -> Result<()> {
        let backend = self.current_backend().ok_or(KvstoreError::NotInitialized)?;
        let lease = self.lease().ok_or(KvstoreError::NotInitialized)?;

        match backend.renew_lease(&self.lease_config, &lease).await {
            Ok(()) => {
                *self.lease.write() = Some(lease.renewed(self.lease_config.ttl_secs));
                debug!(owner = %self.owner, "Lease renewed");
                Ok(())
            }
            Err(e) => {
                error!(
                    owner = %self.owner,
                    error = %e,
                    "Lease renewal failed, tearing down kvstore client"
                );
                self.teardown();
                Err(e)
            }
        }
    }

    /// Renew the lease every renewal interval until `shutdown` flips to true
    /// or a renewal fails
    pub async fn renew_periodically(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.lease_config.renewal_interval());
        // The first tick completes immediately; the lease was just granted
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.renew_lease().await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Lease renewal stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// List keys under `prefix` through the current backend
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let backend = self.current_backend().ok_or(KvstoreError::NotInitialized)?;
        backend.list_prefix(prefix).await
    }

    /// Revoke the lease and drop the backend
    pub async fn close(&self) {
        if let (Some(backend), Some(lease)) = (self.current_backend(), self.lease()) {
            if let Err(e) = backend.revoke_lease(&self.lease_config, &lease).await {
                warn!(error = %e, "Unable to revoke lease");
            }
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.backend.write().take();
        self.lease.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryModule;
    use pretty_assertions::assert_eq;

    fn client() -> KvstoreClient {
        KvstoreClient::new("node-a", LeaseConfig::default())
    }

    #[tokio::test]
    async fn test_backend_absent_until_init() {
        let module = MemoryModule::new();
        let client = client();
        assert!(client.current_backend().is_none());

        client.init(&module).await.unwrap();
        assert!(client.current_backend().is_some());
        assert!(client.lease().unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_client_absent() {
        let module = MemoryModule::new();
        module.fail_connect(true);
        let client = client();

        assert!(client.init(&module).await.is_err());
        assert!(client.current_backend().is_none());
    }

    #[tokio::test]
    async fn test_lease_conflict_fails_init() {
        let module = MemoryModule::new();
        module
            .backend()
            .put(LeaseConfig::default().key, "someone-else");
        let client = client();

        let err = client.init(&module).await.unwrap_err();
        assert!(matches!(err, KvstoreError::LeaseLost(_)));
        assert!(client.current_backend().is_none());
        assert!(client.lease().is_none());
    }

    #[tokio::test]
    async fn test_legacy_prefixes_deleted() {
        let module = MemoryModule::new();
        let backend = module.backend();
        backend.put("legacy/nodes/a", "x");
        backend.put("current/nodes/a", "y");

        let client = client().with_legacy_prefixes(vec!["legacy/".to_string()]);
        client.init(&module).await.unwrap();

        assert!(!backend.contains("legacy/nodes/a"));
        assert!(backend.contains("current/nodes/a"));
    }

    #[tokio::test]
    async fn test_renewal_failure_tears_down() {
        let module = MemoryModule::new();
        let client = client();
        client.init(&module).await.unwrap();

        client.renew_lease().await.unwrap();
        assert!(client.is_initialized());

        module.backend().expire(&client.lease_config().key);
        assert!(client.renew_lease().await.is_err());
        assert!(client.current_backend().is_none());

        // Not re-created implicitly
        assert!(matches!(
            client.renew_lease().await,
            Err(KvstoreError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_double_init_rejected() {
        let module = MemoryModule::new();
        let client = client();
        client.init(&module).await.unwrap();
        assert!(client.init(&module).await.is_err());
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn test_close_revokes_lease() {
        let module = MemoryModule::new();
        let client = client();
        client.init(&module).await.unwrap();

        client.close().await;
        assert!(!module.backend().contains(&client.lease_config().key));
        assert!(client.current_backend().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let module = MemoryModule::new();
        let client = client();
        assert!(matches!(
            client.list_prefix("nodes/").await,
            Err(KvstoreError::NotInitialized)
        ));

        module.backend().put("nodes/b", "{}");
        client.init(&module).await.unwrap();
        let entries = client.list_prefix("nodes/").await.unwrap();
        assert_eq!(entries, vec![("nodes/b".to_string(), b"{}".to_vec())]);
    }
}
