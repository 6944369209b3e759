//! In-memory backend
//!
//! Keeps keys in a process-local map. Lease expiry is not timed; tests expire
//! leases explicitly. Failures can be injected to exercise the client's
//! teardown paths.

use crate::backend::{Backend, BackendModule};
use crate::error::{KvstoreError, Result};
use crate::lease::{Lease, LeaseConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Store {
    keys: BTreeMap<String, Vec<u8>>,
}

/// Process-local coordination store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    fail_renewals: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.store.lock().keys.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().keys.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().keys.contains_key(key)
    }

    /// Drop a key as if its TTL ran out
    pub fn expire(&self, key: &str) {
        self.store.lock().keys.remove(key);
    }

    /// Make every later renewal fail
    pub fn fail_renewals(&self, fail: bool) {
        self.fail_renewals.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn grant_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(held) = store.keys.get(&config.key) {
            if !lease.same_owner(&String::from_utf8_lossy(held)) {
                return Err(KvstoreError::LeaseLost(format!(
                    "lease key {} is held by another owner",
                    config.key
                )));
            }
        }
        store.keys.insert(config.key.clone(), lease.value().into_bytes());
        Ok(())
    }

    async fn renew_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(KvstoreError::Backend("renewal rejected".to_string()));
        }
        let store = self.store.lock();
        match store.keys.get(&config.key) {
            Some(held) if held.as_slice() == lease.value().as_bytes() => Ok(()),
            _ => Err(KvstoreError::LeaseLost(format!(
                "lease key {} expired or changed owner",
                config.key
            ))),
        }
    }

    async fn revoke_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        let mut store = self.store.lock();
        if store.keys.get(&config.key).map(Vec::as_slice) == Some(lease.value().as_bytes()) {
            store.keys.remove(&config.key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut store = self.store.lock();
        let before = store.keys.len();
        store.keys.retain(|k, _| !k.starts_with(prefix));
        Ok(before - store.keys.len())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .store
            .lock()
            .keys
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Hands out one shared [`MemoryBackend`]
#[derive(Debug, Default)]
pub struct MemoryModule {
    backend: Arc<MemoryBackend>,
    fail_connect: AtomicBool,
}

impl MemoryModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend every client of this module shares
    pub fn backend(&self) -> Arc<MemoryBackend> {
        self.backend.clone()
    }

    /// Make every later `new_client` fail
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendModule for MemoryModule {
    fn name(&self) -> &str {
        "memory"
    }

    async fn new_client(&self) -> Result<Arc<dyn Backend>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(KvstoreError::Backend("connection refused".to_string()));
        }
        let backend: Arc<dyn Backend> = self.backend.clone();
        Ok(backend)
    }
}
