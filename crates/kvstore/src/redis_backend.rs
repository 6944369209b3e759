//! Redis backend
//!
//! The lease is a plain key holding `<owner>:<token>` with a TTL. A grant
//! succeeds on a free key or one left behind by the same owner, e.g. by a
//! previous run that exited without revoking. Renewal and revocation compare
//! the full value so a process never extends or drops a lease it no longer
//! owns.

use crate::backend::{Backend, BackendModule};
use crate::error::{KvstoreError, Result};
use crate::lease::{Lease, LeaseConfig};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

const GRANT_SCRIPT: &str = r#"
local held = redis.call('get', KEYS[1])
if held then
    local prefix = ARGV[1] .. ':'
    if string.sub(held, 1, #prefix) ~= prefix
        or string.find(held, ':', #prefix + 1, true) then
        return 0
    end
end
redis.call('set', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('expire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const REVOKE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Connects [`RedisBackend`] clients to one Redis URL
#[derive(Debug, Clone)]
pub struct RedisModule {
    url: String,
}

impl RedisModule {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BackendModule for RedisModule {
    fn name(&self) -> &str {
        "redis"
    }

    async fn new_client(&self) -> Result<Arc<dyn Backend>> {
        let backend: Arc<dyn Backend> = Arc::new(RedisBackend::connect(&self.url).await?);
        Ok(backend)
    }
}

/// Redis coordination store client
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        debug!(url, "Connected to Redis");
        Ok(Self { conn })
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    #[instrument(skip(self, lease), fields(key = %config.key))]
    async fn grant_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let granted: i64 = redis::Script::new(GRANT_SCRIPT)
            .key(&config.key)
            .arg(&lease.owner)
            .arg(lease.value())
            .arg(config.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        if granted == 0 {
            return Err(KvstoreError::LeaseLost(format!(
                "lease key {} is held by another owner",
                config.key
            )));
        }

        debug!(ttl = config.ttl_secs, "Lease granted");
        Ok(())
    }

    #[instrument(skip(self, lease), fields(key = %config.key))]
    async fn renew_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(&config.key)
            .arg(lease.value())
            .arg(config.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        if renewed == 0 {
            return Err(KvstoreError::LeaseLost(format!(
                "lease key {} expired or changed owner",
                config.key
            )));
        }

        debug!(ttl = config.ttl_secs, "Lease renewed");
        Ok(())
    }

    #[instrument(skip(self, lease), fields(key = %config.key))]
    async fn revoke_lease(&self, config: &LeaseConfig, lease: &Lease) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(REVOKE_SCRIPT)
            .key(&config.key)
            .arg(lease.value())
            .invoke_async(&mut conn)
            .await?;

        debug!(deleted = deleted > 0, "Lease revoked");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.scan_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let deleted: usize = conn.del(&keys).await?;
        debug!(deleted, "Deleted keys under prefix");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let keys = self.scan_keys(prefix).await?;
        let mut conn = self.conn.clone();
        let mut entries = Vec::with_capacity(keys.len());

        for key in keys {
            // Keys may expire between SCAN and GET
            let value: Option<Vec<u8>> = conn.get(&key).await?;
            if let Some(value) = value {
                entries.push((key, value));
            }
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
