//! Coordination store client for routesyncd
//!
//! Provides an explicitly constructed [`KvstoreClient`] handle that owns a
//! backend connection and a renewable lease. Dependents ask
//! [`KvstoreClient::current_backend`] and get `None` until the lease is held,
//! and again after it was lost, so they never act on a stale membership view.
//!
//! # Backends
//!
//! - [`RedisModule`]: Redis via `ConnectionManager`; the lease is a key with
//!   a TTL holding the owner and a random token.
//! - [`MemoryModule`]: process-local store for tests and dry runs.

pub mod backend;
pub mod client;
pub mod error;
pub mod lease;
pub mod memory;
pub mod redis_backend;

pub use backend::{Backend, BackendModule};
pub use client::KvstoreClient;
pub use error::{KvstoreError, Result};
pub use lease::{Lease, LeaseConfig};
pub use memory::{MemoryBackend, MemoryModule};
pub use redis_backend::{RedisBackend, RedisModule};
