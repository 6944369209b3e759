//! Error types for the kvstore client

use thiserror::Error;

/// Kvstore client errors
#[derive(Debug, Error)]
pub enum KvstoreError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The lease expired or is held by another owner
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// No backend has been initialized yet
    #[error("Kvstore client not initialized")]
    NotInitialized,

    /// Backend specific failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for kvstore operations
pub type Result<T> = std::result::Result<T, KvstoreError>;
