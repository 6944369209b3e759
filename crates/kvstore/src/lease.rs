//! Lease bookkeeping
//!
//! A lease is a time-bounded claim in the coordination store proving this
//! process is alive. The store enforces expiry; [`Lease`] only mirrors what
//! the client last granted or renewed.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lease configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Key holding the lease
    pub key: String,
    /// Lease TTL in seconds
    pub ttl_secs: u64,
    /// Renewal interval in seconds (should be < ttl_secs)
    pub renewal_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key: "routesyncd/.leases/default".to_string(),
            ttl_secs: 15,
            renewal_interval_secs: 5,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lease holder information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Unique lease token
    pub token: String,
    /// Owner instance ID
    pub owner: String,
    /// Acquisition timestamp
    pub acquired_at: u64,
    /// Lease expiry timestamp
    pub expires_at: u64,
}

impl Lease {
    /// New lease with a random token
    pub fn new(owner: impl Into<String>, ttl_secs: u64) -> Self {
        let now = now_secs();
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + ttl_secs,
        }
    }

    /// Value stored under the lease key: `<owner>:<token>`
    pub fn value(&self) -> String {
        format!("{}:{}", self.owner, self.token)
    }

    /// Owner recorded in a stored lease value
    pub fn holder(value: &str) -> Option<&str> {
        value.rsplit_once(':').map(|(owner, _)| owner)
    }

    /// Returns true if `value` was written by a lease of the same owner
    pub fn same_owner(&self, value: &str) -> bool {
        Self::holder(value) == Some(self.owner.as_str())
    }

    /// Push the expiry out after a successful renewal
    pub fn renewed(&self, ttl_secs: u64) -> Self {
        Self {
            expires_at: now_secs() + ttl_secs,
            ..self.clone()
        }
    }

    /// Check if lease is still valid
    pub fn is_valid(&self) -> bool {
        now_secs() < self.expires_at
    }

    /// Get remaining TTL in seconds
    pub fn remaining_ttl(&self) -> u64 {
        self.expires_at.saturating_sub(now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_lease_is_valid() {
        let lease = Lease::new("node-a", 15);
        assert!(lease.is_valid());
        assert!(lease.remaining_ttl() <= 15);
        assert_eq!(lease.owner, "node-a");
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(Lease::new("a", 15).token, Lease::new("a", 15).token);
    }

    #[test]
    fn test_zero_ttl_lease_is_expired() {
        let lease = Lease::new("node-a", 0);
        assert!(!lease.is_valid());
        assert_eq!(lease.remaining_ttl(), 0);
    }

    #[test]
    fn test_renewed_keeps_token() {
        let lease = Lease::new("node-a", 0);
        let renewed = lease.renewed(30);
        assert_eq!(renewed.token, lease.token);
        assert!(renewed.is_valid());
    }

    #[test]
    fn test_value_records_owner() {
        let lease = Lease::new("node-a", 15);
        let value = lease.value();
        assert_eq!(Lease::holder(&value), Some("node-a"));
        assert!(Lease::new("node-a", 15).same_owner(&value));
        assert!(!Lease::new("node-b", 15).same_owner(&value));
        assert!(!Lease::new("node", 15).same_owner(&value));
        assert!(Lease::holder("no-separator").is_none());
    }

    #[test]
    fn test_owner_with_separator() {
        let lease = Lease::new("zone:node-a", 15);
        assert!(Lease::new("zone:node-a", 15).same_owner(&lease.value()));
        assert!(!Lease::new("zone", 15).same_owner(&lease.value()));
    }

    #[test]
    fn test_default_config() {
        let config = LeaseConfig::default();
        assert!(config.renewal_interval() < config.ttl());
    }
}
