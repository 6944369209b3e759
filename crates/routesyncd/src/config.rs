//! Configuration file support for routesyncd
//!
//! Loads and validates routesyncd configuration from TOML files.
//! Default location: /etc/routesyncd/routesyncd.conf

use crate::cluster::{ClusterConfiguration, LocalNodeConfig, Node};
use crate::error::{Result, RouteSyncError};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/routesyncd/routesyncd.conf";

/// Routing mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Device carrying per-node and nexthop routes
    #[serde(default = "default_host_device")]
    pub host_device: String,

    /// Install one route per node instead of the allocation range route
    #[serde(default = "default_use_per_node_routes")]
    pub use_per_node_routes: bool,

    /// Route directly to peers on the same L2 segment
    #[serde(default)]
    pub direct_routing: bool,

    /// Tunnel mode in use (informational)
    #[serde(default)]
    pub encapsulation: bool,

    /// Extra networks routed via the cluster router
    #[serde(default)]
    pub aux_prefixes: Vec<IpNet>,
}

/// Local node identity and addressing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalNodeSection {
    #[serde(default)]
    pub name: String,
    pub internal_ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_router: Option<Ipv6Addr>,
    pub ipv4_alloc_range: Option<Ipv4Net>,
    pub ipv6_alloc_range: Option<Ipv6Net>,
}

/// Synchronization schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between synchronization passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

/// Kvstore connection and lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvstoreConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Lease time-to-live in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,

    /// Lease renewal interval in seconds
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,

    /// Key prefix holding JSON node records
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,

    /// Key prefixes deleted when the client initializes
    #[serde(default)]
    pub legacy_prefixes: Vec<String>,
}

/// Complete routesyncd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesyncConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub local_node: LocalNodeSection,

    /// Static cluster members
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub kvstore: KvstoreConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_host_device() -> String {
    "cilium_host".to_string()
}

fn default_use_per_node_routes() -> bool {
    true
}

fn default_interval() -> u64 {
    5
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_lease_ttl() -> u64 {
    15
}

fn default_renewal_interval() -> u64 {
    5
}

fn default_node_prefix() -> String {
    "routesyncd/state/nodes/v1/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            host_device: default_host_device(),
            use_per_node_routes: default_use_per_node_routes(),
            direct_routing: false,
            encapsulation: false,
            aux_prefixes: Vec::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

impl Default for KvstoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: default_redis_url(),
            lease_ttl_secs: default_lease_ttl(),
            renewal_interval_secs: default_renewal_interval(),
            node_prefix: default_node_prefix(),
            legacy_prefixes: Vec::new(),
        }
    }
}

impl Default for RoutesyncConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            local_node: LocalNodeSection::default(),
            nodes: Vec::new(),
            sync: SyncConfig::default(),
            kvstore: KvstoreConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl RoutesyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                RouteSyncError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RouteSyncError::Io(e)),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RouteSyncError::Config(e.to_string()))
    }

    /// Get synchronization interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.routing.host_device.is_empty() {
            return Err(RouteSyncError::Config(
                "host_device must not be empty".to_string(),
            ));
        }

        if self.sync.interval_secs == 0 {
            return Err(RouteSyncError::Config(
                "interval_secs must be > 0".to_string(),
            ));
        }

        if self.kvstore.enabled {
            if self.kvstore.redis_url.is_empty() {
                return Err(RouteSyncError::Config(
                    "redis_url must be set when kvstore is enabled".to_string(),
                ));
            }
            if self.kvstore.renewal_interval_secs == 0
                || self.kvstore.renewal_interval_secs >= self.kvstore.lease_ttl_secs
            {
                return Err(RouteSyncError::Config(
                    "renewal_interval_secs must be > 0 and < lease_ttl_secs".to_string(),
                ));
            }
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(RouteSyncError::Config(
                    "node name must not be empty".to_string(),
                ));
            }
            if !names.insert(node.name.as_str()) {
                return Err(RouteSyncError::Config(format!(
                    "duplicate node {}",
                    node.name
                )));
            }
        }

        Ok(())
    }

    /// Local node view used by the route policy
    pub fn local_node_config(&self) -> LocalNodeConfig {
        LocalNodeConfig {
            name: self.local_node.name.clone(),
            host_device: self.routing.host_device.clone(),
            internal_ipv4: self.local_node.internal_ipv4,
            ipv6: self.local_node.ipv6,
            ipv6_router: self.local_node.ipv6_router,
            ipv4_alloc_range: self.local_node.ipv4_alloc_range,
            ipv6_alloc_range: self.local_node.ipv6_alloc_range,
            direct_routing: self.routing.direct_routing,
            encapsulation: self.routing.encapsulation,
        }
    }

    /// Build the cluster configuration seeded with static nodes and
    /// auxiliary prefixes. Static nodes stay pinned across kvstore refreshes.
    pub fn cluster_configuration(&self) -> ClusterConfiguration {
        let cluster =
            ClusterConfiguration::new(self.local_node_config(), self.routing.use_per_node_routes);
        for node in &self.nodes {
            cluster.pin_node(node.clone());
        }
        for prefix in &self.routing.aux_prefixes {
            cluster.add_aux_prefix(*prefix);
        }
        cluster
    }
}
