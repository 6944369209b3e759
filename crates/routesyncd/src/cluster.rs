//! Node registry and cluster configuration
//!
//! [`ClusterConfiguration`] is the one piece of mutable state shared between
//! membership updates and the route synchronizer. Every read and write goes
//! through [`ClusterConfiguration::lock`], so a synchronization pass always
//! sees a consistent snapshot of nodes, auxiliary prefixes and mode flags.

use crate::types::AddressFamily;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info};

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub ipv4_alloc_cidr: Option<Ipv4Net>,
    #[serde(default)]
    pub ipv6_alloc_cidr: Option<Ipv6Net>,
    /// Set by the registry when the name matches the local node
    #[serde(skip)]
    local: bool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv4: None,
            ipv6: None,
            ipv4_alloc_cidr: None,
            ipv6_alloc_cidr: None,
            local: false,
        }
    }

    pub fn with_ipv4(mut self, ip: Ipv4Addr) -> Self {
        self.ipv4 = Some(ip);
        self
    }

    pub fn with_ipv6(mut self, ip: Ipv6Addr) -> Self {
        self.ipv6 = Some(ip);
        self
    }

    pub fn with_ipv4_alloc_cidr(mut self, cidr: Ipv4Net) -> Self {
        self.ipv4_alloc_cidr = Some(cidr);
        self
    }

    pub fn with_ipv6_alloc_cidr(mut self, cidr: Ipv6Net) -> Self {
        self.ipv6_alloc_cidr = Some(cidr);
        self
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Node IP of the given family
    pub fn address(&self, family: AddressFamily) -> Option<IpAddr> {
        match family {
            AddressFamily::Ipv4 => self.ipv4.map(IpAddr::V4),
            AddressFamily::Ipv6 => self.ipv6.map(IpAddr::V6),
        }
    }

    /// Pod CIDR allocated to the node for the given family
    pub fn alloc_cidr(&self, family: AddressFamily) -> Option<IpNet> {
        match family {
            AddressFamily::Ipv4 => self.ipv4_alloc_cidr.map(IpNet::V4),
            AddressFamily::Ipv6 => self.ipv6_alloc_cidr.map(IpNet::V6),
        }
    }
}

/// Addressing of the local node for one family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyAddressing {
    pub family: AddressFamily,
    /// Cluster internal router address, the gateway of per-node routes
    pub router: Option<IpAddr>,
    /// Preferred source address of per-node routes
    pub source: Option<IpAddr>,
    /// Allocation range covered by the fallback route
    pub alloc_range: Option<IpNet>,
}

impl FamilyAddressing {
    /// Host network of the router address
    pub fn router_network(&self) -> Option<IpNet> {
        self.router.map(crate::nexthop::router_network)
    }
}

/// Identity and addressing of the local node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNodeConfig {
    pub name: String,
    /// Device carrying per-node and nexthop routes
    pub host_device: String,
    pub internal_ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_router: Option<Ipv6Addr>,
    pub ipv4_alloc_range: Option<Ipv4Net>,
    pub ipv6_alloc_range: Option<Ipv6Net>,
    /// Install direct routes to peers on the same L2 segment
    pub direct_routing: bool,
    /// Tunnel mode in use; routes are still managed the same way
    pub encapsulation: bool,
}

impl LocalNodeConfig {
    /// Router, source and allocation range for a family
    ///
    /// IPv4 uses the internal IPv4 address as both router and source. IPv6
    /// uses the dedicated router address and the node's own IPv6 as source.
    pub fn family(&self, family: AddressFamily) -> FamilyAddressing {
        match family {
            AddressFamily::Ipv4 => FamilyAddressing {
                family,
                router: self.internal_ipv4.map(IpAddr::V4),
                source: self.internal_ipv4.map(IpAddr::V4),
                alloc_range: self.ipv4_alloc_range.map(IpNet::V4),
            },
            AddressFamily::Ipv6 => FamilyAddressing {
                family,
                router: self.ipv6_router.map(IpAddr::V6),
                source: self.ipv6.map(IpAddr::V6),
                alloc_range: self.ipv6_alloc_range.map(IpNet::V6),
            },
        }
    }

    pub fn encapsulation_enabled(&self) -> bool {
        self.encapsulation
    }
}

/// Routing mode governing one (node, family) pair in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    /// Route straight to the peer's IP on the shared segment
    DirectL2,
    /// Route via the cluster router on the host device
    PerNode,
    /// Covered by the cluster-wide allocation range route
    ClusterFallback,
}

/// Snapshot guarded by the cluster lock
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub local: LocalNodeConfig,
    pub nodes: BTreeMap<String, Node>,
    /// Nodes from static configuration, kept across membership refreshes
    pub static_nodes: BTreeMap<String, Node>,
    pub aux_prefixes: BTreeSet<IpNet>,
    pub use_per_node_routes: bool,
}

impl ClusterState {
    /// The local node entry, if the registry knows it
    pub fn local_node(&self) -> Option<&Node> {
        self.nodes.get(&self.local.name)
    }
}

/// Lock-protected cluster configuration
#[derive(Debug)]
pub struct ClusterConfiguration {
    state: Mutex<ClusterState>,
}

impl ClusterConfiguration {
    pub fn new(local: LocalNodeConfig, use_per_node_routes: bool) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                local,
                nodes: BTreeMap::new(),
                static_nodes: BTreeMap::new(),
                aux_prefixes: BTreeSet::new(),
                use_per_node_routes,
            }),
        }
    }

    /// Acquire the cluster lock
    pub fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock()
    }

    /// Add a node from static configuration
    ///
    /// Pinned nodes survive [`replace_nodes`](Self::replace_nodes) unless a
    /// refreshed record of the same name supersedes them.
    pub fn pin_node(&self, mut node: Node) {
        let mut state = self.state.lock();
        node.local = node.name == state.local.name;
        state.static_nodes.insert(node.name.clone(), node.clone());
        state.nodes.insert(node.name.clone(), node);
    }

    /// Add or update a node; returns true if the node was new
    pub fn upsert_node(&self, mut node: Node) -> bool {
        let mut state = self.state.lock();
        node.local = node.name == state.local.name;
        let name = node.name.clone();
        let is_new = state.nodes.insert(name.clone(), node).is_none();
        if is_new {
            info!(node = %name, "Node joined cluster");
        }
        is_new
    }

    /// Remove a node; returns the removed entry
    pub fn remove_node(&self, name: &str) -> Option<Node> {
        let removed = self.state.lock().nodes.remove(name);
        if removed.is_some() {
            info!(node = %name, "Node left cluster");
        }
        removed
    }

    /// Replace the discovered node set, as after a full membership refresh
    ///
    /// Pinned nodes missing from `nodes` are kept, and so is the local node
    /// when the refresh has no record for it.
    pub fn replace_nodes(&self, nodes: impl IntoIterator<Item = Node>) {
        let mut state = self.state.lock();
        let local_name = state.local.name.clone();

        let mut refreshed: BTreeMap<String, Node> = nodes
            .into_iter()
            .map(|mut n| {
                n.local = n.name == local_name;
                (n.name.clone(), n)
            })
            .collect();

        for (name, node) in &state.static_nodes {
            refreshed
                .entry(name.clone())
                .or_insert_with(|| node.clone());
        }
        if !refreshed.contains_key(&local_name) {
            if let Some(local) = state.nodes.get(&local_name) {
                refreshed.insert(local_name.clone(), local.clone());
            }
        }

        state.nodes = refreshed;
        debug!(count = state.nodes.len(), "Node set replaced");
    }

    pub fn add_aux_prefix(&self, prefix: IpNet) -> bool {
        self.state.lock().aux_prefixes.insert(prefix.trunc())
    }

    pub fn remove_aux_prefix(&self, prefix: &IpNet) -> bool {
        self.state.lock().aux_prefixes.remove(&prefix.trunc())
    }

    pub fn set_use_per_node_routes(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.use_per_node_routes != enabled {
            info!(enabled, "Per-node routes toggled");
            state.use_per_node_routes = enabled;
        }
    }

}
