//! Route generation policy
//!
//! Decides, for a node and one of its destination prefixes, which route must
//! exist. Operates on a snapshot of the cluster state and holds no lock; the
//! only kernel access is the read-only reachability lookup for direct routing.
//!
//! | Case | Condition | Route |
//! |------|-----------|-------|
//! | Direct L2 | direct routing on, remote node, peer on same segment | `via` = node IP |
//! | Per node | per-node routes on, or local node | host device, `via` router, `source` |
//! | Fallback | otherwise | prefix only (not installed) |

use crate::cluster::{LocalNodeConfig, Node, RoutingMode};
use crate::kernel::RouteTable;
use crate::reachability::validate_direct_reachability;
use crate::route::Route;
use crate::types::AddressFamily;
use ipnet::IpNet;
use tracing::{debug, warn};

/// Route generation policy over a cluster snapshot
pub struct RoutePolicy<'a> {
    table: &'a dyn RouteTable,
    local: &'a LocalNodeConfig,
    use_per_node_routes: bool,
}

impl<'a> RoutePolicy<'a> {
    pub fn new(
        table: &'a dyn RouteTable,
        local: &'a LocalNodeConfig,
        use_per_node_routes: bool,
    ) -> Self {
        Self {
            table,
            local,
            use_per_node_routes,
        }
    }

    /// Routing mode for `node` in `family`
    ///
    /// Direct routing is only chosen when the reachability check passes; a
    /// failed check is logged and the decision falls through.
    pub fn select_mode(
        &self,
        node: &Node,
        family: AddressFamily,
        prefix: Option<&IpNet>,
    ) -> RoutingMode {
        if self.local.direct_routing && !node.is_local() {
            match validate_direct_reachability(self.table, node.address(family)) {
                Ok(()) => return RoutingMode::DirectL2,
                Err(e) => {
                    let cidr = prefix.map(ToString::to_string).unwrap_or_default();
                    warn!(
                        node = %node.name,
                        cidr = %cidr,
                        reason = %e,
                        "Unable to use direct route to CIDR"
                    );
                }
            }
        }

        if self.use_per_node_routes || node.is_local() {
            RoutingMode::PerNode
        } else {
            RoutingMode::ClusterFallback
        }
    }

    /// Route that should exist for `prefix` of `node`
    ///
    /// Without a router address for the prefix's family no route is needed;
    /// the per-node case then yields the uninstallable placeholder.
    pub fn generate_route(&self, node: &Node, prefix: IpNet) -> Route {
        let family = AddressFamily::of_prefix(&prefix);
        let addressing = self.local.family(family);
        let mut route = Route::for_prefix(prefix);

        match self.select_mode(node, family, Some(&prefix)) {
            RoutingMode::DirectL2 => {
                route.via = node.address(family);
            }
            RoutingMode::PerNode => match addressing.router {
                Some(router) => {
                    route.link = Some(self.local.host_device.clone());
                    route.via = Some(router);
                    route.source = addressing.source;
                }
                None => debug!(family = %family, "No router address, no per-node route needed"),
            },
            RoutingMode::ClusterFallback => {}
        }

        debug!(node = %node.name, prefix = %prefix, route = %route, "Generated route");
        route
    }

    /// Routes for every allocation CIDR the node has
    pub fn node_routes(&self, node: &Node) -> Vec<Route> {
        AddressFamily::ALL
            .iter()
            .filter_map(|family| node.alloc_cidr(*family))
            .map(|cidr| self.generate_route(node, cidr))
            .collect()
    }
}
