//! Cluster route synchronizer
//!
//! One call to [`RouteSynchronizer::synchronize`] is one reconciliation pass:
//! under the cluster lock it refreshes the nexthop routes, derives the routes
//! every node, the fallback ranges and the auxiliary prefixes need, pushes
//! them to the kernel, and withdraws entries it installed earlier that are no
//! longer wanted. Passes are level-triggered; nothing but the set of routes
//! this process installed carries over between them.
//!
//! Kernel failures are collected in the returned [`SyncReport`] and never
//! abort sibling routes. Only a missing host device fails the pass.

use crate::cluster::{ClusterConfiguration, ClusterState, LocalNodeConfig};
use crate::error::{Result, RouteSyncError};
use crate::kernel::RouteTable;
use crate::nexthop::ensure_nexthop_route;
use crate::policy::RoutePolicy;
use crate::route::Route;
use crate::types::{AddressFamily, Link};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What a route belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    /// L2 route to the cluster router
    Nexthop,
    /// Per-node route for the named node
    Node(String),
    /// Cluster-wide allocation range route
    Fallback,
    /// Configured auxiliary prefix
    AuxPrefix,
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nexthop => f.write_str("nexthop"),
            Self::Node(name) => write!(f, "node {}", name),
            Self::Fallback => f.write_str("fallback"),
            Self::AuxPrefix => f.write_str("aux-prefix"),
        }
    }
}

/// One failed route operation in a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub target: SyncTarget,
    pub family: Option<AddressFamily>,
    pub prefix: Option<IpNet>,
    pub error: String,
}

/// Outcome of a synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub nodes_synced: usize,
    pub routes_applied: usize,
    pub routes_withdrawn: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    /// Returns true if every route operation in the pass succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, target: SyncTarget, prefix: Option<IpNet>, error: &RouteSyncError) {
        let family = prefix.as_ref().map(AddressFamily::of_prefix);
        warn!(
            target_kind = %target,
            family = family.map(AddressFamily::as_str).unwrap_or("-"),
            prefix = ?prefix,
            error = %error,
            "Route operation failed"
        );
        self.failures.push(SyncFailure {
            target,
            family,
            prefix,
            error: error.to_string(),
        });
    }
}

/// A route the current snapshot calls for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRoute {
    pub target: SyncTarget,
    pub route: Route,
}

/// Route via the cluster router for `prefix`, or `None` when the family has
/// no router address
pub fn router_route(local: &LocalNodeConfig, prefix: IpNet) -> Option<Route> {
    let addressing = local.family(AddressFamily::of_prefix(&prefix));
    let router = addressing.router?;

    Some(Route {
        link: Some(local.host_device.clone()),
        prefix: Some(prefix),
        via: Some(router),
        source: addressing.source,
    })
}

/// Every route a cluster snapshot calls for, in installation order: per-node
/// routes, the fallback ranges when per-node routes are off, then auxiliary
/// prefixes. Placeholders the fallback covers are left out.
pub fn desired_routes(table: &dyn RouteTable, state: &ClusterState) -> Vec<DesiredRoute> {
    let policy = RoutePolicy::new(table, &state.local, state.use_per_node_routes);
    let mut desired = Vec::new();

    for node in state.nodes.values() {
        desired.extend(
            policy
                .node_routes(node)
                .into_iter()
                .filter(Route::is_installable)
                .map(|route| DesiredRoute {
                    target: SyncTarget::Node(node.name.clone()),
                    route,
                }),
        );
    }

    if !state.use_per_node_routes {
        desired.extend(
            AddressFamily::ALL
                .iter()
                .filter_map(|family| state.local.family(*family).alloc_range)
                .filter_map(|range| router_route(&state.local, range))
                .map(|route| DesiredRoute {
                    target: SyncTarget::Fallback,
                    route,
                }),
        );
    }

    desired.extend(
        state
            .aux_prefixes
            .iter()
            .filter_map(|prefix| router_route(&state.local, *prefix))
            .map(|route| DesiredRoute {
                target: SyncTarget::AuxPrefix,
                route,
            }),
    );

    desired
}

#[derive(Debug, Clone)]
struct InstalledRoute {
    target: SyncTarget,
    route: Route,
}

/// Periodic reconciler of kernel routes against the cluster configuration
pub struct RouteSynchronizer {
    table: Arc<dyn RouteTable>,
    cluster: Arc<ClusterConfiguration>,
    /// Routes this process installed, keyed by destination
    installed: Mutex<HashMap<IpNet, InstalledRoute>>,
}

impl RouteSynchronizer {
    pub fn new(table: Arc<dyn RouteTable>, cluster: Arc<ClusterConfiguration>) -> Self {
        Self {
            table,
            cluster,
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<ClusterConfiguration> {
        &self.cluster
    }

    /// Number of routes currently owned by this synchronizer
    pub fn installed_count(&self) -> usize {
        self.installed.lock().len()
    }

    fn host_link(&self, local: &LocalNodeConfig) -> Result<Link> {
        self.table.link_by_name(&local.host_device).map_err(|e| {
            error!(device = %local.host_device, error = %e, "Unable to lookup interface");
            RouteSyncError::DeviceNotFound(local.host_device.clone())
        })
    }

    /// Run one reconciliation pass
    #[instrument(skip(self))]
    pub fn synchronize(&self) -> Result<SyncReport> {
        let state = self.cluster.lock();
        let mut installed = self.installed.lock();
        let table = self.table.as_ref();

        let link = self.host_link(&state.local)?;
        let mut report = SyncReport::default();

        for family in AddressFamily::ALL {
            match state.local.family(family).router_network() {
                Some(router_net) => {
                    if let Err(e) = ensure_nexthop_route(table, &link, router_net) {
                        report.record(SyncTarget::Nexthop, Some(router_net), &e);
                    }
                }
                None => debug!(family = %family, "No router address, skipping nexthop route"),
            }
        }

        let desired = desired_routes(table, &state);
        let mut claimed = HashSet::new();

        for DesiredRoute { target, route } in desired {
            let Some(prefix) = route.prefix.map(|p| p.trunc()) else {
                continue;
            };
            claimed.insert(prefix);

            let applied = match &target {
                SyncTarget::Node(_) => route.apply(table).map(|()| Some(route)),
                _ => self.replace_node_route(&state, prefix),
            };

            match applied {
                Ok(Some(route)) => {
                    report.routes_applied += 1;
                    installed.insert(prefix, InstalledRoute { target, route });
                }
                Ok(None) => {}
                Err(e) => report.record(target, Some(prefix), &e),
            }
        }
        report.nodes_synced = state.nodes.len();

        let stale: Vec<IpNet> = installed
            .keys()
            .filter(|prefix| !claimed.contains(*prefix))
            .copied()
            .collect();

        for prefix in stale {
            let Some(entry) = installed.remove(&prefix) else {
                continue;
            };
            match entry.route.withdraw(table) {
                Ok(()) => report.routes_withdrawn += 1,
                Err(RouteSyncError::Kernel(ref e)) if e.errno() == Some(libc::ESRCH) => {
                    debug!(route = %entry.route, "Route already gone");
                }
                Err(e) => {
                    report.record(entry.target.clone(), Some(prefix), &e);
                    installed.insert(prefix, entry);
                }
            }
        }

        if !report.is_clean() || report.routes_withdrawn > 0 {
            info!(
                nodes = report.nodes_synced,
                applied = report.routes_applied,
                withdrawn = report.routes_withdrawn,
                failures = report.failures.len(),
                encapsulation = state.local.encapsulation_enabled(),
                "Cluster routes synchronized"
            );
        }

        Ok(report)
    }

    /// Install the route for `prefix` via the cluster router on the host device
    ///
    /// Resolves the device, ensures the nexthop route of the prefix's family,
    /// then replaces the route. Returns `None` when the family has no router
    /// address. A nexthop failure is logged and does not stop the replace.
    pub fn replace_node_route(&self, state: &ClusterState, prefix: IpNet) -> Result<Option<Route>> {
        let table = self.table.as_ref();
        let link = self.host_link(&state.local)?;

        let Some(route) = router_route(&state.local, prefix) else {
            debug!(prefix = %prefix, "No router address for family, no route needed");
            return Ok(None);
        };

        let addressing = state.local.family(AddressFamily::of_prefix(&prefix));
        if let Some(router_net) = addressing.router_network() {
            if let Err(e) = ensure_nexthop_route(table, &link, router_net) {
                error!(error = %e, "Unable to add nexthop route");
            }
        }

        if let Err(e) = route.apply(table) {
            error!(route = %route, error = %e, "Unable to add node route");
            return Err(e);
        }

        Ok(Some(route))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::kernel::InMemoryRouteTable;
    use crate::types::RouteScope;
    use pretty_assertions::assert_eq;

    fn local() -> LocalNodeConfig {
        LocalNodeConfig {
            name: "node-a".into(),
            host_device: "cilium_host".into(),
            internal_ipv4: Some("10.0.0.1".parse().unwrap()),
            ipv4_alloc_range: Some("10.0.0.0/16".parse().unwrap()),
            ..Default::default()
        }
    }

    fn setup(per_node: bool) -> (Arc<InMemoryRouteTable>, RouteSynchronizer) {
        let table = Arc::new(InMemoryRouteTable::new().with_link("cilium_host", 5));
        let cluster = Arc::new(ClusterConfiguration::new(local(), per_node));
        cluster.upsert_node(
            Node::new("node-b")
                .with_ipv4("10.0.1.5".parse().unwrap())
                .with_ipv4_alloc_cidr("10.0.1.0/24".parse().unwrap()),
        );
        let sync = RouteSynchronizer::new(table.clone(), cluster);
        (table, sync)
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_missing_device_fails_pass() {
        let (table, sync) = setup(false);
        table.remove_link("cilium_host");
        assert!(matches!(
            sync.synchronize(),
            Err(RouteSyncError::DeviceNotFound(name)) if name == "cilium_host"
        ));
        assert_eq!(table.mutation_count(), 0);
    }

    #[test]
    fn test_fallback_mode() {
        let (table, sync) = setup(false);
        let report = sync.synchronize().unwrap();

        assert!(report.is_clean());
        assert_eq!(report.nodes_synced, 1);
        assert!(table.route_to(&net("10.0.1.0/24")).is_none());

        let nexthop = table.route_to(&net("10.0.0.1/32")).unwrap();
        assert_eq!(nexthop.scope, RouteScope::Link);
        let fallback = table.route_to(&net("10.0.0.0/16")).unwrap();
        assert_eq!(fallback.gateway, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_mode_flip_withdraws_routes() {
        let (table, sync) = setup(true);
        sync.synchronize().unwrap();
        assert!(table.route_to(&net("10.0.1.0/24")).is_some());
        assert!(table.route_to(&net("10.0.0.0/16")).is_none());

        sync.cluster().set_use_per_node_routes(false);
        let report = sync.synchronize().unwrap();
        assert_eq!(report.routes_withdrawn, 1);
        assert!(table.route_to(&net("10.0.1.0/24")).is_none());
        assert!(table.route_to(&net("10.0.0.0/16")).is_some());

        sync.cluster().set_use_per_node_routes(true);
        let report = sync.synchronize().unwrap();
        assert_eq!(report.routes_withdrawn, 1);
        assert!(table.route_to(&net("10.0.0.0/16")).is_none());
        assert!(table.route_to(&net("10.0.1.0/24")).is_some());
    }

    #[test]
    fn test_departed_node_route_withdrawn() {
        let (table, sync) = setup(true);
        sync.synchronize().unwrap();
        assert_eq!(sync.installed_count(), 1);

        sync.cluster().remove_node("node-b");
        let report = sync.synchronize().unwrap();
        assert_eq!(report.routes_withdrawn, 1);
        assert_eq!(sync.installed_count(), 0);
        assert!(table.route_to(&net("10.0.1.0/24")).is_none());
        // nexthop route stays
        assert!(table.route_to(&net("10.0.0.1/32")).is_some());
    }

    #[test]
    fn test_externally_removed_route_is_forgotten() {
        let (table, sync) = setup(true);
        sync.synchronize().unwrap();

        let route = table.route_to(&net("10.0.1.0/24")).unwrap();
        table.delete(&route).unwrap();
        sync.cluster().remove_node("node-b");

        let report = sync.synchronize().unwrap();
        assert!(report.is_clean());
        assert_eq!(sync.installed_count(), 0);
    }

    #[test]
    fn test_nexthop_failure_does_not_abort_pass() {
        let (table, sync) = setup(false);
        table.reject_destination(net("10.0.0.1/32"));

        let report = sync.synchronize().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, SyncTarget::Nexthop);
        assert!(table.route_to(&net("10.0.0.0/16")).is_some());
    }

    #[test]
    fn test_family_without_router_gets_nothing() {
        let (table, sync) = setup(false);
        sync.cluster().add_aux_prefix(net("fd00:10::/64"));

        let report = sync.synchronize().unwrap();
        assert!(report.is_clean());
        assert!(table
            .routes()
            .iter()
            .all(|r| r.family() == Some(AddressFamily::Ipv4)));
    }

    #[test]
    fn test_desired_routes_from_snapshot() {
        let (table, sync) = setup(false);
        sync.cluster().add_aux_prefix(net("172.20.0.0/16"));

        let state = sync.cluster().lock();
        let desired = desired_routes(table.as_ref(), &state);
        let targets: Vec<_> = desired.iter().map(|d| d.target.clone()).collect();
        assert_eq!(targets, vec![SyncTarget::Fallback, SyncTarget::AuxPrefix]);
        assert_eq!(table.mutation_count(), 0);
    }
}
