//! Reconciliation tests against the in-memory routing table

use ipnet::IpNet;
use pretty_assertions::assert_eq;
use routesyncd::{
    AddressFamily, ClusterConfiguration, InMemoryRouteTable, KernelRoute, LocalNodeConfig, Node,
    Route, RoutePolicy, RouteScope, RouteSynchronizer, RouteTable, SyncTarget,
};
use std::net::IpAddr;
use std::sync::Arc;

const HOST_DEVICE: &str = "cilium_host";
const HOST_INDEX: u32 = 5;

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn local_config(direct_routing: bool) -> LocalNodeConfig {
    LocalNodeConfig {
        name: "node-a".into(),
        host_device: HOST_DEVICE.into(),
        internal_ipv4: Some("10.0.0.1".parse().unwrap()),
        ipv6: Some("f00d::a".parse().unwrap()),
        ipv6_router: Some("f00d::1".parse().unwrap()),
        ipv4_alloc_range: Some("10.0.0.0/16".parse().unwrap()),
        ipv6_alloc_range: Some("f00d::/96".parse().unwrap()),
        direct_routing,
        ..Default::default()
    }
}

fn remote_node() -> Node {
    Node::new("node-b")
        .with_ipv4("10.0.1.5".parse().unwrap())
        .with_ipv4_alloc_cidr("10.0.1.0/24".parse().unwrap())
}

struct Harness {
    table: Arc<InMemoryRouteTable>,
    sync: RouteSynchronizer,
}

impl Harness {
    fn new(local: LocalNodeConfig, per_node: bool) -> Self {
        let table = Arc::new(InMemoryRouteTable::new().with_link(HOST_DEVICE, HOST_INDEX));
        let cluster = Arc::new(ClusterConfiguration::new(local, per_node));
        let sync = RouteSynchronizer::new(table.clone(), cluster);
        Self { table, sync }
    }

    fn cluster(&self) -> &ClusterConfiguration {
        self.sync.cluster()
    }

    fn sorted_routes(&self) -> Vec<KernelRoute> {
        let mut routes = self.table.routes();
        routes.sort_by_key(|r| r.destination.map(|d| d.to_string()));
        routes
    }
}

#[test]
fn test_end_to_end_fallback_scenario() {
    let local = LocalNodeConfig {
        ipv6: None,
        ipv6_router: None,
        ipv6_alloc_range: None,
        ..local_config(false)
    };
    let h = Harness::new(local, false);
    h.cluster().upsert_node(remote_node());

    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());

    assert_eq!(
        h.sorted_routes(),
        vec![
            KernelRoute {
                destination: Some(net("10.0.0.0/16")),
                gateway: Some(ip("10.0.0.1")),
                source: Some(ip("10.0.0.1")),
                link_index: Some(HOST_INDEX),
                scope: RouteScope::Universe,
            },
            KernelRoute {
                destination: Some(net("10.0.0.1/32")),
                gateway: None,
                source: None,
                link_index: Some(HOST_INDEX),
                scope: RouteScope::Link,
            },
        ]
    );
    assert!(h.table.route_to(&net("10.0.1.0/24")).is_none());
}

#[test]
fn test_synchronize_is_idempotent() {
    let h = Harness::new(local_config(false), true);
    h.cluster().upsert_node(remote_node());
    h.cluster().upsert_node(
        Node::new("node-a").with_ipv4_alloc_cidr("10.0.0.0/24".parse().unwrap()),
    );
    h.cluster().add_aux_prefix(net("172.20.0.0/16"));

    h.sync.synchronize().unwrap();
    let first = h.sorted_routes();
    let mutations = h.table.mutation_count();

    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.routes_withdrawn, 0);
    assert_eq!(h.sorted_routes(), first);
    assert_eq!(h.table.mutation_count(), mutations);
}

#[test]
fn test_dual_stack_nexthop_routes() {
    let h = Harness::new(local_config(false), false);
    h.sync.synchronize().unwrap();

    let v6_nexthop = h.table.route_to(&net("f00d::1/128")).unwrap();
    assert_eq!(v6_nexthop.scope, RouteScope::Link);

    let v6_fallback = h.table.route_to(&net("f00d::/96")).unwrap();
    assert_eq!(v6_fallback.gateway, Some(ip("f00d::1")));
    assert_eq!(v6_fallback.source, Some(ip("f00d::a")));
}

#[test]
fn test_direct_routing_on_shared_segment() {
    let h = Harness::new(local_config(true), true);
    h.table.add_link("eth0", 2);
    h.table.seed(KernelRoute {
        destination: Some(net("10.0.1.0/28")),
        link_index: Some(2),
        scope: RouteScope::Link,
        ..Default::default()
    });
    h.cluster().upsert_node(remote_node());

    h.sync.synchronize().unwrap();

    let route = h.table.route_to(&net("10.0.1.0/24")).unwrap();
    assert_eq!(route.gateway, Some(ip("10.0.1.5")));
    assert_eq!(route.link_index, None);
}

#[test]
fn test_direct_routing_downgrade_on_extra_hop() {
    let h = Harness::new(local_config(true), true);
    h.table.add_link("eth0", 2);
    h.table.seed(KernelRoute {
        gateway: Some(ip("192.168.0.1")),
        link_index: Some(2),
        ..Default::default()
    });
    h.cluster().upsert_node(remote_node());

    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());

    let route = h.table.route_to(&net("10.0.1.0/24")).unwrap();
    assert_ne!(route.gateway, Some(ip("10.0.1.5")));
    assert_eq!(route.gateway, Some(ip("10.0.0.1")));
    assert_eq!(route.link_index, Some(HOST_INDEX));
}

#[test]
fn test_local_node_bias() {
    let h = Harness::new(local_config(true), false);
    h.cluster().upsert_node(
        Node::new("node-a")
            .with_ipv4("192.168.0.10".parse().unwrap())
            .with_ipv4_alloc_cidr("10.0.0.0/24".parse().unwrap()),
    );

    let table: &dyn RouteTable = h.table.as_ref();
    let state = h.cluster().lock();
    let policy = RoutePolicy::new(table, &state.local, state.use_per_node_routes);
    let route = policy.generate_route(&state.nodes["node-a"], net("10.0.0.0/24"));

    assert_eq!(
        route,
        Route {
            link: Some(HOST_DEVICE.into()),
            prefix: Some(net("10.0.0.0/24")),
            via: Some(ip("10.0.0.1")),
            source: Some(ip("10.0.0.1")),
        }
    );
}

#[test]
fn test_aux_prefix_independence() {
    let h = Harness::new(local_config(false), true);
    h.cluster().add_aux_prefix(net("172.20.0.0/16"));
    h.cluster().add_aux_prefix(net("172.30.0.0/16"));
    h.table.reject_destination(net("172.20.0.0/16"));

    let report = h.sync.synchronize().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, SyncTarget::AuxPrefix);
    assert_eq!(report.failures[0].prefix, Some(net("172.20.0.0/16")));
    assert_eq!(report.failures[0].family, Some(AddressFamily::Ipv4));
    assert!(h.table.route_to(&net("172.20.0.0/16")).is_none());
    assert!(h.table.route_to(&net("172.30.0.0/16")).is_some());

    // Converges once the kernel accepts it
    h.table.accept_destination(&net("172.20.0.0/16"));
    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());
    assert!(h.table.route_to(&net("172.20.0.0/16")).is_some());
}

#[test]
fn test_node_route_failure_does_not_block_others() {
    let h = Harness::new(local_config(false), true);
    h.cluster().upsert_node(remote_node());
    h.cluster().upsert_node(
        Node::new("node-c").with_ipv4_alloc_cidr("10.0.2.0/24".parse().unwrap()),
    );
    h.table.reject_destination(net("10.0.1.0/24"));

    let report = h.sync.synchronize().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, SyncTarget::Node("node-b".into()));
    assert!(h.table.route_to(&net("10.0.2.0/24")).is_some());
}

/// Aux prefixes overlapping the allocation range are installed alongside the
/// fallback route; both entries coexist in the table.
#[test]
fn test_known_overlap_aux_prefix_and_fallback() {
    let h = Harness::new(local_config(false), false);
    h.cluster().add_aux_prefix(net("10.0.0.0/8"));
    h.cluster().add_aux_prefix(net("10.0.128.0/17"));

    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());

    for prefix in ["10.0.0.0/8", "10.0.0.0/16", "10.0.128.0/17"] {
        let route = h.table.route_to(&net(prefix)).unwrap();
        assert_eq!(route.gateway, Some(ip("10.0.0.1")), "{prefix}");
    }
}

#[test]
fn test_route_drift_is_healed() {
    let h = Harness::new(local_config(false), true);
    h.cluster().upsert_node(remote_node());
    h.sync.synchronize().unwrap();

    // Another process rewrites the node route
    h.table
        .replace(&KernelRoute {
            destination: Some(net("10.0.1.0/24")),
            gateway: Some(ip("10.0.0.99")),
            ..Default::default()
        })
        .unwrap();

    h.sync.synchronize().unwrap();
    let route = h.table.route_to(&net("10.0.1.0/24")).unwrap();
    assert_eq!(route.gateway, Some(ip("10.0.0.1")));
    assert_eq!(route.link_index, Some(HOST_INDEX));
}

#[test]
fn test_missing_nexthop_route_is_restored() {
    let h = Harness::new(local_config(false), true);
    h.sync.synchronize().unwrap();

    let nexthop = h.table.route_to(&net("10.0.0.1/32")).unwrap();
    h.table.delete(&nexthop).unwrap();

    h.sync.synchronize().unwrap();
    assert!(h.table.route_to(&net("10.0.0.1/32")).is_some());
}

#[test]
fn test_route_equality_properties() {
    let a = Route {
        link: Some(HOST_DEVICE.into()),
        prefix: Some(net("10.0.0.0/24")),
        via: Some(ip("10.0.0.1")),
        source: None,
    };
    let rebuilt = Route {
        prefix: Some(IpNet::new(ip("10.0.0.0"), 24).unwrap()),
        ..a.clone()
    };
    let other = Route {
        prefix: Some(net("10.0.1.0/24")),
        ..a.clone()
    };

    assert_eq!(a, a);
    assert_eq!(a, rebuilt);
    assert_eq!(rebuilt, a);
    assert_ne!(a, other);
    assert_ne!(other, a);
}

#[test]
fn test_no_per_node_route_for_family_without_router() {
    let local = LocalNodeConfig {
        ipv6: None,
        ipv6_router: None,
        ipv6_alloc_range: None,
        ..local_config(false)
    };
    let h = Harness::new(local, true);
    h.cluster().upsert_node(
        Node::new("node-b").with_ipv6_alloc_cidr("f00d:0:0:1::/64".parse().unwrap()),
    );

    let report = h.sync.synchronize().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.routes_applied, 0);
    assert!(h.table.route_to(&net("f00d:0:0:1::/64")).is_none());
    assert!(h
        .table
        .routes()
        .iter()
        .all(|r| r.family() == Some(AddressFamily::Ipv4)));
}
