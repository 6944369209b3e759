//! Nexthop route installer
//!
//! Every per-node and fallback route uses the cluster router IP as its
//! gateway. The router IP itself is made reachable by a link-scoped host
//! route on the local device, installed here.

use crate::error::{Result, RouteSyncError};
use crate::kernel::RouteTable;
use crate::types::{AddressFamily, KernelRoute, Link, RouteScope};
use ipnet::IpNet;
use tracing::{debug, error, instrument};

/// Find a route on `link` matching `filter`
///
/// The filter's link index, scope, destination (address, prefix length and
/// family) and gateway must all match. A filter without a destination only
/// matches default routes and vice versa. Listing errors count as "not found".
pub fn find_route(
    table: &dyn RouteTable,
    link: &Link,
    filter: &KernelRoute,
) -> Option<KernelRoute> {
    let family = filter.family()?;
    let routes = table.list(link, family).ok()?;

    routes.into_iter().find(|r| {
        let same_destination = match (&r.destination, &filter.destination) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                a.prefix_len() == b.prefix_len()
                    && a.max_prefix_len() == b.max_prefix_len()
                    && a.addr().to_canonical() == b.addr().to_canonical()
            }
            _ => false,
        };

        same_destination
            && r.link_index == filter.link_index
            && r.scope == filter.scope
            && r.gateway.map(|ip| ip.to_canonical()) == filter.gateway.map(|ip| ip.to_canonical())
    })
}

/// Link-scoped route making `router_net` reachable through `link`
pub fn nexthop_route(link: &Link, router_net: IpNet) -> KernelRoute {
    KernelRoute {
        destination: Some(router_net),
        link_index: Some(link.index),
        scope: RouteScope::Link,
        ..Default::default()
    }
}

/// Single-host network of the router address (/32 or /128)
pub fn router_network(router: std::net::IpAddr) -> IpNet {
    let router = router.to_canonical();
    let len = AddressFamily::of_addr(&router).host_prefix_len();
    // A host prefix length is always valid for its own family
    IpNet::new(router, len).unwrap_or_else(|_| IpNet::from(router))
}

/// Ensure the L2 nexthop route for `router_net` exists on `link`
///
/// Only issues a replace if no matching entry is present. Does not retry;
/// the next synchronization pass does.
#[instrument(skip(table, link), fields(device = %link.name))]
pub fn ensure_nexthop_route(table: &dyn RouteTable, link: &Link, router_net: IpNet) -> Result<()> {
    let route = nexthop_route(link, router_net);

    if find_route(table, link, &route).is_some() {
        return Ok(());
    }

    if let Err(e) = table.replace(&route) {
        error!(route = %route, error = %e, "Unable to add L2 nexthop route");
        return Err(RouteSyncError::Nexthop {
            network: router_net,
            source: e,
        });
    }

    debug!(route = %route, "Added L2 nexthop route");
    Ok(())
}
