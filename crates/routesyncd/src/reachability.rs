//! L2 reachability validation
//!
//! A peer can be routed to directly only if the kernel's best route towards
//! its IP has no gateway, i.e. the peer sits on the same broadcast domain.

use crate::error::ReachabilityError;
use crate::kernel::RouteTable;
use std::net::IpAddr;
use tracing::trace;

/// Check that `node_ip` is reachable without an extra gateway hop
pub fn validate_direct_reachability(
    table: &dyn RouteTable,
    node_ip: Option<IpAddr>,
) -> Result<(), ReachabilityError> {
    let ip = node_ip.ok_or(ReachabilityError::NoAddressKnown)?;

    let routes = table
        .get(ip)
        .map_err(|e| ReachabilityError::RouteLookupFailed {
            ip,
            reason: e.to_string(),
        })?;

    let best = routes.first().ok_or(ReachabilityError::NoRouteExists(ip))?;

    if let Some(gateway) = best.gateway {
        return Err(ReachabilityError::ExtraHopDetected { ip, gateway });
    }

    trace!(node_ip = %ip, "node IP is directly reachable");
    Ok(())
}
