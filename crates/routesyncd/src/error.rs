//! Error types for routesyncd
//!
//! Three families, matching how far each one is allowed to travel:
//! - [`RouteSyncError`] aborts the current synchronization pass only.
//! - [`KernelError`] is recorded per route and never aborts sibling routes.
//! - [`ReachabilityError`] never leaves the route policy; it downgrades the
//!   routing decision.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Errors surfaced by a kernel route table adapter
#[derive(Debug, Error)]
pub enum KernelError {
    /// Netlink socket or message error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Device name could not be resolved to an interface index
    #[error("Link not found: {0}")]
    LinkNotFound(String),

    /// The kernel answered a request with a negative errno
    #[error("Kernel rejected {op} of route {route}: errno {code}")]
    Rejected {
        op: &'static str,
        route: String,
        code: i32,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Returns the errno carried by a kernel rejection, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Rejected { code, .. } => Some(code.abs()),
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Reasons a node IP is not reachable without an extra gateway hop
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReachabilityError {
    #[error("node IP of address family is not known")]
    NoAddressKnown,

    #[error("unable to determine route for node IP {ip}: {reason}")]
    RouteLookupFailed { ip: IpAddr, reason: String },

    #[error("no route exists to node IP {0}")]
    NoRouteExists(IpAddr),

    #[error("node IP {ip} is routed via another gateway {gateway}")]
    ExtraHopDetected { ip: IpAddr, gateway: IpAddr },
}

/// Errors that abort a synchronization pass or a single route operation
#[derive(Debug, Error)]
pub enum RouteSyncError {
    /// The host device is missing; fatal for the pass, retried next period
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No address family could be derived for a route
    #[error("Unable to resolve address family: {0}")]
    AddressFamilyUnresolvable(String),

    /// The L2 nexthop route for the router network could not be installed
    #[error("unable to add L2 nexthop route for {network}: {source}")]
    Nexthop {
        network: IpNet,
        #[source]
        source: KernelError,
    },

    /// Kernel route table operation failed
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for routesyncd operations
pub type Result<T> = std::result::Result<T, RouteSyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reachability_error_display() {
        let err = ReachabilityError::ExtraHopDetected {
            ip: "10.0.1.5".parse().unwrap(),
            gateway: "192.168.0.1".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "node IP 10.0.1.5 is routed via another gateway 192.168.0.1"
        );
    }

    #[test]
    fn test_kernel_rejection_errno() {
        let err = KernelError::Rejected {
            op: "replace",
            route: "dst=10.0.0.0/16".to_string(),
            code: -libc::EINVAL,
        };
        assert_eq!(err.errno(), Some(libc::EINVAL));
        assert_eq!(KernelError::LinkNotFound("eth9".into()).errno(), None);
    }

    #[test]
    fn test_nexthop_error_keeps_source() {
        use std::error::Error as _;

        let err = RouteSyncError::Nexthop {
            network: "10.0.0.1/32".parse().unwrap(),
            source: KernelError::Netlink("socket closed".into()),
        };
        assert!(err.to_string().contains("10.0.0.1/32"));
        assert!(err.source().is_some());
    }
}
