//! Route value
//!
//! A [`Route`] describes one desired kernel route. It is built fresh on every
//! synchronization pass and pushed to the kernel with replace semantics.

use crate::error::{Result, RouteSyncError};
use crate::kernel::RouteTable;
use crate::types::{AddressFamily, KernelRoute};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Desired kernel route
///
/// Every field is optional. A route with only `prefix` set is the placeholder
/// the policy returns when the cluster-wide fallback route covers the
/// destination; see [`Route::is_installable`].
#[derive(Debug, Clone, Default)]
pub struct Route {
    /// Egress device name
    pub link: Option<String>,
    /// Destination network; `None` means no destination restriction
    pub prefix: Option<IpNet>,
    /// Gateway
    pub via: Option<IpAddr>,
    /// Preferred source address
    pub source: Option<IpAddr>,
}

impl Route {
    /// Route with only the destination set
    pub fn for_prefix(prefix: IpNet) -> Self {
        Self {
            prefix: Some(prefix),
            ..Default::default()
        }
    }

    /// Returns true if the route carries a gateway or a device. Routes without
    /// either are placeholders and must not be sent to the kernel.
    pub fn is_installable(&self) -> bool {
        self.via.is_some() || self.link.is_some()
    }

    /// Address family of the route, taken from the prefix, then via, then source
    pub fn family(&self) -> Option<AddressFamily> {
        self.prefix
            .as_ref()
            .map(AddressFamily::of_prefix)
            .or_else(|| self.via.as_ref().map(AddressFamily::of_addr))
            .or_else(|| self.source.as_ref().map(AddressFamily::of_addr))
    }

    /// Convert into a kernel route spec, resolving `link` to its index
    pub fn to_kernel_route(&self, table: &dyn RouteTable) -> Result<KernelRoute> {
        if self.family().is_none() {
            return Err(RouteSyncError::AddressFamilyUnresolvable(self.to_string()));
        }

        let link_index = match &self.link {
            Some(name) => Some(
                table
                    .link_by_name(name)
                    .map_err(|_| RouteSyncError::DeviceNotFound(name.clone()))?
                    .index,
            ),
            None => None,
        };

        Ok(KernelRoute {
            destination: self.prefix.map(|p| p.trunc()),
            gateway: self.via.map(|ip| ip.to_canonical()),
            source: self.source.map(|ip| ip.to_canonical()),
            link_index,
            ..Default::default()
        })
    }

    /// Install or replace the route in the kernel table
    pub fn apply(&self, table: &dyn RouteTable) -> Result<()> {
        let kernel_route = self.to_kernel_route(table)?;
        table.replace(&kernel_route)?;
        debug!(route = %self, "Installed route");
        Ok(())
    }

    /// Delete the route from the kernel table
    pub fn withdraw(&self, table: &dyn RouteTable) -> Result<()> {
        let kernel_route = self.to_kernel_route(table)?;
        table.delete(&kernel_route)?;
        debug!(route = %self, "Removed route");
        Ok(())
    }
}

fn same_addr(a: &Option<IpAddr>, b: &Option<IpAddr>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.to_canonical() == b.to_canonical(),
        _ => false,
    }
}

fn same_prefix(a: &Option<IpNet>, b: &Option<IpNet>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.trunc() == b.trunc(),
        _ => false,
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.link == other.link
            && same_addr(&self.via, &other.via)
            && same_addr(&self.source, &other.source)
            && same_prefix(&self.prefix, &other.prefix)
    }
}

impl Eq for Route {}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_none<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "<none>".to_string())
        }

        write!(
            f,
            "prefix={} link={} via={} source={}",
            or_none(&self.prefix),
            or_none(&self.link),
            or_none(&self.via),
            or_none(&self.source)
        )
    }
}
