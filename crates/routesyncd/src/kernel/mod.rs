//! Kernel route table adapter
//!
//! The reconciliation logic only talks to the kernel through [`RouteTable`].
//! [`NetlinkRouteTable`] is the production implementation on Linux;
//! [`InMemoryRouteTable`] backs the tests and `--dry-run`.

pub mod memory;
pub mod netlink;

pub use memory::InMemoryRouteTable;
pub use netlink::NetlinkRouteTable;

use crate::error::KernelError;
use crate::types::{AddressFamily, KernelRoute, Link};
use std::net::IpAddr;

/// Result type for kernel route table operations
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Operations the reconciliation core needs from the kernel routing table.
///
/// All entries live in the main table. `replace` must be idempotent:
/// replacing an entry with an identical one leaves the table unchanged.
#[cfg_attr(test, mockall::automock)]
pub trait RouteTable: Send + Sync {
    /// Resolve a device name, failing with [`KernelError::LinkNotFound`]
    fn link_by_name(&self, name: &str) -> KernelResult<Link>;

    /// List main-table routes of one family bound to the device
    fn list(&self, link: &Link, family: AddressFamily) -> KernelResult<Vec<KernelRoute>>;

    /// Best-match routes the kernel would use for `destination`, possibly empty
    fn get(&self, destination: IpAddr) -> KernelResult<Vec<KernelRoute>>;

    /// Add the route or replace the entry with the same destination
    fn replace(&self, route: &KernelRoute) -> KernelResult<()>;

    /// Delete the route
    fn delete(&self, route: &KernelRoute) -> KernelResult<()>;
}
