//! Node Route Reconciliation Daemon
//!
//! This crate keeps the kernel routing table of a cluster node converged to
//! the routes the cluster's routing mode calls for: the L2 nexthop route to
//! the cluster router, one route per node allocation CIDR (direct or via the
//! router), the cluster-wide allocation range fallback route and any
//! auxiliary prefixes.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Kernel netlink requires CAP_NET_ADMIN |
//! | AU-12 | Audit Record Generation | Route installs and withdrawals logged |
//! | CM-6 | Configuration Settings | TOML configuration with validation |
//! | CP-10 | System Recovery | Level-triggered passes heal drift |
//! | SI-11 | Error Handling | Structured error types, per-route failures |
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +----------------------+     +----------------+
//! | Kvstore (lease,  |---->| ClusterConfiguration |     | Linux Kernel   |
//! |  node records)   |     |   (nodes, prefixes)  |     |                |
//! +------------------+     +----------+-----------+     |  Main routing  |
//!                                     |                 |  table         |
//!                                     v                 |                |
//!                          +----------------------+     |                |
//!                          |  RouteSynchronizer   |---->|  RTM_NEWROUTE  |
//!                          |    RoutePolicy       |     |  RTM_DELROUTE  |
//!                          |    nexthop installer |<----|  RTM_GETROUTE  |
//!                          +----------------------+     +----------------+
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod kernel;
pub mod nexthop;
pub mod policy;
pub mod reachability;
pub mod route;
pub mod sync;
pub mod types;

pub use cluster::{ClusterConfiguration, FamilyAddressing, LocalNodeConfig, Node, RoutingMode};
pub use config::RoutesyncConfig;
pub use error::{KernelError, ReachabilityError, Result, RouteSyncError};
pub use kernel::{InMemoryRouteTable, NetlinkRouteTable, RouteTable};
pub use nexthop::{ensure_nexthop_route, find_route};
pub use policy::RoutePolicy;
pub use reachability::validate_direct_reachability;
pub use route::Route;
pub use sync::{RouteSynchronizer, SyncFailure, SyncReport, SyncTarget};
pub use types::{AddressFamily, KernelRoute, Link, RouteScope};
