//! In-memory kernel route table
//!
//! Models the parts of the main routing table the reconciliation loop relies
//! on: replace keyed by destination, delete of an existing entry, and
//! longest-prefix-match lookups. Used by the tests and by `--dry-run`.

use crate::error::KernelError;
use crate::kernel::{KernelResult, RouteTable};
use crate::types::{AddressFamily, KernelRoute, Link};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Default)]
struct TableState {
    links: HashMap<String, u32>,
    routes: Vec<KernelRoute>,
    rejected: HashSet<IpNet>,
    replace_calls: usize,
    mutations: usize,
}

/// Route table kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryRouteTable {
    state: Mutex<TableState>,
}

impl InMemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_link`](Self::add_link)
    pub fn with_link(self, name: &str, index: u32) -> Self {
        self.add_link(name, index);
        self
    }

    /// Register a device so `link_by_name` can resolve it
    pub fn add_link(&self, name: &str, index: u32) {
        self.state.lock().links.insert(name.to_string(), index);
    }

    /// Remove a device and every route bound to it, as the kernel does
    pub fn remove_link(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(index) = state.links.remove(name) {
            state.routes.retain(|r| r.link_index != Some(index));
        }
    }

    /// Seed a route without counting it as a mutation (routes owned by other
    /// processes, connected subnets, default route)
    pub fn seed(&self, route: KernelRoute) {
        let mut state = self.state.lock();
        upsert(&mut state.routes, route);
    }

    /// Make every later replace of `destination` fail with EINVAL
    pub fn reject_destination(&self, destination: IpNet) {
        self.state.lock().rejected.insert(destination.trunc());
    }

    /// Stop rejecting `destination`
    pub fn accept_destination(&self, destination: &IpNet) {
        self.state.lock().rejected.remove(&destination.trunc());
    }

    /// Snapshot of all routes
    pub fn routes(&self) -> Vec<KernelRoute> {
        self.state.lock().routes.clone()
    }

    /// The entry for a destination, if any
    pub fn route_to(&self, destination: &IpNet) -> Option<KernelRoute> {
        let destination = destination.trunc();
        self.state
            .lock()
            .routes
            .iter()
            .find(|r| r.destination.map(|d| d.trunc()) == Some(destination))
            .cloned()
    }

    /// Number of replace/delete calls that changed the table
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    /// Number of replace calls issued, effective or not
    pub fn replace_count(&self) -> usize {
        self.state.lock().replace_calls
    }
}

/// Insert or overwrite the entry with the same destination. Returns true if
/// the table changed.
fn upsert(routes: &mut Vec<KernelRoute>, mut route: KernelRoute) -> bool {
    route.destination = route.destination.map(|d| d.trunc());
    let family = route.family();
    let existing = routes
        .iter_mut()
        .find(|r| r.destination == route.destination && r.family() == family);

    match existing {
        Some(entry) if *entry == route => false,
        Some(entry) => {
            *entry = route;
            true
        }
        None => {
            routes.push(route);
            true
        }
    }
}

impl RouteTable for InMemoryRouteTable {
    fn link_by_name(&self, name: &str) -> KernelResult<Link> {
        self.state
            .lock()
            .links
            .get(name)
            .map(|index| Link::new(name, *index))
            .ok_or_else(|| KernelError::LinkNotFound(name.to_string()))
    }

    fn list(&self, link: &Link, family: AddressFamily) -> KernelResult<Vec<KernelRoute>> {
        Ok(self
            .state
            .lock()
            .routes
            .iter()
            .filter(|r| r.link_index == Some(link.index) && r.family() == Some(family))
            .cloned()
            .collect())
    }

    fn get(&self, destination: IpAddr) -> KernelResult<Vec<KernelRoute>> {
        let destination = destination.to_canonical();
        Ok(self
            .state
            .lock()
            .routes
            .iter()
            .filter(|r| r.covers(&destination))
            .max_by_key(|r| r.prefix_len())
            .cloned()
            .into_iter()
            .collect())
    }

    fn replace(&self, route: &KernelRoute) -> KernelResult<()> {
        let mut state = self.state.lock();
        state.replace_calls += 1;

        if route.family().is_none() {
            return Err(KernelError::Rejected {
                op: "replace",
                route: route.to_string(),
                code: -libc::EINVAL,
            });
        }
        if let Some(dst) = route.destination {
            if state.rejected.contains(&dst.trunc()) {
                return Err(KernelError::Rejected {
                    op: "replace",
                    route: route.to_string(),
                    code: -libc::EINVAL,
                });
            }
        }
        if let Some(index) = route.link_index {
            if !state.links.values().any(|i| *i == index) {
                return Err(KernelError::Rejected {
                    op: "replace",
                    route: route.to_string(),
                    code: -libc::ENODEV,
                });
            }
        }

        if upsert(&mut state.routes, route.clone()) {
            state.mutations += 1;
            debug!(route = %route, "memory table: route replaced");
        }
        Ok(())
    }

    fn delete(&self, route: &KernelRoute) -> KernelResult<()> {
        let mut state = self.state.lock();
        let destination = route.destination.map(|d| d.trunc());
        let family = route.family();
        let position = state.routes.iter().position(|r| {
            r.destination == destination
                && r.family() == family
                && (route.gateway.is_none() || r.gateway == route.gateway)
                && (route.link_index.is_none() || r.link_index == route.link_index)
                && (route.source.is_none() || r.source == route.source)
        });

        match position {
            Some(pos) => {
                state.routes.remove(pos);
                state.mutations += 1;
                debug!(route = %route, "memory table: route deleted");
                Ok(())
            }
            None => Err(KernelError::Rejected {
                op: "delete",
                route: route.to_string(),
                code: -libc::ESRCH,
            }),
        }
    }
}
