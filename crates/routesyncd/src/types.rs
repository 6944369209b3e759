//! Core types shared by the kernel adapter and the reconciliation logic

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// IP address family
///
/// Replaces ad-hoc "does this parse as v4" checks: every family-specific
/// lookup goes through this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Both families, in the order passes process them
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Ipv4, AddressFamily::Ipv6];

    /// Family of an address. IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of_addr(ip: &IpAddr) -> Self {
        match ip.to_canonical() {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// Family of a prefix, decided by its network address
    pub fn of_prefix(prefix: &IpNet) -> Self {
        Self::of_addr(&prefix.addr())
    }

    /// Prefix length of a single-host network (/32 or /128)
    pub const fn host_prefix_len(self) -> u8 {
        match self {
            Self::Ipv4 => 32,
            Self::Ipv6 => 128,
        }
    }

    /// Display name used in logs
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route scope (RT_SCOPE_* from linux/rtnetlink.h)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RouteScope {
    /// RT_SCOPE_UNIVERSE - global route
    #[default]
    Universe,
    /// RT_SCOPE_LINK - destination is directly attached to the device
    Link,
    /// RT_SCOPE_HOST - local address
    Host,
}

impl fmt::Display for RouteScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Universe => f.write_str("global"),
            Self::Link => f.write_str("link"),
            Self::Host => f.write_str("host"),
        }
    }
}

/// Network device resolved from its name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub name: String,
    pub index: u32,
}

impl Link {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// A kernel routing table entry in the main table
///
/// This is what the kernel adapter reads and writes. `None` fields are left
/// out of the request; a `None` destination is the default route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KernelRoute {
    pub destination: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub link_index: Option<u32>,
    pub scope: RouteScope,
}

impl KernelRoute {
    /// Address family of the entry, taken from the first populated address
    pub fn family(&self) -> Option<AddressFamily> {
        self.destination
            .as_ref()
            .map(AddressFamily::of_prefix)
            .or_else(|| self.gateway.as_ref().map(AddressFamily::of_addr))
            .or_else(|| self.source.as_ref().map(AddressFamily::of_addr))
    }

    /// Returns true if `ip` falls inside the destination (the default route
    /// covers everything of its family)
    pub fn covers(&self, ip: &IpAddr) -> bool {
        match &self.destination {
            Some(dst) => dst.contains(ip),
            None => self.family() == Some(AddressFamily::of_addr(ip)),
        }
    }

    /// Destination prefix length, 0 for the default route
    pub fn prefix_len(&self) -> u8 {
        self.destination.map(|d| d.prefix_len()).unwrap_or(0)
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.destination {
            Some(dst) => write!(f, "dst={}", dst)?,
            None => f.write_str("dst=default")?,
        }
        if let Some(gw) = &self.gateway {
            write!(f, " gw={}", gw)?;
        }
        if let Some(src) = &self.source {
            write!(f, " src={}", src)?;
        }
        if let Some(oif) = self.link_index {
            write!(f, " oif={}", oif)?;
        }
        write!(f, " scope={}", self.scope)
    }
}
