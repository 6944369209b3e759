//! Netlink-backed kernel route table
//!
//! Talks RTM_NEWROUTE / RTM_DELROUTE / RTM_GETROUTE over a blocking
//! NETLINK_ROUTE socket. Requests are serialized through one socket; each
//! call waits for its own ACK, dump completion or reply.

#[cfg(target_os = "linux")]
mod linux {
    use crate::error::KernelError;
    use crate::kernel::{KernelResult, RouteTable};
    use crate::types::{AddressFamily, KernelRoute, Link, RouteScope};
    use ipnet::IpNet;
    use netlink_packet_core::{
        NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REPLACE, NLM_F_REQUEST, NetlinkHeader,
        NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol,
        RouteScope as NlRouteScope, RouteType,
    };
    use netlink_packet_route::{AddressFamily as NlAddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use parking_lot::Mutex;
    use std::net::IpAddr;
    use tracing::{debug, instrument, trace};

    /// Receive buffer capacity; the kernel splits dumps into datagrams
    /// smaller than this
    const RECV_BUFFER_SIZE: usize = 64 * 1024;

    /// How a request is completed by the kernel
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Completion {
        /// Wait for NLMSG_ERROR with code 0
        Ack,
        /// Collect messages until NLMSG_DONE
        Dump,
        /// A single reply message (RTM_GETROUTE for one destination)
        Single,
    }

    struct SocketState {
        socket: Socket,
        buffer: Vec<u8>,
        sequence: u32,
    }

    /// Kernel route table accessed through rtnetlink
    pub struct NetlinkRouteTable {
        state: Mutex<SocketState>,
    }

    impl NetlinkRouteTable {
        /// Open and connect a NETLINK_ROUTE socket
        #[instrument]
        pub fn new() -> KernelResult<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| KernelError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind_auto()
                .map_err(|e| KernelError::Netlink(format!("Failed to bind socket: {}", e)))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| KernelError::Netlink(format!("Failed to connect socket: {}", e)))?;

            debug!("Netlink route socket connected");

            Ok(Self {
                state: Mutex::new(SocketState {
                    socket,
                    buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
                    sequence: 0,
                }),
            })
        }

        /// Send one request and collect the route messages of its reply
        fn request(
            &self,
            op: &'static str,
            message: RouteNetlinkMessage,
            flags: u16,
            completion: Completion,
            describe: &dyn Fn() -> String,
        ) -> KernelResult<Vec<RouteMessage>> {
            let mut state = self.state.lock();
            state.sequence = state.sequence.wrapping_add(1);
            let sequence = state.sequence;

            let mut header = NetlinkHeader::default();
            header.flags = flags;
            header.sequence_number = sequence;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            state.socket.send(&buf, 0).map_err(|e| {
                KernelError::Netlink(format!("Failed to send {} request: {}", op, e))
            })?;

            let mut replies = Vec::new();
            loop {
                let SocketState { socket, buffer, .. } = &mut *state;
                buffer.clear();
                let len = socket
                    .recv(buffer, 0)
                    .map_err(|e| KernelError::Netlink(format!("Failed to receive: {}", e)))?;

                let mut offset = 0;
                while offset < len {
                    let bytes = &buffer[offset..len];
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(bytes)
                        .map_err(|e| {
                            KernelError::Netlink(format!("Failed to parse message: {}", e))
                        })?;

                    let msg_len = msg.header.length as usize;
                    if msg_len == 0 {
                        return Err(KernelError::Netlink("Zero-length netlink message".into()));
                    }
                    // Align to 4 bytes (netlink alignment requirement)
                    offset = (offset + msg_len + 3) & !3;

                    if msg.header.sequence_number != sequence {
                        trace!(
                            expected = sequence,
                            got = msg.header.sequence_number,
                            "Skipping stale netlink message"
                        );
                        continue;
                    }

                    match msg.payload {
                        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                            replies.push(route);
                            if completion == Completion::Single {
                                return Ok(replies);
                            }
                        }
                        NetlinkPayload::Error(err) => {
                            if err.code.is_none() {
                                return Ok(replies);
                            }
                            return Err(KernelError::Rejected {
                                op,
                                route: describe(),
                                code: err.raw_code(),
                            });
                        }
                        NetlinkPayload::Done(_) => return Ok(replies),
                        _ => {}
                    }
                }
            }
        }
    }

    impl RouteTable for NetlinkRouteTable {
        #[instrument(skip(self))]
        fn link_by_name(&self, name: &str) -> KernelResult<Link> {
            let index = nix::net::if_::if_nametoindex(name)
                .map_err(|_| KernelError::LinkNotFound(name.to_string()))?;
            Ok(Link::new(name, index))
        }

        #[instrument(skip(self), fields(link = %link.name))]
        fn list(&self, link: &Link, family: AddressFamily) -> KernelResult<Vec<KernelRoute>> {
            let mut message = RouteMessage::default();
            message.header.address_family = nl_family(family);

            let replies = self.request(
                "list",
                RouteNetlinkMessage::GetRoute(message),
                NLM_F_REQUEST | NLM_F_DUMP,
                Completion::Dump,
                &|| format!("dump {} dev {}", family, link.name),
            )?;

            let routes: Vec<KernelRoute> = replies
                .iter()
                .filter(|msg| route_table_id(msg) == u32::from(RouteHeader::RT_TABLE_MAIN))
                .filter_map(from_route_message)
                .filter(|route| route.link_index == Some(link.index))
                .collect();

            trace!(count = routes.len(), "Listed kernel routes");
            Ok(routes)
        }

        #[instrument(skip(self))]
        fn get(&self, destination: IpAddr) -> KernelResult<Vec<KernelRoute>> {
            let message = get_request(destination);

            let replies = self.request(
                "get",
                RouteNetlinkMessage::GetRoute(message),
                NLM_F_REQUEST,
                Completion::Single,
                &|| destination.to_string(),
            )?;

            Ok(replies.iter().filter_map(from_route_message).collect())
        }

        #[instrument(skip(self), fields(route = %route))]
        fn replace(&self, route: &KernelRoute) -> KernelResult<()> {
            let message = to_route_message(route)?;
            self.request(
                "replace",
                RouteNetlinkMessage::NewRoute(message),
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
                Completion::Ack,
                &|| route.to_string(),
            )?;
            Ok(())
        }

        #[instrument(skip(self), fields(route = %route))]
        fn delete(&self, route: &KernelRoute) -> KernelResult<()> {
            let message = to_route_message(route)?;
            self.request(
                "delete",
                RouteNetlinkMessage::DelRoute(message),
                NLM_F_REQUEST | NLM_F_ACK,
                Completion::Ack,
                &|| route.to_string(),
            )?;
            Ok(())
        }
    }

    fn nl_family(family: AddressFamily) -> NlAddressFamily {
        match family {
            AddressFamily::Ipv4 => NlAddressFamily::Inet,
            AddressFamily::Ipv6 => NlAddressFamily::Inet6,
        }
    }

    fn route_address(ip: IpAddr) -> RouteAddress {
        match ip {
            IpAddr::V4(v4) => RouteAddress::Inet(v4),
            IpAddr::V6(v6) => RouteAddress::Inet6(v6),
        }
    }

    fn ip_from_route_address(addr: &RouteAddress) -> Option<IpAddr> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }

    /// Best-route lookup for a single address. IPv4-mapped IPv6 addresses
    /// are sent as IPv4 so header and attribute agree on the family.
    fn get_request(destination: IpAddr) -> RouteMessage {
        let destination = destination.to_canonical();
        let family = AddressFamily::of_addr(&destination);

        let mut message = RouteMessage::default();
        message.header.address_family = nl_family(family);
        message.header.destination_prefix_length = family.host_prefix_len();
        message
            .attributes
            .push(RouteAttribute::Destination(route_address(destination)));
        message
    }

    /// Build the wire message. Defaults follow `ip route replace`: main
    /// table, boot protocol, unicast.
    fn to_route_message(route: &KernelRoute) -> KernelResult<RouteMessage> {
        let family = route
            .family()
            .ok_or_else(|| KernelError::Netlink(format!("route {} has no address", route)))?;

        let mut message = RouteMessage::default();
        message.header.address_family = nl_family(family);
        message.header.table = RouteHeader::RT_TABLE_MAIN;
        message.header.protocol = RouteProtocol::Boot;
        message.header.kind = RouteType::Unicast;
        message.header.scope = match route.scope {
            RouteScope::Universe => NlRouteScope::Universe,
            RouteScope::Link => NlRouteScope::Link,
            RouteScope::Host => NlRouteScope::Host,
        };

        if let Some(dst) = route.destination {
            message.header.destination_prefix_length = dst.prefix_len();
            message
                .attributes
                .push(RouteAttribute::Destination(route_address(dst.network())));
        }
        if let Some(gw) = route.gateway {
            message
                .attributes
                .push(RouteAttribute::Gateway(route_address(gw)));
        }
        if let Some(src) = route.source {
            message
                .attributes
                .push(RouteAttribute::PrefSource(route_address(src)));
        }
        if let Some(oif) = route.link_index {
            message.attributes.push(RouteAttribute::Oif(oif));
        }

        Ok(message)
    }

    fn route_table_id(msg: &RouteMessage) -> u32 {
        msg.attributes
            .iter()
            .find_map(|attr| match attr {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(u32::from(msg.header.table))
    }

    fn from_route_message(msg: &RouteMessage) -> Option<KernelRoute> {
        let mut route = KernelRoute {
            scope: match msg.header.scope {
                NlRouteScope::Link => RouteScope::Link,
                NlRouteScope::Host => RouteScope::Host,
                _ => RouteScope::Universe,
            },
            ..Default::default()
        };

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => {
                    let ip = ip_from_route_address(addr)?;
                    route.destination =
                        Some(IpNet::new(ip, msg.header.destination_prefix_length).ok()?);
                }
                RouteAttribute::Gateway(addr) => route.gateway = ip_from_route_address(addr),
                RouteAttribute::PrefSource(addr) => route.source = ip_from_route_address(addr),
                RouteAttribute::Oif(oif) => route.link_index = Some(*oif),
                _ => {}
            }
        }

        Some(route)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn test_route_message_round_trip() {
            let route = KernelRoute {
                destination: Some("10.0.0.0/16".parse().unwrap()),
                gateway: Some("10.0.0.1".parse().unwrap()),
                source: Some("10.0.0.1".parse().unwrap()),
                link_index: Some(7),
                scope: RouteScope::Universe,
            };
            let message = to_route_message(&route).unwrap();
            assert_eq!(message.header.destination_prefix_length, 16);
            assert_eq!(message.header.table, RouteHeader::RT_TABLE_MAIN);
            assert_eq!(from_route_message(&message), Some(route));
        }

        #[test]
        fn test_link_scope_message() {
            let route = KernelRoute {
                destination: Some("f00d::1/128".parse().unwrap()),
                link_index: Some(3),
                scope: RouteScope::Link,
                ..Default::default()
            };
            let message = to_route_message(&route).unwrap();
            assert_eq!(message.header.address_family, NlAddressFamily::Inet6);
            assert_eq!(message.header.scope, NlRouteScope::Link);
        }

        #[test]
        fn test_get_request_canonicalizes_mapped_address() {
            let mapped: IpAddr = "::ffff:10.0.1.5".parse().unwrap();
            let message = get_request(mapped);

            assert_eq!(message.header.address_family, NlAddressFamily::Inet);
            assert_eq!(message.header.destination_prefix_length, 32);
            assert_eq!(
                message.attributes,
                vec![RouteAttribute::Destination(RouteAddress::Inet(
                    "10.0.1.5".parse().unwrap()
                ))]
            );
        }

        #[test]
        fn test_route_without_address_rejected() {
            let route = KernelRoute {
                link_index: Some(3),
                ..Default::default()
            };
            assert!(to_route_message(&route).is_err());
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stand-in for non-Linux platforms (development only)
#[cfg(not(target_os = "linux"))]
mod unsupported {
    use crate::error::KernelError;
    use crate::kernel::{KernelResult, RouteTable};
    use crate::types::{AddressFamily, KernelRoute, Link};
    use std::net::IpAddr;

    pub struct NetlinkRouteTable;

    impl NetlinkRouteTable {
        pub fn new() -> KernelResult<Self> {
            Err(KernelError::Netlink(
                "netlink route tables are only available on Linux".into(),
            ))
        }
    }

    impl RouteTable for NetlinkRouteTable {
        fn link_by_name(&self, name: &str) -> KernelResult<Link> {
            Err(KernelError::LinkNotFound(name.to_string()))
        }

        fn list(&self, _link: &Link, _family: AddressFamily) -> KernelResult<Vec<KernelRoute>> {
            Ok(Vec::new())
        }

        fn get(&self, _destination: IpAddr) -> KernelResult<Vec<KernelRoute>> {
            Ok(Vec::new())
        }

        fn replace(&self, _route: &KernelRoute) -> KernelResult<()> {
            Err(KernelError::Netlink("unsupported platform".into()))
        }

        fn delete(&self, _route: &KernelRoute) -> KernelResult<()> {
            Err(KernelError::Netlink("unsupported platform".into()))
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::*;
