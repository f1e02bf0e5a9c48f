//! IPv4 route table entries.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::netlink::{self, NetlinkSocket};

use super::link::LinkIndex;

const RTM_NEWROUTE: u16 = 24;

const RTA_DST: u16 = 1;
const RTA_GATEWAY: u16 = 5;
const RTA_OIF: u16 = 4;

/// Routing table a route belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// `RT_TABLE_MAIN` (254).
    Main,
    /// `RT_TABLE_LOCAL` (255).
    Local,
    /// An application-specific policy-routing table id.
    Custom(u32),
}

impl Table {
    pub(super) fn raw(self) -> u32 {
        match self {
            Table::Main => 254,
            Table::Local => 255,
            Table::Custom(id) => id,
        }
    }
}

/// `rtmsg.rtm_scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Directly attached, no gateway needed (`RT_SCOPE_LINK`).
    Link,
    /// Reachable via a gateway (`RT_SCOPE_UNIVERSE`).
    Global,
}

impl Scope {
    fn raw(self) -> u8 {
        match self {
            Scope::Link => 253,
            Scope::Global => 0,
        }
    }
}

/// `rtmsg.rtm_protocol`: who installed the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creator {
    /// `RTPROT_UNSPEC`; matches any protocol when used as a delete filter.
    Any,
    /// `RTPROT_KERNEL`.
    Kernel,
    /// `RTPROT_BOOT`.
    Boot,
    /// `RTPROT_STATIC`, used for routes this crate installs itself.
    Admin,
    /// `RTPROT_REDIRECT` (ICMP redirect).
    Icmp,
}

impl Creator {
    fn raw(self) -> u8 {
        match self {
            Creator::Any => 0,
            Creator::Kernel => 2,
            Creator::Icmp => 1,
            Creator::Boot => 3,
            Creator::Admin => 4,
        }
    }
}

/// A single IPv4 route.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    /// Destination network.
    pub destination: Ipv4Addr,
    /// Destination prefix length (`0` for a default route).
    pub prefix_len: u8,
    /// Next hop, or `None` for an on-link route.
    pub gateway: Option<Ipv4Addr>,
    /// Outbound interface.
    pub out_interface: Option<LinkIndex>,
    /// Target table.
    pub table: Table,
    /// Route scope.
    pub scope: Scope,
    /// Installing protocol, recorded for later identification/removal.
    pub creator: Creator,
}

fn rtmsg(prefix_len: u8, table: u32, scope: u8, protocol: u8) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = libc::AF_INET as u8;
    buf[1] = prefix_len;
    buf[3] = scope;
    buf[4] = protocol;
    buf[5] = libc::RTN_UNICAST as u8;
    // rtm_table's low byte mirrors RTA_TABLE's value when it fits in u8;
    // full resolution needs RTA_TABLE when the id overflows 255.
    buf[6] = (table & 0xFF) as u8;
    buf
}

const RTA_TABLE: u16 = 15;

/// Add a route. Fails with a kernel error if an equivalent route already
/// exists (no implicit replace, matching iproute2's default for `ip route
/// add`).
pub fn add_route(netlink: &mut NetlinkSocket, route: Route) -> Result<()> {
    let mut req = netlink.begin(
        RTM_NEWROUTE,
        netlink::NLM_F_CREATE | netlink::NLM_F_EXCL | netlink::NLM_F_ACK,
    );
    req.append(&rtmsg(
        route.prefix_len,
        route.table.raw(),
        route.scope.raw(),
        route.creator.raw(),
    ));
    if route.prefix_len > 0 {
        req.attr_bytes(RTA_DST, &route.destination.octets());
    }
    if let Some(gw) = route.gateway {
        req.attr_bytes(RTA_GATEWAY, &gw.octets());
    }
    if let Some(oif) = route.out_interface {
        req.attr_u32(RTA_OIF, oif.0);
    }
    if route.table.raw() > 255 {
        req.attr_u32(RTA_TABLE, route.table.raw());
    }
    req.send(true, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_raw_values_match_kernel_constants() {
        assert_eq!(Table::Main.raw(), 254);
        assert_eq!(Table::Local.raw(), 255);
        assert_eq!(Table::Custom(100).raw(), 100);
    }

    #[test]
    fn scope_link_is_253() {
        assert_eq!(Scope::Link.raw(), 253);
    }
}
