//! IPv4 address management on interfaces.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::netlink::{self, NetlinkSocket};

use super::link::LinkIndex;

const RTM_NEWADDR: u16 = 20;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;

/// An IPv4 address assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfAddr {
    /// Local address.
    pub address: Ipv4Addr,
    /// Prefix length.
    pub prefix_len: u8,
    /// Optional broadcast address.
    pub broadcast: Option<Ipv4Addr>,
}

fn ifaddrmsg(index: u32, prefix_len: u8) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0] = libc::AF_INET as u8;
    buf[1] = prefix_len;
    buf[4..8].copy_from_slice(&index.to_ne_bytes());
    buf
}

/// Add an IPv4 address to an interface.
pub fn add_address(netlink: &mut NetlinkSocket, index: LinkIndex, addr: IfAddr) -> Result<()> {
    let mut req = netlink.begin(
        RTM_NEWADDR,
        netlink::NLM_F_CREATE | netlink::NLM_F_EXCL | netlink::NLM_F_ACK,
    );
    req.append(&ifaddrmsg(index.0, addr.prefix_len));
    req.attr_bytes(IFA_LOCAL, &addr.address.octets());
    req.attr_bytes(IFA_ADDRESS, &addr.address.octets());
    if let Some(bcast) = addr.broadcast {
        req.attr_bytes(IFA_BROADCAST, &bcast.octets());
    }
    req.send(true, None)
}

