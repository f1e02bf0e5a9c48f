//! Interface-level operations: index lookup, veth pair creation, moving
//! interfaces between namespaces, up/down, and GRO toggling.

use std::os::fd::{AsRawFd, RawFd};

use crate::error::{Error, Result};
use crate::netlink::{self, NetlinkSocket};

use super::namespace::NamespaceContext;

const IFNAMSIZ: usize = 16;

const SIOCGIFINDEX: libc::c_ulong = 0x8933;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const SIOCETHTOOL: libc::c_ulong = 0x8946;

const ETHTOOL_SGRO: u32 = 0x0000_0025;

const RTM_NEWLINK: u16 = 16;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

/// An interface index as returned by `SIOCGIFINDEX` / netlink link dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIndex(pub u32);

/// Raw `struct ifreq`, sized generously (40 bytes covers the union on all
/// Linux ABIs this crate targets) so it can be reused across the few ioctls
/// that need it.
#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    union: [u8; 24],
}

impl IfReq {
    fn named(name: &str) -> Result<Self> {
        if name.len() >= IFNAMSIZ {
            return Err(Error::config(format!("interface name too long: {name}")));
        }
        let mut req = IfReq {
            name: [0u8; IFNAMSIZ],
            union: [0u8; 24],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(req)
    }
}

fn ioctl_ifreq(fd: RawFd, request: libc::c_ulong, req: &mut IfReq) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, req as *mut IfReq) };
    if rc < 0 {
        return Err(Error::kernel("ioctl on interface failed"));
    }
    Ok(())
}

/// Resolve an interface name to its index via `SIOCGIFINDEX`.
pub fn get_index(ctx: &NamespaceContext, name: &str) -> Result<LinkIndex> {
    let mut req = IfReq::named(name)?;
    ioctl_ifreq(ctx.ioctl_fd().as_raw_fd(), SIOCGIFINDEX, &mut req)?;
    let index = i32::from_ne_bytes(req.union[0..4].try_into().expect("4 bytes"));
    Ok(LinkIndex(index as u32))
}

/// Bring an interface administratively up.
pub fn set_up(ctx: &NamespaceContext, name: &str) -> Result<()> {
    set_flags(ctx, name, libc::IFF_UP as i16, true)
}

fn set_flags(ctx: &NamespaceContext, name: &str, flag: i16, enable: bool) -> Result<()> {
    let fd = ctx.ioctl_fd().as_raw_fd();
    let mut req = IfReq::named(name)?;
    ioctl_ifreq(fd, SIOCGIFFLAGS, &mut req)?;
    let mut flags = i16::from_ne_bytes(req.union[0..2].try_into().expect("2 bytes"));
    if enable {
        flags |= flag;
    } else {
        flags &= !flag;
    }
    req.union[0..2].copy_from_slice(&flags.to_ne_bytes());
    ioctl_ifreq(fd, SIOCSIFFLAGS, &mut req)
}

/// Disable (or re-enable) generic receive offload via `SIOCETHTOOL` /
/// `ETHTOOL_SGRO`.
pub fn disable_gro(ctx: &NamespaceContext, name: &str) -> Result<()> {
    #[repr(C)]
    struct EthtoolValue {
        cmd: u32,
        data: u32,
    }
    let mut value = EthtoolValue {
        cmd: ETHTOOL_SGRO,
        data: 0, // 0 = disabled
    };
    let mut req = IfReq::named(name)?;
    let ptr = &mut value as *mut EthtoolValue as u64;
    req.union[0..8].copy_from_slice(&ptr.to_ne_bytes());
    ioctl_ifreq(ctx.ioctl_fd().as_raw_fd(), SIOCETHTOOL, &mut req)
}

fn ifinfomsg(index: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0] = libc::AF_UNSPEC as u8;
    buf[4..8].copy_from_slice(&index.to_ne_bytes());
    buf
}

/// Create a veth pair in a single netlink message: `name_a` is created in
/// the namespace the calling process (and hence `netlink`) is currently
/// active in; its peer `name_b` is created and immediately moved into the
/// namespace identified by `peer_ns_fd` via a nested `VETH_INFO_PEER`
/// attribute carrying `IFLA_NET_NS_FD`.
pub fn create_veth_pair(
    netlink: &mut NetlinkSocket,
    name_a: &str,
    name_b: &str,
    peer_ns_fd: RawFd,
) -> Result<()> {
    let name_a = nul_terminated(name_a)?;
    let name_b = nul_terminated(name_b)?;
    let mut req = netlink.begin(RTM_NEWLINK, netlink::NLM_F_CREATE | netlink::NLM_F_EXCL | netlink::NLM_F_ACK);
    req.append(&ifinfomsg(0));
    req.attr_bytes(IFLA_IFNAME, &name_a);
    req.push_attr(IFLA_LINKINFO)?;
    req.attr_bytes(IFLA_INFO_KIND, b"veth\0");
    req.push_attr(IFLA_INFO_DATA)?;
    req.push_attr(VETH_INFO_PEER)?;
    req.append(&ifinfomsg(0));
    req.attr_bytes(IFLA_IFNAME, &name_b);
    req.attr_u32(IFLA_NET_NS_FD, peer_ns_fd as u32);
    req.pop_attr()?; // VETH_INFO_PEER
    req.pop_attr()?; // IFLA_INFO_DATA
    req.pop_attr()?; // IFLA_LINKINFO
    req.send(true, None)
}

/// Move an existing interface into another namespace.
pub fn move_to_namespace(netlink: &mut NetlinkSocket, index: LinkIndex, ns_fd: RawFd) -> Result<()> {
    let mut req = netlink.begin(RTM_NEWLINK, netlink::NLM_F_ACK);
    req.append(&ifinfomsg(index.0));
    req.attr_u32(IFLA_NET_NS_FD, ns_fd as u32);
    req.send(true, None)
}

/// Set an interface's hardware (MAC) address.
pub fn set_hw_address(netlink: &mut NetlinkSocket, index: LinkIndex, mac: [u8; 6]) -> Result<()> {
    let mut req = netlink.begin(RTM_NEWLINK, netlink::NLM_F_ACK);
    req.append(&ifinfomsg(index.0));
    req.attr_bytes(IFLA_ADDRESS, &mac);
    req.send(true, None)
}

fn nul_terminated(name: &str) -> Result<Vec<u8>> {
    if name.len() >= IFNAMSIZ {
        return Err(Error::config(format!("interface name too long: {name}")));
    }
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    Ok(bytes)
}
