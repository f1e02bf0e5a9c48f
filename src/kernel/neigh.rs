//! Static ARP (IPv4 neighbor) entries and ARP garbage-collection tuning.

use std::fs;
use std::net::Ipv4Addr;

use crate::address::MacAddr;
use crate::error::{Error, Result};
use crate::netlink::{self, NetlinkSocket};

use super::link::LinkIndex;

const RTM_NEWNEIGH: u16 = 28;
const RTM_GETNEIGH: u16 = 30;

const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

const NUD_PERMANENT: u16 = 0x80;

const GC_THRESH_PATH: &str = "/proc/sys/net/ipv4/neigh/default";

/// A static ARP entry.
#[derive(Debug, Clone, Copy)]
pub struct NeighEntry {
    /// IPv4 address.
    pub ip: Ipv4Addr,
    /// Hardware address.
    pub mac: MacAddr,
}

/// Result of looking up a single ARP entry.
#[derive(Debug, Clone, Copy)]
pub enum NeighLookup {
    /// The entry was resolved.
    Found(MacAddr),
    /// No entry exists yet (the kernel may still be resolving it).
    AgainNotCached,
}

fn ndmsg(ifindex: u32, state: u16) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = libc::AF_INET as u8;
    buf[4..8].copy_from_slice(&ifindex.to_ne_bytes());
    buf[8..10].copy_from_slice(&state.to_ne_bytes());
    buf
}

/// Add (or replace) a static, permanent ARP entry on `index`.
pub fn set_static_entry(
    netlink: &mut NetlinkSocket,
    index: LinkIndex,
    entry: NeighEntry,
) -> Result<()> {
    let mut req = netlink.begin(
        RTM_NEWNEIGH,
        netlink::NLM_F_CREATE | netlink::NLM_F_REPLACE | netlink::NLM_F_ACK,
    );
    req.append(&ndmsg(index.0, NUD_PERMANENT));
    req.attr_bytes(NDA_DST, &entry.ip.octets());
    req.attr_bytes(NDA_LLADDR, &entry.mac.octets());
    req.send(true, None)
}

/// Look up a single ARP entry by IP on `index`.
pub fn get_entry(netlink: &mut NetlinkSocket, index: LinkIndex, ip: Ipv4Addr) -> Result<NeighLookup> {
    let mut found = None;
    {
        let mut req = netlink.begin(RTM_GETNEIGH, netlink::NLM_F_DUMP | netlink::NLM_F_ACK);
        req.append(&ndmsg(0, 0));
        req.send(
            true,
            Some(&mut |payload: &[u8]| {
                if payload.len() < 12 {
                    return Ok(());
                }
                let ifindex = u32::from_ne_bytes(payload[4..8].try_into().expect("4 bytes"));
                if ifindex != index.0 {
                    return Ok(());
                }
                if let Some((dst, lladdr)) = parse_neigh_attrs(&payload[12..]) {
                    if dst == ip {
                        found = lladdr;
                    }
                }
                Ok(())
            }),
        )?;
    }
    match found {
        Some(mac) => Ok(NeighLookup::Found(mac)),
        None => Ok(NeighLookup::AgainNotCached),
    }
}

fn parse_neigh_attrs(mut attrs: &[u8]) -> Option<(Ipv4Addr, Option<MacAddr>)> {
    let mut dst = None;
    let mut lladdr = None;
    while attrs.len() >= 4 {
        let len = u16::from_ne_bytes(attrs[0..2].try_into().ok()?) as usize;
        let ty = u16::from_ne_bytes(attrs[2..4].try_into().ok()?) & 0x7FFF;
        if len < 4 || len > attrs.len() {
            break;
        }
        match ty {
            NDA_DST if len >= 8 => {
                let octets: [u8; 4] = attrs[4..8].try_into().ok()?;
                dst = Some(Ipv4Addr::from(octets));
            }
            NDA_LLADDR if len >= 10 => {
                let octets: [u8; 6] = attrs[4..10].try_into().ok()?;
                lladdr = Some(MacAddr::new(octets));
            }
            _ => {}
        }
        let padded = (len + 3) & !3;
        if padded > attrs.len() {
            break;
        }
        attrs = &attrs[padded..];
    }
    dst.map(|d| (d, lladdr))
}

/// Read this interface's own hardware address via a netlink link dump.
pub fn get_local_mac(netlink: &mut NetlinkSocket, index: LinkIndex) -> Result<MacAddr> {
    let mut mac = None;
    {
        let mut req = netlink.begin(16 /* RTM_GETLINK */, netlink::NLM_F_DUMP | netlink::NLM_F_ACK);
        req.append(&[0u8; 16]);
        req.send(
            true,
            Some(&mut |payload: &[u8]| {
                if payload.len() < 16 {
                    return Ok(());
                }
                let idx = u32::from_ne_bytes(payload[4..8].try_into().expect("4 bytes"));
                if idx != index.0 {
                    return Ok(());
                }
                mac = find_address_attr(&payload[16..]);
                Ok(())
            }),
        )?;
    }
    mac.ok_or_else(|| Error::protocol(format!("no hardware address for link index {}", index.0)))
}

fn find_address_attr(mut attrs: &[u8]) -> Option<MacAddr> {
    const IFLA_ADDRESS: u16 = 1;
    while attrs.len() >= 4 {
        let len = u16::from_ne_bytes(attrs[0..2].try_into().ok()?) as usize;
        let ty = u16::from_ne_bytes(attrs[2..4].try_into().ok()?) & 0x7FFF;
        if len < 4 || len > attrs.len() {
            break;
        }
        if ty == IFLA_ADDRESS && len >= 10 {
            let octets: [u8; 6] = attrs[4..10].try_into().ok()?;
            return Some(MacAddr::new(octets));
        }
        let padded = (len + 3) & !3;
        if padded > attrs.len() {
            break;
        }
        attrs = &attrs[padded..];
    }
    None
}

/// The three ARP garbage-collection thresholds.
#[derive(Debug, Clone, Copy)]
pub struct GcThresholds {
    /// Below this, the GC never runs.
    pub thresh1: u32,
    /// Soft ceiling; GC runs opportunistically above it.
    pub thresh2: u32,
    /// Hard ceiling; new entries are rejected above it.
    pub thresh3: u32,
}

/// Read the current ARP GC thresholds from procfs.
pub fn read_gc_thresholds() -> Result<GcThresholds> {
    Ok(GcThresholds {
        thresh1: read_thresh("gc_thresh1")?,
        thresh2: read_thresh("gc_thresh2")?,
        thresh3: read_thresh("gc_thresh3")?,
    })
}

fn read_thresh(name: &str) -> Result<u32> {
    let path = format!("{GC_THRESH_PATH}/{name}");
    let contents = fs::read_to_string(&path).map_err(Error::from)?;
    contents
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("unexpected contents of {path}")))
}

/// Widen the ARP GC thresholds if `planned_entries` would exceed
/// `thresh2`, scaling all three thresholds proportionally.
pub fn set_gc_thresholds_if_needed(planned_entries: u32) -> Result<()> {
    let current = read_gc_thresholds()?;
    if planned_entries <= current.thresh2 {
        return Ok(());
    }
    let scale = (planned_entries as f64 / current.thresh2 as f64).ceil() as u32 + 1;
    set_gc_thresholds(GcThresholds {
        thresh1: current.thresh1 * scale,
        thresh2: current.thresh2 * scale,
        thresh3: current.thresh3 * scale,
    })
}

/// Write new ARP GC thresholds.
pub fn set_gc_thresholds(thresholds: GcThresholds) -> Result<()> {
    write_thresh("gc_thresh1", thresholds.thresh1)?;
    write_thresh("gc_thresh2", thresholds.thresh2)?;
    write_thresh("gc_thresh3", thresholds.thresh3)?;
    Ok(())
}

fn write_thresh(name: &str, value: u32) -> Result<()> {
    let path = format!("{GC_THRESH_PATH}/{name}");
    fs::write(&path, value.to_string()).map_err(Error::from)
}
