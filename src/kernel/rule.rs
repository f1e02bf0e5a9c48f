//! IPv4 policy routing rules (`ip rule`).
//!
//! Unused by the default root-addressing path: design note 9 on policy
//! routing quirks calls for collapsing the self-link/up-link addressing onto
//! main-table routing, since the custom-table formulation misbehaves on
//! older kernels. The machinery stays available behind [`USE_POLICY_TABLE`]
//! for hosts where a single routing table can't hold both address families
//! of traffic.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::netlink::{self, NetlinkSocket};

use super::route::Table;

const RTM_NEWRULE: u16 = 32;
const RTM_DELRULE: u16 = 33;
const RTM_GETRULE: u16 = 34;

const FRA_SRC: u16 = 2;
const FRA_PRIORITY: u16 = 6;
const FRA_TABLE: u16 = 15;

const FR_ACT_TO_TBL: u8 = 1;
const FR_ACT_UNSPEC: u8 = 0;

/// Compile-time toggle collapsing policy-table routing onto the main table;
/// flip to `true` only when targeting kernels where the main-table formulation
/// in [`super::super::worker`] breaks down.
pub const USE_POLICY_TABLE: bool = false;

/// A single policy routing rule: "packets from `src` use `table`", ordered by
/// `priority` (lower runs first, mirroring `ip rule`'s `pref`).
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Selection priority; rules are evaluated in ascending order.
    pub priority: u32,
    /// Source subnet to match, or `None` for "from all".
    pub src: Option<(Ipv4Addr, u8)>,
    /// Table to look up on a match.
    pub table: Table,
}

fn fib_rule_hdr(src_len: u8, table: u32, action: u8) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0] = libc::AF_INET as u8;
    buf[2] = src_len;
    buf[4] = (table & 0xFF) as u8;
    buf[7] = action;
    buf
}

/// Add a policy rule.
pub fn add_rule(netlink: &mut NetlinkSocket, rule: Rule) -> Result<()> {
    let src_len = rule.src.map(|(_, len)| len).unwrap_or(0);
    let mut req = netlink.begin(
        RTM_NEWRULE,
        netlink::NLM_F_CREATE | netlink::NLM_F_EXCL | netlink::NLM_F_ACK,
    );
    req.append(&fib_rule_hdr(src_len, rule.table.raw(), FR_ACT_TO_TBL));
    req.attr_u32(FRA_PRIORITY, rule.priority);
    if let Some((src, _)) = rule.src {
        req.attr_bytes(FRA_SRC, &src.octets());
    }
    if rule.table.raw() > 255 {
        req.attr_u32(FRA_TABLE, rule.table.raw());
    }
    req.send(true, None)
}

/// Delete the rule at `priority`, regardless of its source/table.
pub fn delete_rule_at(netlink: &mut NetlinkSocket, priority: u32) -> Result<()> {
    let mut req = netlink.begin(RTM_DELRULE, netlink::NLM_F_ACK);
    req.append(&fib_rule_hdr(0, 0, FR_ACT_UNSPEC));
    req.attr_u32(FRA_PRIORITY, priority);
    req.send(true, None)
}

/// Check whether a rule already exists at `priority`.
pub fn exists_at(netlink: &mut NetlinkSocket, priority: u32) -> Result<bool> {
    let mut found = false;
    {
        let mut req = netlink.begin(RTM_GETRULE, netlink::NLM_F_DUMP | netlink::NLM_F_ACK);
        req.append(&fib_rule_hdr(0, 0, FR_ACT_UNSPEC));
        req.send(
            true,
            Some(&mut |payload: &[u8]| {
                if payload.len() < 12 {
                    return Ok(());
                }
                if parse_priority(&payload[12..]) == Some(priority) {
                    found = true;
                }
                Ok(())
            }),
        )?;
    }
    Ok(found)
}

fn parse_priority(mut attrs: &[u8]) -> Option<u32> {
    while attrs.len() >= 4 {
        let len = u16::from_ne_bytes(attrs[0..2].try_into().ok()?) as usize;
        let ty = u16::from_ne_bytes(attrs[2..4].try_into().ok()?) & 0x7FFF;
        if len < 4 || len > attrs.len() {
            break;
        }
        if ty == FRA_PRIORITY && len >= 8 {
            return Some(u32::from_ne_bytes(attrs[4..8].try_into().ok()?));
        }
        let padded = (len + 3) & !3;
        if padded > attrs.len() {
            break;
        }
        attrs = &attrs[padded..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fib_rule_hdr_places_table_and_action() {
        let hdr = fib_rule_hdr(24, 254, FR_ACT_TO_TBL);
        assert_eq!(hdr[2], 24);
        assert_eq!(hdr[4], 254);
        assert_eq!(hdr[7], FR_ACT_TO_TBL);
    }
}
