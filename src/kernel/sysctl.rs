//! Procfs-backed sysctl toggles and `/proc/net/psched` tick resolution.

use std::fs;

use crate::error::{Error, Result};

use super::shaping::TicksPerMs;

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const DISABLE_IPV6: &str = "/proc/sys/net/ipv6/conf/all/disable_ipv6";
const PSCHED: &str = "/proc/net/psched";

fn accept_local_path(ifname: &str) -> String {
    format!("/proc/sys/net/ipv4/conf/{ifname}/accept_local")
}

fn write_bool(path: &str, value: bool) -> Result<()> {
    fs::write(path, if value { "1" } else { "0" }).map_err(Error::from)
}

/// Enable or disable global IPv4 forwarding.
pub fn set_ip_forward(enabled: bool) -> Result<()> {
    write_bool(IP_FORWARD, enabled)
}

/// Allow packets whose source address matches a local address to be
/// accepted on `ifname`, needed when two interfaces on the same host share
/// an address range (policy-routed client subnets).
pub fn set_accept_local(ifname: &str, enabled: bool) -> Result<()> {
    write_bool(&accept_local_path(ifname), enabled)
}

/// Disable (or re-enable) IPv6 globally; this crate only programs IPv4.
pub fn set_disable_ipv6(disabled: bool) -> Result<()> {
    write_bool(DISABLE_IPV6, disabled)
}

/// Read `/proc/net/psched` and derive the tick resolution used by traffic
/// control, under the "new-style" kernel interpretation:
/// `ticks_per_ms = 1e6 / ns_per_tick` where `ns_per_tick = t2ns / t2us`.
pub fn read_ticks_per_ms() -> Result<TicksPerMs> {
    let contents = fs::read_to_string(PSCHED).map_err(Error::from)?;
    let fields: Vec<u64> = contents
        .split_whitespace()
        .map(|s| u64::from_str_radix(s, 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::protocol(format!("unexpected contents of {PSCHED}")))?;
    if fields.len() < 2 {
        return Err(Error::protocol(format!(
            "{PSCHED} has fewer than 2 fields"
        )));
    }
    let (t2us, us2ns) = (fields[0] as f64, fields[1] as f64);
    let ns_per_tick = us2ns / t2us * 1000.0;
    Ok(TicksPerMs(1_000_000.0 / ns_per_tick))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_local_path_is_per_interface() {
        assert_eq!(
            accept_local_path("veth0"),
            "/proc/sys/net/ipv4/conf/veth0/accept_local"
        );
    }
}
