//! Traffic shaping via a single `netem` qdisc per interface.

use crate::error::Result;
use crate::netlink::{self, NetlinkSocket};

use super::link::LinkIndex;

const RTM_NEWQDISC: u16 = 36;

const TC_H_ROOT: u32 = 0xFFFF_FFFF;
/// The single root netem handle every shaped interface uses.
const NETEM_ROOT_HANDLE: u32 = 0x0001_0000;

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_RATE_LEGACY: u16 = 5; // unused; kept for documentation of the layout
const TCA_NETEM_RATE: u16 = 2; // nested inside TCA_OPTIONS's netem payload tail

/// Conversion factor from milliseconds to psched ticks, derived from
/// `/proc/net/psched`: `ticks_per_ms = 1e6 / ns_per_tick` (new-style
/// interpretation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TicksPerMs(pub f64);

impl TicksPerMs {
    fn ticks(self, ms: f64) -> u32 {
        (ms * self.0).round().clamp(0.0, u32::MAX as f64) as u32
    }
}

/// Shaping parameters for one interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetemParams {
    /// Base delay in milliseconds.
    pub latency_ms: f64,
    /// Delay jitter in milliseconds.
    pub jitter_ms: f64,
    /// Packet loss rate, `0.0..=1.0`.
    pub loss: f64,
    /// Queue length limit (packets). `0` uses the kernel default.
    pub queue_len: u32,
    /// Optional rate limit in Mbit/s.
    pub rate_mbps: Option<f64>,
}

fn tcmsg(ifindex: u32, handle: u32, parent: u32) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0] = libc::AF_UNSPEC as u8;
    buf[4..8].copy_from_slice(&ifindex.to_ne_bytes());
    buf[8..12].copy_from_slice(&handle.to_ne_bytes());
    buf[12..16].copy_from_slice(&parent.to_ne_bytes());
    buf
}

/// Install (or replace) the root netem qdisc on `index` with the given
/// parameters, converting latency/jitter to psched ticks, loss to a
/// fraction of `u32::MAX`, and rate from Mbit/s to bytes/s.
pub fn set_netem(
    netlink: &mut NetlinkSocket,
    index: LinkIndex,
    params: NetemParams,
    ticks_per_ms: TicksPerMs,
) -> Result<()> {
    let latency = ticks_per_ms.ticks(params.latency_ms);
    let jitter = ticks_per_ms.ticks(params.jitter_ms);
    let loss = (params.loss.clamp(0.0, 1.0) * u32::MAX as f64).round() as u32;

    let mut req = netlink.begin(
        RTM_NEWQDISC,
        netlink::NLM_F_CREATE | netlink::NLM_F_REPLACE | netlink::NLM_F_ACK,
    );
    req.append(&tcmsg(index.0, NETEM_ROOT_HANDLE, TC_H_ROOT));
    req.attr_bytes(TCA_KIND, b"netem\0");
    req.push_attr(TCA_OPTIONS)?;
    // struct tc_netem_qopt { latency, limit, loss, gap, duplicate, jitter }
    let limit = if params.queue_len == 0 {
        1000
    } else {
        params.queue_len
    };
    let mut qopt = [0u8; 24];
    qopt[0..4].copy_from_slice(&latency.to_ne_bytes());
    qopt[4..8].copy_from_slice(&limit.to_ne_bytes());
    qopt[8..12].copy_from_slice(&loss.to_ne_bytes());
    qopt[20..24].copy_from_slice(&jitter.to_ne_bytes());
    req.append(&qopt);
    if let Some(rate_mbps) = params.rate_mbps {
        let rate_bytes_per_sec = (rate_mbps * 125_000.0).round() as u32;
        req.push_attr(TCA_NETEM_RATE)?;
        // struct tc_netem_rate { rate, packet_overhead, cell_size, cell_overhead }
        req.append(&rate_bytes_per_sec.to_ne_bytes());
        req.append(&0i32.to_ne_bytes());
        req.append(&0u32.to_ne_bytes());
        req.append(&0i32.to_ne_bytes());
        req.pop_attr()?;
    }
    req.pop_attr()?; // TCA_OPTIONS
    let _ = TCA_RATE_LEGACY;
    req.send(true, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_conversion_rounds() {
        let t = TicksPerMs(4.0);
        assert_eq!(t.ticks(2.5), 10);
    }

    #[test]
    fn loss_scaling_saturates_bounds() {
        let loss = (1.5f64.clamp(0.0, 1.0) * u32::MAX as f64).round() as u32;
        assert_eq!(loss, u32::MAX);
    }
}
