use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// A canonicalized IPv4 subnet (host bits always cleared).
///
/// Thin wrapper over [`ipnet::Ipv4Net`] so the rest of the crate has a
/// `Copy` value type with the specific arithmetic helpers the builder needs
/// (fragmentation, size, offset addressing) without reaching for `ipnet`
/// everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr(Ipv4Net);

impl Ipv4Cidr {
    /// Construct a subnet from a network address and prefix length,
    /// canonicalizing host bits to zero.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        let net = Ipv4Net::new(addr, prefix_len)
            .map_err(|e| Error::config(format!("invalid subnet {addr}/{prefix_len}: {e}")))?;
        Ok(Self(net.trunc()))
    }

    /// The network (base) address.
    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    /// The broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// Prefix length (0..=32).
    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Number of addresses in this subnet, including network and broadcast.
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix_len() as u32)
    }

    /// Whether `addr` falls within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.0.contains(&addr)
    }

    /// The `n`th address in the subnet (0-indexed from the network address),
    /// or `None` if `n` is out of range.
    pub fn nth(&self, n: u64) -> Option<Ipv4Addr> {
        if n >= self.size() {
            return None;
        }
        let base = u32::from(self.network()) as u64;
        Some(Ipv4Addr::from((base + n) as u32))
    }

    /// Iterate the addresses in this subnet, skipping any address contained
    /// in `avoid` and, if `skip_reserved` is set, the network and broadcast
    /// addresses.
    pub fn addresses(&self, avoid: Vec<Ipv4Cidr>, skip_reserved: bool) -> SubnetIter {
        SubnetIter::new(*self, avoid, skip_reserved)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let net: Ipv4Net = s
            .parse()
            .map_err(|e| Error::config(format!("invalid subnet {s:?}: {e}")))?;
        Ok(Self(net.trunc()))
    }
}

impl From<Ipv4Net> for Ipv4Cidr {
    fn from(net: Ipv4Net) -> Self {
        Self(net.trunc())
    }
}

impl From<Ipv4Cidr> for Ipv4Net {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.0
    }
}

impl bincode::Encode for Ipv4Cidr {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> std::result::Result<(), bincode::error::EncodeError> {
        self.network().octets().encode(encoder)?;
        self.prefix_len().encode(encoder)
    }
}

impl<Context> bincode::Decode<Context> for Ipv4Cidr {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> std::result::Result<Self, bincode::error::DecodeError> {
        let octets = <[u8; 4]>::decode(decoder)?;
        let prefix_len = u8::decode(decoder)?;
        Ipv4Cidr::new(Ipv4Addr::from(octets), prefix_len)
            .map_err(|e| bincode::error::DecodeError::OtherString(e.to_string()))
    }
}
bincode::impl_borrow_decode!(Ipv4Cidr);

/// Iterator over the addresses of a subnet, skipping a set of "avoid"
/// subnets and, optionally, the two reserved (network/broadcast) addresses.
///
/// Monotone: advances by exactly one address per step and terminates when
/// the parent subnet is exhausted.
pub struct SubnetIter {
    parent: Ipv4Cidr,
    cursor: u64,
    avoid: Vec<Ipv4Cidr>,
    skip_reserved: bool,
}

impl SubnetIter {
    fn new(parent: Ipv4Cidr, mut avoid: Vec<Ipv4Cidr>, skip_reserved: bool) -> Self {
        avoid.sort_by_key(|c| u32::from(c.network()));
        Self {
            parent,
            cursor: 0,
            avoid,
            skip_reserved,
        }
    }

    fn skip(&self, addr: Ipv4Addr) -> bool {
        if self.skip_reserved && (addr == self.parent.network() || addr == self.parent.broadcast())
        {
            return true;
        }
        self.avoid.iter().any(|a| a.contains(addr))
    }
}

impl Iterator for SubnetIter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Ipv4Addr> {
        while self.cursor < self.parent.size() {
            let addr = self
                .parent
                .nth(self.cursor)
                .expect("cursor bounded by size");
            self.cursor += 1;
            if !SubnetIter::skip(self, addr) {
                return Some(addr);
            }
        }
        None
    }
}

/// Partition `parent` into `k` contiguous sub-subnets.
///
/// If `k` is a power of two, every fragment is the same size. Otherwise the
/// parent is split in half recursively, handing `⌊k/2⌋` pieces to one half
/// and `⌈k/2⌉` to the other; which half gets the larger share alternates at
/// each level of recursion, so the extra pieces spread out across the
/// address range instead of clumping at one end. Only two distinct fragment
/// sizes ever appear, a "small" size and its double, and the whole parent is
/// covered contiguously and in address order.
pub fn fragment(parent: Ipv4Cidr, k: u32) -> Result<Vec<Ipv4Cidr>> {
    if k == 0 {
        return Err(Error::config("cannot fragment a subnet into zero pieces"));
    }
    let k = k as u64;
    let size = parent.size();
    if k > size {
        return Err(Error::exhausted(format!(
            "cannot fragment {parent} into {k} pieces: only {size} addresses available"
        )));
    }

    let base = u32::from(parent.network()) as u64;
    let mut fragments = Vec::with_capacity(k as usize);
    split(base, 0, size, k, false, &mut fragments)?;
    Ok(fragments)
}

fn split(
    base: u64,
    offset: u64,
    size: u64,
    k: u64,
    swap: bool,
    out: &mut Vec<Ipv4Cidr>,
) -> Result<()> {
    if k == 1 {
        out.push(cidr_at(base, offset, size)?);
        return Ok(());
    }
    let half = size / 2;
    let (k1, k2) = if swap { (k - k / 2, k / 2) } else { (k / 2, k - k / 2) };
    split(base, offset, half, k1, !swap, out)?;
    split(base, offset + half, half, k2, !swap, out)?;
    Ok(())
}

fn cidr_at(base: u64, offset: u64, size: u64) -> Result<Ipv4Cidr> {
    let addr = Ipv4Addr::from((base + offset) as u32);
    let prefix_len = 32 - size.trailing_zeros() as u8;
    Ipv4Cidr::new(addr, prefix_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_canonicalizes_host_bits() {
        let s1: Ipv4Cidr = "192.168.1.5/24".parse().unwrap();
        let s2: Ipv4Cidr = s1.to_string().parse().unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.network(), Ipv4Addr::new(192, 168, 1, 0));
    }

    #[test]
    fn fragment_five_ways() {
        let parent: Ipv4Cidr = "192.168.0.0/24".parse().unwrap();
        let fragments = fragment(parent, 5).unwrap();
        let sizes: Vec<u64> = fragments.iter().map(|f| f.size()).collect();
        assert_eq!(sizes, vec![64, 64, 32, 32, 64]);
        let starts: Vec<u32> = fragments
            .iter()
            .map(|f| u32::from(f.network()) - u32::from(parent.network()))
            .collect();
        assert_eq!(starts, vec![0, 64, 128, 160, 192]);
    }

    #[test]
    fn fragment_power_of_two_is_equal() {
        let parent: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        let fragments = fragment(parent, 4).unwrap();
        assert!(fragments.iter().all(|f| f.size() == 64));
    }

    #[test]
    fn fragment_partitions_parent() {
        let parent: Ipv4Cidr = "172.16.0.0/20".parse().unwrap();
        for k in 1..=40u32 {
            let fragments = fragment(parent, k).unwrap();
            assert_eq!(fragments.len() as u32, k);
            let total: u64 = fragments.iter().map(|f| f.size()).sum();
            assert_eq!(total, parent.size());
            for pair in fragments.windows(2) {
                assert_eq!(pair[0].broadcast().to_bits() + 1, pair[1].network().to_bits());
            }
            let distinct_sizes: std::collections::HashSet<u64> =
                fragments.iter().map(|f| f.size()).collect();
            assert!(distinct_sizes.len() <= 2);
        }
    }

    #[test]
    fn fragment_rejects_too_many_pieces() {
        let parent: Ipv4Cidr = "192.168.0.0/30".parse().unwrap();
        assert!(fragment(parent, 5).is_err());
    }

    #[test]
    fn subnet_iter_skips_avoided_and_reserved() {
        let parent: Ipv4Cidr = "10.0.0.0/29".parse().unwrap(); // 8 addresses
        let avoid: Ipv4Cidr = "10.0.0.2/31".parse().unwrap(); // .2, .3
        let addrs: Vec<_> = parent.addresses(vec![avoid], true).collect();
        // excludes .0 (network), .7 (broadcast), .2, .3 => 8 - 2 - 2 = 4
        assert_eq!(addrs.len(), 4);
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 0, 7)));
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!addrs.contains(&Ipv4Addr::new(10, 0, 0, 3)));
    }
}
