use std::fmt;
use std::str::FromStr;


use crate::error::Error;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// The all-zero address. Never handed out by [`MacIter`].
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Construct from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    fn to_u64(self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | byte as u64)
    }

    fn from_u64(v: u64) -> Self {
        let b = v.to_be_bytes();
        MacAddr([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    /// The next address in counter order, or `None` on rollover past
    /// `ff:ff:ff:ff:ff:ff`.
    pub fn next(self) -> Option<MacAddr> {
        let next = self.to_u64().checked_add(1)?;
        if next > 0xFFFF_FFFF_FFFF {
            return None;
        }
        Some(MacAddr::from_u64(next))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::config(format!("invalid MAC address {s:?}")));
        }
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::config(format!("invalid MAC address {s:?}")))?;
        }
        Ok(MacAddr(octets))
    }
}

impl bincode::Encode for MacAddr {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        self.0.encode(encoder)
    }
}

impl<Context> bincode::Decode<Context> for MacAddr {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(MacAddr(<[u8; 6]>::decode(decoder)?))
    }
}
bincode::impl_borrow_decode!(MacAddr);

/// Produces consecutive MAC addresses from a starting counter value.
///
/// Used by the builder to allocate batches of addresses for veth endpoints.
/// The all-zero address is never assigned: if the iterator starts at zero it
/// is advanced past it first.
pub struct MacIter {
    next: Option<u64>,
}

impl MacIter {
    /// Start iterating from `start` (inclusive, unless it is the all-zero
    /// address).
    pub fn new(start: MacAddr) -> Self {
        let start_val = if start == MacAddr::ZERO {
            1
        } else {
            start.to_u64()
        };
        Self {
            next: Some(start_val),
        }
    }

    /// Produce the next `n` consecutive addresses in one call, or `None` if
    /// the counter would roll over before producing all of them.
    pub fn take_batch(&mut self, n: usize) -> Option<Vec<MacAddr>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.next()?);
        }
        Some(out)
    }
}

impl Iterator for MacIter {
    type Item = MacAddr;

    fn next(&mut self) -> Option<MacAddr> {
        let current = self.next?;
        if current > 0xFFFF_FFFF_FFFF {
            self.next = None;
            return None;
        }
        self.next = current.checked_add(1);
        Some(MacAddr::from_u64(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let mac = MacAddr::new([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let parsed: MacAddr = mac.to_string().parse().unwrap();
        assert_eq!(mac, parsed);
    }

    #[test]
    fn iterator_never_yields_zero() {
        let mut iter = MacIter::new(MacAddr::ZERO);
        let first = iter.next().unwrap();
        assert_ne!(first, MacAddr::ZERO);
        assert_eq!(first, MacAddr::new([0, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn batch_is_consecutive() {
        let mut iter = MacIter::new(MacAddr::new([0, 0, 0, 0, 0, 10]));
        let batch = iter.take_batch(4).unwrap();
        assert_eq!(batch[0], MacAddr::new([0, 0, 0, 0, 0, 10]));
        assert_eq!(batch[3], MacAddr::new([0, 0, 0, 0, 0, 13]));
    }

    #[test]
    fn rollover_detected() {
        let max = MacAddr::new([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(max.next(), None);
        let mut iter = MacIter::new(max);
        assert_eq!(iter.next(), Some(max));
        assert_eq!(iter.next(), None);
    }
}
