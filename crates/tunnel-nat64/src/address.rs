//! IPv4-embedded IPv6 addresses (RFC 6052).
//!
//! Only the /96 format is supported: the IPv4 address occupies the last 32
//! bits of the IPv6 address, in network byte order.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv6Net;

use crate::error::{Nat64Error, Nat64Result};

/// The only supported NAT64 prefix length.
pub const SUPPORTED_PREFIX_LEN: u8 = 96;

/// The well-known NAT64 prefix `64:ff9b::` (RFC 6052 section 2.1).
pub const WELL_KNOWN_PREFIX: Ipv6Addr = Ipv6Addr::new(0x0064, 0xff9b, 0, 0, 0, 0, 0, 0);

/// Embed an IPv4 address into an IPv6 address under `prefix`.
///
/// No check is made that the host bits of `prefix` are zero; the low 32 bits
/// are simply overwritten.
pub fn embed(v4: Ipv4Addr, prefix: Ipv6Addr, plen: usize) -> Nat64Result<Ipv6Addr> {
    check_prefix_len(plen)?;

    let mut octets = prefix.octets();
    octets[12..].copy_from_slice(&v4.octets());
    Ok(Ipv6Addr::from(octets))
}

/// Extract the IPv4 address embedded in `v6`.
///
/// The high bits of `v6` are not compared against `prefix`.
pub fn extract(v6: Ipv6Addr, _prefix: Ipv6Addr, plen: usize) -> Nat64Result<Ipv4Addr> {
    check_prefix_len(plen)?;

    let octets = v6.octets();
    Ok(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
}

fn check_prefix_len(plen: usize) -> Nat64Result<()> {
    if plen == usize::from(SUPPORTED_PREFIX_LEN) {
        Ok(())
    } else {
        Err(Nat64Error::UnsupportedPrefixLength(
            u8::try_from(plen).unwrap_or(u8::MAX),
        ))
    }
}

/// A validated NAT64 prefix.
///
/// Construction fails for any length other than 96, so the mapping methods
/// on this type cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat64Prefix {
    prefix: Ipv6Addr,
}

impl Nat64Prefix {
    /// `64:ff9b::/96`
    pub const WELL_KNOWN: Nat64Prefix = Nat64Prefix {
        prefix: WELL_KNOWN_PREFIX,
    };

    /// Create a prefix, rejecting unsupported lengths.
    pub fn new(prefix: Ipv6Addr, plen: u8) -> Nat64Result<Self> {
        check_prefix_len(usize::from(plen))?;
        let mut octets = prefix.octets();
        octets[12..].fill(0);
        Ok(Self {
            prefix: Ipv6Addr::from(octets),
        })
    }

    /// Network address of the prefix.
    pub fn addr(&self) -> Ipv6Addr {
        self.prefix
    }

    /// Prefix length (always 96).
    pub fn prefix_len(&self) -> u8 {
        SUPPORTED_PREFIX_LEN
    }

    /// Check whether `addr` falls inside this prefix.
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        addr.octets()[..12] == self.prefix.octets()[..12]
    }

    /// Synthesize the IPv6 address representing `v4`.
    pub fn embed(&self, v4: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.prefix.octets();
        octets[12..].copy_from_slice(&v4.octets());
        Ipv6Addr::from(octets)
    }

    /// Recover the IPv4 address from a synthesized IPv6 address.
    pub fn extract(&self, v6: Ipv6Addr) -> Ipv4Addr {
        let octets = v6.octets();
        Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15])
    }

    /// The prefix as an `ipnet` network, e.g. for route installation.
    pub fn as_net(&self) -> Ipv6Net {
        // 96 is always a valid IPv6 prefix length.
        Ipv6Net::new(self.prefix, SUPPORTED_PREFIX_LEN)
            .unwrap_or_else(|_| Ipv6Net::from(self.prefix))
    }
}

impl Default for Nat64Prefix {
    fn default() -> Self {
        Self::WELL_KNOWN
    }
}

impl TryFrom<Ipv6Net> for Nat64Prefix {
    type Error = Nat64Error;

    fn try_from(net: Ipv6Net) -> Nat64Result<Self> {
        Self::new(net.network(), net.prefix_len())
    }
}

impl fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, SUPPORTED_PREFIX_LEN)
    }
}
