//! ICMP and ICMPv6 type/code mapping (RFC 6145 sections 4.2 and 5.2).

use crate::error::{IcmpFamily, Nat64Error, Nat64Result};
use crate::packet::{IcmpHeader, ICMP_HEADER_LEN};

/// ICMP (IPv4) message types.
pub mod v4 {
    pub const ECHO_REPLY: u8 = 0;
    pub const DEST_UNREACHABLE: u8 = 3;
    pub const SOURCE_QUENCH: u8 = 4;
    pub const REDIRECT: u8 = 5;
    pub const ECHO_REQUEST: u8 = 8;
    pub const ROUTER_ADVERTISEMENT: u8 = 9;
    pub const ROUTER_SOLICITATION: u8 = 10;
    pub const TIME_EXCEEDED: u8 = 11;
    pub const PARAMETER_PROBLEM: u8 = 12;
    pub const TIMESTAMP: u8 = 13;
    pub const ADDRESS_MASK_REPLY: u8 = 18;
}

/// ICMPv6 message types.
pub mod v6 {
    pub const DEST_UNREACHABLE: u8 = 1;
    pub const PACKET_TOO_BIG: u8 = 2;
    pub const TIME_EXCEEDED: u8 = 3;
    pub const PARAMETER_PROBLEM: u8 = 4;
    pub const ECHO_REQUEST: u8 = 128;
    pub const ECHO_REPLY: u8 = 129;
    pub const MLD_QUERY: u8 = 130;
    pub const REDIRECT: u8 = 137;
}

/// Whether a message carries an embedded packet that must be translated too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    /// Echo request/reply: the body is copied unchanged.
    Informational,
    /// Error message: the body is the offending datagram.
    Error,
}

/// Header of the translated ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpTranslation {
    pub kind: IcmpKind,
    pub icmp_type: u8,
    pub code: u8,
    /// Type-specific bytes 4..8 (identifier/sequence, MTU, pointer).
    pub rest: [u8; 4],
}

impl IcmpTranslation {
    fn informational(icmp_type: u8, rest: [u8; 4]) -> Self {
        Self {
            kind: IcmpKind::Informational,
            icmp_type,
            code: 0,
            rest,
        }
    }

    fn error(icmp_type: u8, code: u8) -> Self {
        Self {
            kind: IcmpKind::Error,
            icmp_type,
            code,
            rest: [0; 4],
        }
    }

    fn with_rest(mut self, rest: [u8; 4]) -> Self {
        self.rest = rest;
        self
    }

    /// Header bytes with a zero checksum.
    pub fn header(&self) -> [u8; ICMP_HEADER_LEN] {
        let [a, b, c, d] = self.rest;
        [self.icmp_type, self.code, 0, 0, a, b, c, d]
    }
}

/// ICMP error types, which embed the datagram that caused them.
pub fn is_error_v4(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        v4::DEST_UNREACHABLE
            | v4::SOURCE_QUENCH
            | v4::REDIRECT
            | v4::TIME_EXCEEDED
            | v4::PARAMETER_PROBLEM
    )
}

/// ICMPv6 error types (RFC 4443: the high bit of the type is clear).
pub fn is_error_v6(icmp_type: u8) -> bool {
    icmp_type < 128
}

fn unknown_code(family: IcmpFamily, header: &IcmpHeader<'_>) -> Nat64Error {
    Nat64Error::UnknownIcmpCode {
        family,
        icmp_type: header.icmp_type(),
        code: header.code(),
    }
}

/// Map an ICMP header to its ICMPv6 equivalent.
///
/// `Ok(None)` means the message has no ICMPv6 counterpart and is dropped.
pub fn map_v4_to_v6(header: &IcmpHeader<'_>) -> Nat64Result<Option<IcmpTranslation>> {
    let mapped = match header.icmp_type() {
        v4::ECHO_REQUEST => IcmpTranslation::informational(v6::ECHO_REQUEST, header.rest()),
        v4::ECHO_REPLY => IcmpTranslation::informational(v6::ECHO_REPLY, header.rest()),

        v4::DEST_UNREACHABLE => match header.code() {
            // net, host, source route failed, unknown net/host, isolated,
            // net/host unreachable for TOS
            0 | 1 | 5 | 6 | 7 | 8 | 11 | 12 => IcmpTranslation::error(v6::DEST_UNREACHABLE, 0),
            // administratively prohibited variants
            9 | 10 | 13 | 15 => IcmpTranslation::error(v6::DEST_UNREACHABLE, 1),
            // protocol unreachable: points at the Next Header field
            2 => IcmpTranslation::error(v6::PARAMETER_PROBLEM, 1).with_rest(6u32.to_be_bytes()),
            // port unreachable
            3 => IcmpTranslation::error(v6::DEST_UNREACHABLE, 4),
            // fragmentation needed and DF set
            4 => {
                let mtu = (u32::from(header.mtu_v4()) + 20).max(1280);
                IcmpTranslation::error(v6::PACKET_TOO_BIG, 0).with_rest(mtu.to_be_bytes())
            }
            // host precedence violation
            14 => return Ok(None),
            _ => return Err(unknown_code(IcmpFamily::V4, header)),
        },

        v4::TIME_EXCEEDED => match header.code() {
            code @ (0 | 1) => IcmpTranslation::error(v6::TIME_EXCEEDED, code),
            _ => return Err(unknown_code(IcmpFamily::V4, header)),
        },

        v4::PARAMETER_PROBLEM => {
            return Err(Nat64Error::NotImplemented(
                "ICMP parameter problem pointer translation",
            ))
        }

        // Single hop or obsoleted in ICMPv6.
        v4::SOURCE_QUENCH
        | v4::REDIRECT
        | v4::ROUTER_ADVERTISEMENT
        | v4::ROUTER_SOLICITATION
        | v4::TIMESTAMP..=v4::ADDRESS_MASK_REPLY => return Ok(None),

        icmp_type => {
            return Err(Nat64Error::UnknownIcmpType {
                family: IcmpFamily::V4,
                icmp_type,
            })
        }
    };

    Ok(Some(mapped))
}

/// Map an ICMPv6 header to its ICMP equivalent.
///
/// `Ok(None)` means the message has no ICMP counterpart and is dropped.
pub fn map_v6_to_v4(header: &IcmpHeader<'_>) -> Nat64Result<Option<IcmpTranslation>> {
    let mapped = match header.icmp_type() {
        v6::ECHO_REQUEST => IcmpTranslation::informational(v4::ECHO_REQUEST, header.rest()),
        v6::ECHO_REPLY => IcmpTranslation::informational(v4::ECHO_REPLY, header.rest()),

        v6::DEST_UNREACHABLE => match header.code() {
            // no route, beyond scope, address unreachable -> host unreachable
            0 | 2 | 3 => IcmpTranslation::error(v4::DEST_UNREACHABLE, 1),
            // administratively prohibited
            1 => IcmpTranslation::error(v4::DEST_UNREACHABLE, 10),
            // port unreachable
            4 => IcmpTranslation::error(v4::DEST_UNREACHABLE, 3),
            _ => return Err(unknown_code(IcmpFamily::V6, header)),
        },

        v6::PACKET_TOO_BIG => {
            let mtu = header.mtu_v6().saturating_sub(20).min(u32::from(u16::MAX)) as u16;
            let [hi, lo] = mtu.to_be_bytes();
            IcmpTranslation::error(v4::DEST_UNREACHABLE, 4).with_rest([0, 0, hi, lo])
        }

        v6::TIME_EXCEEDED => match header.code() {
            code @ (0 | 1) => IcmpTranslation::error(v4::TIME_EXCEEDED, code),
            _ => return Err(unknown_code(IcmpFamily::V6, header)),
        },

        v6::PARAMETER_PROBLEM => match header.code() {
            // unrecognized next header -> protocol unreachable
            1 => IcmpTranslation::error(v4::DEST_UNREACHABLE, 2),
            0 => {
                return Err(Nat64Error::NotImplemented(
                    "ICMPv6 parameter problem pointer translation",
                ))
            }
            // unrecognized IPv6 option
            2 => return Ok(None),
            _ => return Err(unknown_code(IcmpFamily::V6, header)),
        },

        // MLD and neighbor discovery never leave the link.
        v6::MLD_QUERY..=v6::REDIRECT => return Ok(None),

        icmp_type => {
            return Err(Nat64Error::UnknownIcmpType {
                family: IcmpFamily::V6,
                icmp_type,
            })
        }
    };

    Ok(Some(mapped))
}
