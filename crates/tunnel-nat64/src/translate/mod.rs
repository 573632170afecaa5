//! Stateless IP/ICMP translation (RFC 6145) on top of the binding table.
//!
//! Each direction is one state machine:
//!
//! ```text
//! validate ──► TTL check ──┬─► ICMP ──► map type/code ──┬─► echo: copy body
//!  (outer only for TTL)    │                            └─► error: translate embedded
//!                          │                                 packet at Level::Inner
//!                          ├─► TCP/UDP ──► rewrite checksum
//!                          └─► other ──► drop
//! ```
//!
//! The embedded packet of an ICMP error goes through the same machine with
//! [`Level::Inner`], which skips the TTL check, swaps address roles and
//! rejects a second ICMP error instead of recursing again.

pub mod icmp;
mod v4v6;
mod v6v4;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::address::Nat64Prefix;
use crate::bib::BindingTable;
use crate::egress::Egress;
use crate::error::{IcmpFamily, Nat64Error, Nat64Result};
use crate::packet::{
    ip_version, proto, transport_checksum_offset, Header, PacketView, ScatterGather, Segment,
    TcpHeader, UdpHeader, TCP_HEADER_MIN_LEN, UDP_HEADER_LEN,
};

/// Which packet of an ICMP error is being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// The received datagram.
    Outer,
    /// The datagram embedded in an ICMP error. Cannot itself be an error.
    Inner,
}

/// Why a packet produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// TTL or hop limit exhausted and no error is sent back.
    TtlExpired,
    /// IPv4 fragment; fragmentation is not supported.
    Fragment,
    /// Payload protocol is not TCP, UDP, ICMP or ICMPv6.
    UnsupportedProtocol(u8),
    /// ICMP message with no counterpart in the other family.
    IcmpFiltered {
        family: IcmpFamily,
        icmp_type: u8,
        code: u8,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::TtlExpired => f.write_str("TTL expired"),
            DropReason::Fragment => f.write_str("fragmented packet"),
            DropReason::UnsupportedProtocol(p) => write!(f, "unsupported protocol {}", p),
            DropReason::IcmpFiltered {
                family,
                icmp_type,
                code,
            } => write!(f, "{} type {} code {} not translated", family, icmp_type, code),
        }
    }
}

/// One datagram ready for the egress sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub segments: ScatterGather<'a>,
    pub destination: IpAddr,
}

/// Result of translating one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation<'a> {
    /// The translated packet, to be sent in the other address family.
    Forward(Datagram<'a>),
    /// An ICMP error for the sender, in the sender's address family.
    Reply(Datagram<'a>),
    /// Nothing to send.
    Drop(DropReason),
}

/// Terminal state of one packet after [`Translator::process`].
#[derive(Debug)]
pub enum Disposition {
    Sent,
    Dropped(DropReason),
    Failed(Nat64Error),
}

/// NAT64 translation engine.
pub struct Translator {
    prefix: Nat64Prefix,
    bindings: Arc<BindingTable>,
}

impl Translator {
    pub fn new(prefix: Nat64Prefix, bindings: Arc<BindingTable>) -> Self {
        Self { prefix, bindings }
    }

    pub fn prefix(&self) -> Nat64Prefix {
        self.prefix
    }

    pub fn bindings(&self) -> &Arc<BindingTable> {
        &self.bindings
    }

    /// Translate a packet of either family, chosen by its version nibble.
    pub fn translate<'a>(&self, packet: &'a [u8]) -> Nat64Result<Translation<'a>> {
        match ip_version(packet) {
            Some(4) => self.translate_v4(packet),
            Some(6) => self.translate_v6(packet),
            Some(version) => Err(Nat64Error::malformed(format!(
                "Unknown IP version {}",
                version
            ))),
            None => Err(Nat64Error::malformed("Empty packet")),
        }
    }

    /// Translate an IPv4 packet into IPv6.
    pub fn translate_v4<'a>(&self, packet: &'a [u8]) -> Nat64Result<Translation<'a>> {
        v4v6::translate(self, PacketView::new(packet), Level::Outer)
    }

    /// Translate an IPv6 packet into IPv4.
    pub fn translate_v6<'a>(&self, packet: &'a [u8]) -> Nat64Result<Translation<'a>> {
        v6v4::translate(self, PacketView::new(packet), Level::Outer)
    }

    /// Translate one packet and hand the result to `egress`.
    ///
    /// Translation failures only affect this packet and are reported as
    /// [`Disposition::Failed`], as are send errors that reject only this
    /// datagram. Only errors that leave egress unusable are returned as `Err`.
    pub fn process<E: Egress + ?Sized>(
        &self,
        packet: &[u8],
        egress: &E,
    ) -> Nat64Result<Disposition> {
        match self.translate(packet) {
            Ok(Translation::Forward(datagram)) | Ok(Translation::Reply(datagram)) => {
                match egress.send(&datagram.segments, datagram.destination) {
                    Ok(()) => Ok(Disposition::Sent),
                    Err(e) if e.is_packet_level() => {
                        log::warn!("Failed to send packet to {}: {}", datagram.destination, e);
                        Ok(Disposition::Failed(e))
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(Translation::Drop(reason)) => {
                log::debug!("Dropped packet: {}", reason);
                Ok(Disposition::Dropped(reason))
            }
            Err(e) => {
                log::warn!("Failed to translate packet: {}", e);
                Ok(Disposition::Failed(e))
            }
        }
    }
}

/// Copy a complete TCP or UDP segment and recompute its checksum under a new
/// pseudo-header.
fn rewrite_transport<'a>(
    payload: PacketView<'a>,
    protocol: u8,
    pseudo_header: u32,
) -> Nat64Result<ScatterGather<'a>> {
    let (header_len, offset) = match protocol {
        proto::TCP => (payload.parse::<TcpHeader>()?.header_len(), 16),
        _ => (payload.parse::<UdpHeader>()?.header_len(), 6),
    };

    let bytes = payload.bytes();
    let mut header = bytes[..header_len].to_vec();
    header[offset..offset + 2].fill(0);

    let mut body = ScatterGather::new();
    body.push(Segment::Transport(header));
    body.push(Segment::Payload(&bytes[header_len..]));

    let mut checksum = body.checksum_from(0, pseudo_header);
    if protocol == proto::UDP && checksum == 0 {
        checksum = 0xFFFF;
    }
    body.patch_checksum(0, offset, checksum)?;
    Ok(body)
}

/// Copy the (possibly truncated) transport header of an embedded packet and
/// adjust its checksum incrementally with `adjust`, if the field is present.
fn rewrite_embedded_transport<'a>(
    payload: PacketView<'a>,
    protocol: u8,
    adjust: impl FnOnce(u16) -> u16,
) -> ScatterGather<'a> {
    let bytes = payload.bytes();
    let full_len = match protocol {
        proto::TCP => bytes
            .get(12)
            .map_or(TCP_HEADER_MIN_LEN, |b| usize::from(b >> 4) * 4)
            .max(TCP_HEADER_MIN_LEN),
        _ => UDP_HEADER_LEN,
    };
    let header_len = full_len.min(bytes.len());
    let mut header = bytes[..header_len].to_vec();

    if let Some(offset) = transport_checksum_offset(protocol) {
        if header.len() >= offset + 2 {
            let old = u16::from_be_bytes([header[offset], header[offset + 1]]);
            header[offset..offset + 2].copy_from_slice(&adjust(old).to_be_bytes());
        }
    }

    let mut body = ScatterGather::new();
    body.push(Segment::Transport(header));
    body.push(Segment::Payload(&bytes[header_len..]));
    body
}
