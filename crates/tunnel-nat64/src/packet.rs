//! Packet views, typed header accessors and the scatter-gather list.
//!
//! Headers are parsed in place from the received buffer. Translated packets
//! are described by a [`ScatterGather`] list whose rewritten headers are owned
//! and whose payloads borrow from the received buffer.

use std::io::IoSlice;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::checksum::{ipv4_header_checksum, Checksum};
use crate::error::{Nat64Error, Nat64Result};

/// IPv4 header size (without options).
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv6 header size (fixed).
pub const IPV6_HEADER_LEN: usize = 40;

/// ICMP and ICMPv6 header size (type, code, checksum, rest of header).
pub const ICMP_HEADER_LEN: usize = 8;

/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;

/// Minimum TCP header size.
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// Most segments a translated packet can need: outer IP, outer ICMP,
/// inner IP, inner transport/ICMP header, inner payload.
pub const MAX_SEGMENTS: usize = 5;

/// IP protocol numbers handled by the translator.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// A header type that can be parsed from the front of a byte region.
pub trait Header<'a>: Sized {
    /// Parse the header at the start of `data`.
    fn parse(data: &'a [u8]) -> Nat64Result<Self>;

    /// Length of the parsed header including options.
    fn header_len(&self) -> usize;
}

/// Immutable view over a contiguous region of a received packet.
///
/// A view never extends past its backing buffer. Sub-views are only created
/// from parsed header lengths.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    data: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Wrap a received buffer.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Number of bytes in the view.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The bytes covered by the view.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Parse a header at the start of the view.
    pub fn parse<H: Header<'a>>(&self) -> Nat64Result<H> {
        H::parse(self.data)
    }

    /// Sub-view starting right after `header`.
    pub fn next_to<H: Header<'a>>(&self, header: &H) -> PacketView<'a> {
        let offset = header.header_len().min(self.data.len());
        Self {
            data: &self.data[offset..],
        }
    }

    /// Shorten the view to at most `len` bytes.
    pub fn truncate(&self, len: usize) -> PacketView<'a> {
        Self {
            data: &self.data[..len.min(self.data.len())],
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn ensure_len(data: &[u8], needed: usize, what: &str) -> Nat64Result<()> {
    if data.len() < needed {
        return Err(Nat64Error::malformed(format!(
            "{} truncated: {} bytes, need {}",
            what,
            data.len(),
            needed
        )));
    }
    Ok(())
}

/// Version nibble of an IP packet, if any bytes are present.
pub fn ip_version(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 4)
}

/// IPv4 header, including options.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> for Ipv4Header<'a> {
    fn parse(data: &'a [u8]) -> Nat64Result<Self> {
        ensure_len(data, IPV4_HEADER_LEN, "IPv4 header")?;

        let version = data[0] >> 4;
        if version != 4 {
            return Err(Nat64Error::malformed(format!(
                "Not an IPv4 packet: version {}",
                version
            )));
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(Nat64Error::malformed(format!(
                "IPv4 header length {} below minimum",
                header_len
            )));
        }
        ensure_len(data, header_len, "IPv4 options")?;

        Ok(Self {
            data: &data[..header_len],
        })
    }

    fn header_len(&self) -> usize {
        self.data.len()
    }
}

impl Ipv4Header<'_> {
    pub fn tos(&self) -> u8 {
        self.data[1]
    }

    pub fn total_len(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn identification(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn dont_fragment(&self) -> bool {
        self.data[6] & 0x40 != 0
    }

    pub fn more_fragments(&self) -> bool {
        self.data[6] & 0x20 != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        read_u16(self.data, 6) & 0x1FFF
    }

    /// True for any fragment of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 10)
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    /// Declared payload length (total length minus header length).
    pub fn payload_len(&self) -> Nat64Result<usize> {
        usize::from(self.total_len())
            .checked_sub(self.data.len())
            .ok_or_else(|| {
                Nat64Error::malformed(format!(
                    "IPv4 total length {} smaller than header length {}",
                    self.total_len(),
                    self.data.len()
                ))
            })
    }
}

/// Fixed IPv6 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> for Ipv6Header<'a> {
    fn parse(data: &'a [u8]) -> Nat64Result<Self> {
        ensure_len(data, IPV6_HEADER_LEN, "IPv6 header")?;

        let version = data[0] >> 4;
        if version != 6 {
            return Err(Nat64Error::malformed(format!(
                "Not an IPv6 packet: version {}",
                version
            )));
        }

        Ok(Self {
            data: &data[..IPV6_HEADER_LEN],
        })
    }

    fn header_len(&self) -> usize {
        IPV6_HEADER_LEN
    }
}

impl Ipv6Header<'_> {
    pub fn traffic_class(&self) -> u8 {
        (self.data[0] << 4) | (self.data[1] >> 4)
    }

    pub fn flow_label(&self) -> u32 {
        u32::from_be_bytes([0, self.data[1] & 0x0F, self.data[2], self.data[3]])
    }

    pub fn payload_len(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn next_header(&self) -> u8 {
        self.data[6]
    }

    pub fn hop_limit(&self) -> u8 {
        self.data[7]
    }

    pub fn src(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(octets)
    }

    pub fn dst(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(octets)
    }
}

/// ICMP or ICMPv6 header (both share the 8-byte layout).
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> for IcmpHeader<'a> {
    fn parse(data: &'a [u8]) -> Nat64Result<Self> {
        ensure_len(data, ICMP_HEADER_LEN, "ICMP header")?;
        Ok(Self {
            data: &data[..ICMP_HEADER_LEN],
        })
    }

    fn header_len(&self) -> usize {
        ICMP_HEADER_LEN
    }
}

impl IcmpHeader<'_> {
    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 2)
    }

    /// The four type-specific bytes following the checksum.
    pub fn rest(&self) -> [u8; 4] {
        [self.data[4], self.data[5], self.data[6], self.data[7]]
    }

    /// Next-hop MTU of an ICMPv4 "fragmentation needed" message.
    pub fn mtu_v4(&self) -> u16 {
        read_u16(self.data, 6)
    }

    /// MTU of an ICMPv6 "packet too big" message.
    pub fn mtu_v6(&self) -> u32 {
        u32::from_be_bytes(self.rest())
    }

    pub fn as_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes.copy_from_slice(self.data);
        bytes
    }
}

/// UDP header.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> for UdpHeader<'a> {
    fn parse(data: &'a [u8]) -> Nat64Result<Self> {
        ensure_len(data, UDP_HEADER_LEN, "UDP header")?;
        Ok(Self {
            data: &data[..UDP_HEADER_LEN],
        })
    }

    fn header_len(&self) -> usize {
        UDP_HEADER_LEN
    }
}

impl UdpHeader<'_> {
    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn length(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 6)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }
}

/// TCP header, including options.
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> for TcpHeader<'a> {
    fn parse(data: &'a [u8]) -> Nat64Result<Self> {
        ensure_len(data, TCP_HEADER_MIN_LEN, "TCP header")?;

        let header_len = usize::from(data[12] >> 4) * 4;
        if header_len < TCP_HEADER_MIN_LEN {
            return Err(Nat64Error::malformed(format!(
                "TCP data offset {} below minimum",
                header_len
            )));
        }
        ensure_len(data, header_len, "TCP options")?;

        Ok(Self {
            data: &data[..header_len],
        })
    }

    fn header_len(&self) -> usize {
        self.data.len()
    }
}

impl TcpHeader<'_> {
    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 16)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }
}

/// Offset of the checksum field within a transport header.
pub fn transport_checksum_offset(protocol: u8) -> Option<usize> {
    match protocol {
        proto::TCP => Some(16),
        proto::UDP => Some(6),
        proto::ICMP | proto::ICMPV6 => Some(2),
        _ => None,
    }
}

/// Fields of an IPv4 header to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Repr {
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Repr {
    /// Emit a 20-byte header with a valid header checksum.
    pub fn emit(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut header = [0u8; IPV4_HEADER_LEN];
        header[0] = 0x45; // Version 4, IHL 5
        header[1] = self.tos;
        header[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        header[4..6].copy_from_slice(&self.identification.to_be_bytes());
        if self.dont_fragment {
            header[6] = 0x40;
        }
        header[8] = self.ttl;
        header[9] = self.protocol;
        header[12..16].copy_from_slice(&self.src.octets());
        header[16..20].copy_from_slice(&self.dst.octets());

        let checksum = ipv4_header_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        header
    }
}

/// Fields of an IPv6 header to synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Repr {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Repr {
    pub fn emit(&self) -> [u8; IPV6_HEADER_LEN] {
        let mut header = [0u8; IPV6_HEADER_LEN];
        let first = (6u32 << 28)
            | (u32::from(self.traffic_class) << 20)
            | (self.flow_label & 0x000F_FFFF);
        header[0..4].copy_from_slice(&first.to_be_bytes());
        header[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        header[6] = self.next_header;
        header[7] = self.hop_limit;
        header[8..24].copy_from_slice(&self.src.octets());
        header[24..40].copy_from_slice(&self.dst.octets());
        header
    }
}

/// One element of a scatter-gather list.
///
/// Rewritten headers are owned; untouched payload borrows from the received
/// packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Synthesized IPv4 header.
    Ipv4([u8; IPV4_HEADER_LEN]),
    /// Synthesized IPv6 header.
    Ipv6([u8; IPV6_HEADER_LEN]),
    /// Synthesized ICMP or ICMPv6 header.
    Icmp([u8; ICMP_HEADER_LEN]),
    /// Rewritten TCP or UDP header.
    Transport(Vec<u8>),
    /// Bytes copied verbatim from the received packet.
    Payload(&'a [u8]),
}

impl Segment<'_> {
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutable access to owned segment bytes. Borrowed payload is read-only.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Segment::Ipv4(b) => Some(b),
            Segment::Ipv6(b) => Some(b),
            Segment::Icmp(b) => Some(b),
            Segment::Transport(b) => Some(b),
            Segment::Payload(_) => None,
        }
    }
}

impl AsRef<[u8]> for Segment<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            Segment::Ipv4(b) => b,
            Segment::Ipv6(b) => b,
            Segment::Icmp(b) => b,
            Segment::Transport(b) => b,
            Segment::Payload(b) => b,
        }
    }
}

/// Ordered segment list sent as one datagram.
///
/// Segment 0 is always the outer IP header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterGather<'a> {
    segments: Vec<Segment<'a>>,
}

impl<'a> ScatterGather<'a> {
    pub fn new() -> Self {
        Self {
            segments: Vec::with_capacity(MAX_SEGMENTS),
        }
    }

    /// Append a segment. Empty payload segments are skipped.
    pub fn push(&mut self, segment: Segment<'a>) {
        if matches!(segment, Segment::Payload(b) if b.is_empty()) {
            return;
        }
        debug_assert!(self.segments.len() < MAX_SEGMENTS, "too many segments");
        self.segments.push(segment);
    }

    /// Append every segment of `other`.
    pub fn extend(&mut self, other: ScatterGather<'a>) {
        for segment in other.segments {
            self.push(segment);
        }
    }

    pub fn segments(&self) -> &[Segment<'a>] {
        &self.segments
    }

    pub fn segment_mut(&mut self, index: usize) -> Option<&mut Segment<'a>> {
        self.segments.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total datagram length in bytes.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Length of everything after segment `start`, inclusive.
    pub fn len_from(&self, start: usize) -> usize {
        self.segments.iter().skip(start).map(Segment::len).sum()
    }

    /// Checksum over segments `start..`, seeded with a pseudo-header sum.
    pub fn checksum_from(&self, start: usize, pseudo_header: u32) -> u16 {
        let mut checksum = Checksum::new();
        checksum.add_sum(pseudo_header);
        for segment in self.segments.iter().skip(start) {
            checksum.add_bytes(segment.as_ref());
        }
        checksum.finish()
    }

    /// Write a 16-bit checksum into an owned segment at `offset`.
    pub fn patch_checksum(&mut self, index: usize, offset: usize, value: u16) -> Nat64Result<()> {
        let bytes = self
            .segments
            .get_mut(index)
            .and_then(Segment::bytes_mut)
            .filter(|b| b.len() >= offset + 2)
            .ok_or_else(|| {
                Nat64Error::malformed(format!("No writable checksum in segment {}", index))
            })?;
        bytes[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Shorten a trailing payload segment so the datagram fits in `max_len`.
    ///
    /// Owned header segments are never cut.
    pub fn truncate_payload(&mut self, max_len: usize) {
        let total = self.total_len();
        if total <= max_len {
            return;
        }
        let excess = total - max_len;
        if let Some(Segment::Payload(bytes)) = self.segments.last_mut() {
            let payload: &'a [u8] = *bytes;
            *bytes = &payload[..payload.len().saturating_sub(excess)];
        }
        if matches!(self.segments.last(), Some(Segment::Payload(b)) if b.is_empty()) {
            self.segments.pop();
        }
    }

    /// I/O slices for a vectored send.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.segments.iter().map(|s| IoSlice::new(s.as_ref())).collect()
    }

    /// Concatenate all segments into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len());
        for segment in &self.segments {
            out.extend_from_slice(segment.as_ref());
        }
        out
    }
}
