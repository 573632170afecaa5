//! Internet checksum (RFC 1071) over scattered buffers.
//!
//! Translated packets are never copied into one contiguous buffer, so the
//! checksum has to be computed over the same segment list that is handed to
//! the egress socket. [`Checksum`] accumulates segments in order and keeps
//! track of whether the previous segment ended on an odd byte, which shifts
//! the 16-bit word boundary of the next one.
//!
//! The pseudo-header helpers and the RFC 1624 incremental updates are used
//! for the transport checksums of translated packets.

use std::net::{Ipv4Addr, Ipv6Addr};

const UDP_PROTOCOL: u8 = 17;

/// Running ones' complement sum over a logically contiguous byte stream that
/// may be physically split into several segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum {
    sum: u32,
    /// The last segment ended in the high byte of an unfinished word.
    odd: bool,
}

impl Checksum {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precomputed (unfolded) sum, e.g. a pseudo-header sum.
    ///
    /// The sum is added on a word boundary; calling this after an odd-length
    /// segment would misalign it, so it is expected before any odd segment.
    pub fn add_sum(&mut self, sum: u32) -> &mut Self {
        debug_assert!(!self.odd, "pre-summed words must start on a word boundary");
        self.sum = u32::from(fold_checksum(self.sum)) + u32::from(fold_checksum(sum));
        self
    }

    /// Add the next segment of the stream.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        let mut data = data;

        // Complete the word left open by the previous segment.
        if self.odd {
            if let Some((&low, rest)) = data.split_first() {
                self.sum += u32::from(low);
                self.odd = false;
                data = rest;
            }
        }

        self.sum = u32::from(fold_checksum(self.sum)) + ones_complement_sum(data);

        if data.len() % 2 == 1 {
            self.odd = true;
        }
        self
    }

    /// Add several segments in order.
    pub fn add_segments<S: AsRef<[u8]>>(&mut self, segments: &[S]) -> &mut Self {
        for segment in segments {
            self.add_bytes(segment.as_ref());
        }
        self
    }

    /// Folded ones' complement sum (before complementing).
    pub fn sum(&self) -> u16 {
        fold_checksum(self.sum)
    }

    /// Final checksum value: the complement of the folded sum.
    pub fn finish(&self) -> u16 {
        !self.sum()
    }
}

/// Complement checksum over a list of segments treated as one datagram.
pub fn complement_checksum<S: AsRef<[u8]>>(segments: &[S]) -> u16 {
    Checksum::new().add_segments(segments).finish()
}

/// Compute the ones' complement sum of 16-bit words in a byte slice.
///
/// A trailing odd byte is treated as the high byte of a zero-padded word.
#[inline]
pub fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Keep headroom for jumbo-sized input.
        if sum & 0x8000_0000 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    sum
}

/// Fold a 32-bit sum into a 16-bit ones' complement value.
#[inline]
pub fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Compute the final ones' complement checksum of one contiguous buffer.
#[inline]
pub fn compute_checksum(data: &[u8]) -> u16 {
    !fold_checksum(ones_complement_sum(data))
}

/// Compute IPv4 header checksum.
///
/// The checksum field in the header should be set to 0 before calling this.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    debug_assert!(
        header.len() >= 20 && header.len() % 4 == 0,
        "IPv4 header length must be a multiple of 4 bytes and at least 20, got {}",
        header.len()
    );
    compute_checksum(header)
}

/// Compute IPv4 pseudo-header contribution to TCP/UDP checksum.
pub fn ipv4_pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let src = src.octets();
    let dst = dst.octets();

    let mut sum: u32 = 0;
    sum += u32::from(u16::from_be_bytes([src[0], src[1]]));
    sum += u32::from(u16::from_be_bytes([src[2], src[3]]));
    sum += u32::from(u16::from_be_bytes([dst[0], dst[1]]));
    sum += u32::from(u16::from_be_bytes([dst[2], dst[3]]));
    sum += u32::from(protocol);
    sum += u32::from(length);
    sum
}

/// Compute IPv6 pseudo-header contribution to upper-layer checksums.
pub fn ipv6_pseudo_header_sum(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, length: u32) -> u32 {
    let mut sum: u32 = 0;

    for word in src.segments().into_iter().chain(dst.segments()) {
        sum += u32::from(word);
    }

    // Upper-layer packet length (32-bit, summed as two 16-bit values)
    sum += length >> 16;
    sum += length & 0xFFFF;

    // Next header (padded to 32 bits, upper 3 bytes are zero)
    sum += u32::from(next_header);

    sum
}

/// Update a checksum incrementally when a 16-bit quantity changes.
///
/// RFC 1624: `HC' = ~(~HC + ~m + m')`. `old_value` and `new_value` may also be
/// folded sums of larger regions that were removed from and added to the
/// checksummed data.
#[inline]
pub fn update_checksum_16(old_checksum: u16, old_value: u16, new_value: u16) -> u16 {
    let hc = u32::from(!old_checksum);
    let m = u32::from(!old_value);
    let m_prime = u32::from(new_value);

    !fold_checksum(hc + m + m_prime)
}

/// Adjust TCP/UDP checksum for IPv6-to-IPv4 translation.
///
/// Replaces the IPv6 pseudo-header contribution with the IPv4 one. A UDP
/// checksum of zero is kept as zero ("no checksum" in IPv4); a computed UDP
/// checksum of zero is sent as 0xFFFF.
pub fn adjust_checksum_6to4(
    old_checksum: u16,
    src6: Ipv6Addr,
    dst6: Ipv6Addr,
    src4: Ipv4Addr,
    dst4: Ipv4Addr,
    protocol: u8,
    payload_len: u16,
) -> u16 {
    if protocol == UDP_PROTOCOL && old_checksum == 0 {
        return 0;
    }

    let old_pseudo = fold_checksum(ipv6_pseudo_header_sum(
        src6,
        dst6,
        protocol,
        u32::from(payload_len),
    ));
    let new_pseudo = fold_checksum(ipv4_pseudo_header_sum(src4, dst4, protocol, payload_len));

    let adjusted = update_checksum_16(old_checksum, old_pseudo, new_pseudo);
    if protocol == UDP_PROTOCOL && adjusted == 0 {
        0xFFFF
    } else {
        adjusted
    }
}

/// Adjust TCP/UDP checksum for IPv4-to-IPv6 translation.
///
/// Returns `None` for the IPv4 UDP zero-checksum case, because IPv6 requires
/// a checksum and the caller must recompute it over the full datagram.
pub fn adjust_checksum_4to6(
    old_checksum: u16,
    src4: Ipv4Addr,
    dst4: Ipv4Addr,
    src6: Ipv6Addr,
    dst6: Ipv6Addr,
    protocol: u8,
    payload_len: u16,
) -> Option<u16> {
    if protocol == UDP_PROTOCOL && old_checksum == 0 {
        return None;
    }

    let old_pseudo = fold_checksum(ipv4_pseudo_header_sum(src4, dst4, protocol, payload_len));
    let new_pseudo = fold_checksum(ipv6_pseudo_header_sum(
        src6,
        dst6,
        protocol,
        u32::from(payload_len),
    ));

    let adjusted = update_checksum_16(old_checksum, old_pseudo, new_pseudo);
    if protocol == UDP_PROTOCOL && adjusted == 0 {
        Some(0xFFFF)
    } else {
        Some(adjusted)
    }
}
