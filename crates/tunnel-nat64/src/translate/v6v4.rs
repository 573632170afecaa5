//! IPv6 to IPv4.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::icmp::{self, IcmpKind, IcmpTranslation};
use super::{
    rewrite_embedded_transport, rewrite_transport, Datagram, DropReason, Level, Translation,
    Translator,
};
use crate::checksum::{
    adjust_checksum_6to4, Checksum, fold_checksum, ipv4_pseudo_header_sum, ipv6_pseudo_header_sum,
    update_checksum_16,
};
use crate::error::{IcmpFamily, Nat64Error, Nat64Result};
use crate::packet::{
    proto, IcmpHeader, Ipv4Repr, Ipv6Header, Ipv6Repr, PacketView, ScatterGather, Segment,
    ICMP_HEADER_LEN, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
};

/// ICMPv6 errors we originate must fit the IPv6 minimum MTU.
const ICMPV6_ERROR_MAX_LEN: usize = 1280;

/// Hop limit of locally generated ICMPv6 errors.
const REPLY_HOP_LIMIT: u8 = 64;

pub(super) fn translate<'a>(
    translator: &Translator,
    view: PacketView<'a>,
    level: Level,
) -> Nat64Result<Translation<'a>> {
    let ip: Ipv6Header<'a> = view.parse()?;
    let payload_len = usize::from(ip.payload_len());
    let declared_len = IPV6_HEADER_LEN + payload_len;

    if level == Level::Outer && declared_len > view.size() {
        return Err(Nat64Error::malformed(format!(
            "IPv6 payload length {} exceeds {} received bytes",
            payload_len,
            view.size() - IPV6_HEADER_LEN
        )));
    }

    let packet = view.truncate(declared_len);
    let payload = packet.next_to(&ip);

    let ttl = match level {
        Level::Outer if ip.hop_limit() <= 1 => {
            return Ok(time_exceeded(&ip, packet, payload));
        }
        Level::Outer => ip.hop_limit() - 1,
        Level::Inner => ip.hop_limit(),
    };

    // Extension headers are not walked; they fall through to the drop path.
    let protocol = match ip.next_header() {
        proto::ICMPV6 => proto::ICMP,
        p @ (proto::TCP | proto::UDP) => p,
        other => return Ok(Translation::Drop(DropReason::UnsupportedProtocol(other))),
    };

    // Classify ICMPv6 before touching the binding table, so neighbor
    // discovery from link-local sources never takes a lease.
    let icmp_plan = if ip.next_header() == proto::ICMPV6 {
        let header: IcmpHeader<'a> = payload.parse()?;
        if level == Level::Inner && icmp::is_error_v6(header.icmp_type()) {
            return Err(Nat64Error::NestedIcmpError {
                family: IcmpFamily::V6,
                icmp_type: header.icmp_type(),
            });
        }
        match icmp::map_v6_to_v4(&header)? {
            Some(mapped) => Some((header, mapped)),
            None => {
                return Ok(Translation::Drop(DropReason::IcmpFiltered {
                    family: IcmpFamily::V6,
                    icmp_type: header.icmp_type(),
                    code: header.code(),
                }))
            }
        }
    } else {
        None
    };

    let (src, dst) = resolve(translator, &ip, level)?;

    let body = match (icmp_plan, level) {
        (Some((header, mapped)), Level::Outer) => {
            match icmp_body(translator, payload.next_to(&header), mapped)? {
                Ok(body) => body,
                Err(reason) => return Ok(Translation::Drop(reason)),
            }
        }
        (Some((header, mapped)), Level::Inner) => embedded_echo_body(
            payload.next_to(&header),
            &header,
            mapped,
            (ip.src(), ip.dst()),
            payload_len,
        ),
        (None, Level::Outer) => {
            let pseudo = ipv4_pseudo_header_sum(src, dst, protocol, payload_len as u16);
            rewrite_transport(payload, protocol, pseudo)?
        }
        (None, Level::Inner) => {
            let src6 = ip.src();
            let dst6 = ip.dst();
            let declared = payload_len as u16;
            rewrite_embedded_transport(payload, protocol, |old| {
                adjust_checksum_6to4(old, src6, dst6, src, dst, protocol, declared)
            })
        }
    };

    let ipv4_payload_len = match level {
        Level::Outer => body.total_len(),
        Level::Inner => payload_len,
    };
    let header = Ipv4Repr {
        tos: ip.traffic_class(),
        total_len: u16::try_from(IPV4_HEADER_LEN + ipv4_payload_len)
            .map_err(|_| Nat64Error::malformed("Translated IPv4 packet exceeds 65535 bytes"))?,
        identification: 0,
        dont_fragment: true,
        ttl,
        protocol,
        src,
        dst,
    };

    let mut segments = ScatterGather::new();
    segments.push(Segment::Ipv4(header.emit()));
    segments.extend(body);

    Ok(Translation::Forward(Datagram {
        segments,
        destination: IpAddr::V4(dst),
    }))
}

/// Source and destination in the IPv4 world.
///
/// An embedded datagram travelled the opposite way, so its source is an
/// IPv4 host behind the prefix and its destination holds the lease.
fn resolve(
    translator: &Translator,
    ip: &Ipv6Header<'_>,
    level: Level,
) -> Nat64Result<(Ipv4Addr, Ipv4Addr)> {
    let prefix = translator.prefix();
    let bindings = translator.bindings();
    match level {
        Level::Outer => Ok((bindings.lookup_v4_for(ip.src())?, prefix.extract(ip.dst()))),
        Level::Inner => Ok((prefix.extract(ip.src()), bindings.lookup_v4_for(ip.dst())?)),
    }
}

/// ICMPv6 time exceeded back to the sender, or a silent drop when an error
/// must not be generated (RFC 4443 section 2.4 (e)).
fn time_exceeded<'a>(
    ip: &Ipv6Header<'a>,
    packet: PacketView<'a>,
    payload: PacketView<'a>,
) -> Translation<'a> {
    let is_icmp_error = ip.next_header() == proto::ICMPV6
        && payload
            .bytes()
            .first()
            .is_some_and(|&t| icmp::is_error_v6(t));
    let src = ip.src();
    let dst = ip.dst();
    if is_icmp_error || src.is_unspecified() || src.is_multicast() || dst.is_multicast() {
        return Translation::Drop(DropReason::TtlExpired);
    }

    let quoted = packet
        .truncate(ICMPV6_ERROR_MAX_LEN - IPV6_HEADER_LEN - ICMP_HEADER_LEN)
        .bytes();
    let length = ICMP_HEADER_LEN + quoted.len();

    let mut icmp_header = [icmp::v6::TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
    let checksum = Checksum::new()
        .add_sum(ipv6_pseudo_header_sum(dst, src, proto::ICMPV6, length as u32))
        .add_bytes(&icmp_header)
        .add_bytes(quoted)
        .finish();
    icmp_header[2..4].copy_from_slice(&checksum.to_be_bytes());

    let header = Ipv6Repr {
        traffic_class: 0,
        flow_label: 0,
        payload_len: length as u16,
        next_header: proto::ICMPV6,
        hop_limit: REPLY_HOP_LIMIT,
        src: dst,
        dst: src,
    };

    let mut segments = ScatterGather::new();
    segments.push(Segment::Ipv6(header.emit()));
    segments.push(Segment::Icmp(icmp_header));
    segments.push(Segment::Payload(quoted));

    log::debug!("Hop limit exceeded for {} -> {}, replying", src, dst);
    Translation::Reply(Datagram {
        segments,
        destination: IpAddr::V6(src),
    })
}

/// Body of an outer ICMP message with a freshly computed checksum.
///
/// The inner result is `Err` when the embedded datagram is dropped.
fn icmp_body<'a>(
    translator: &Translator,
    rest: PacketView<'a>,
    mapped: IcmpTranslation,
) -> Nat64Result<Result<ScatterGather<'a>, DropReason>> {
    let mut body = ScatterGather::new();
    body.push(Segment::Icmp(mapped.header()));

    match mapped.kind {
        IcmpKind::Informational => body.push(Segment::Payload(rest.bytes())),
        IcmpKind::Error => match translate(translator, rest, Level::Inner)? {
            Translation::Forward(inner) => body.extend(inner.segments),
            Translation::Drop(reason) => return Ok(Err(reason)),
            Translation::Reply(_) => {
                return Err(Nat64Error::malformed("Embedded datagram produced a reply"))
            }
        },
    }

    // ICMP has no pseudo-header.
    let checksum = body.checksum_from(0, 0);
    body.patch_checksum(0, 2, checksum)?;
    Ok(Ok(body))
}

/// Echo message embedded in an ICMPv6 error.
///
/// The IPv6 pseudo-header is removed from the checksum incrementally because
/// the message may be incomplete.
fn embedded_echo_body<'a>(
    rest: PacketView<'a>,
    header: &IcmpHeader<'a>,
    mapped: IcmpTranslation,
    (src6, dst6): (Ipv6Addr, Ipv6Addr),
    declared_len: usize,
) -> ScatterGather<'a> {
    let old_word = u16::from_be_bytes([header.icmp_type(), header.code()]);
    let new_word = u16::from_be_bytes([mapped.icmp_type, mapped.code]);
    let checksum = update_checksum_16(header.checksum(), old_word, new_word);

    let pseudo = fold_checksum(ipv6_pseudo_header_sum(
        src6,
        dst6,
        proto::ICMPV6,
        declared_len as u32,
    ));
    let checksum = update_checksum_16(checksum, pseudo, 0);

    let mut icmp_header = mapped.header();
    icmp_header[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut body = ScatterGather::new();
    body.push(Segment::Icmp(icmp_header));
    body.push(Segment::Payload(rest.bytes()));
    body
}
