//! IPv4 to IPv6.

use std::net::{IpAddr, Ipv6Addr};

use super::icmp::{self, IcmpKind, IcmpTranslation};
use super::{
    rewrite_embedded_transport, rewrite_transport, Datagram, DropReason, Level, Translation,
    Translator,
};
use crate::checksum::{
    adjust_checksum_4to6, fold_checksum, ipv6_pseudo_header_sum, update_checksum_16,
};
use crate::error::{IcmpFamily, Nat64Error, Nat64Result};
use crate::packet::{
    proto, IcmpHeader, Ipv4Header, Ipv6Repr, PacketView, ScatterGather, Segment,
    IPV6_HEADER_LEN,
};

/// Translated ICMPv6 errors must fit the IPv6 minimum MTU.
const ICMPV6_ERROR_MAX_LEN: usize = 1280;

pub(super) fn translate<'a>(
    translator: &Translator,
    view: PacketView<'a>,
    level: Level,
) -> Nat64Result<Translation<'a>> {
    let ip: Ipv4Header<'a> = view.parse()?;
    let total_len = usize::from(ip.total_len());
    let payload_len = ip.payload_len()?;

    // An embedded datagram is normally cut short; only the outer one must be whole.
    if level == Level::Outer && total_len > view.size() {
        return Err(Nat64Error::malformed(format!(
            "IPv4 total length {} exceeds {} received bytes",
            total_len,
            view.size()
        )));
    }

    if ip.is_fragment() {
        return Ok(Translation::Drop(DropReason::Fragment));
    }

    let hop_limit = match level {
        // No time exceeded is generated in this direction.
        Level::Outer if ip.ttl() <= 1 => return Ok(Translation::Drop(DropReason::TtlExpired)),
        Level::Outer => ip.ttl() - 1,
        Level::Inner => ip.ttl(),
    };

    let payload = view.truncate(total_len).next_to(&ip);

    let next_header = match ip.protocol() {
        proto::ICMP => proto::ICMPV6,
        p @ (proto::TCP | proto::UDP) => p,
        other => return Ok(Translation::Drop(DropReason::UnsupportedProtocol(other))),
    };

    // Classify ICMP before touching the binding table.
    let icmp_plan = if ip.protocol() == proto::ICMP {
        let header: IcmpHeader<'a> = payload.parse()?;
        if level == Level::Inner && icmp::is_error_v4(header.icmp_type()) {
            return Err(Nat64Error::NestedIcmpError {
                family: IcmpFamily::V4,
                icmp_type: header.icmp_type(),
            });
        }
        match icmp::map_v4_to_v6(&header)? {
            Some(mapped) => Some((header, mapped)),
            None => {
                return Ok(Translation::Drop(DropReason::IcmpFiltered {
                    family: IcmpFamily::V4,
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
            match icmp_body(translator, payload.next_to(&header), mapped, src, dst)? {
                Ok(body) => body,
                Err(reason) => return Ok(Translation::Drop(reason)),
            }
        }
        (Some((header, mapped)), Level::Inner) => {
            embedded_echo_body(payload.next_to(&header), &header, mapped, src, dst, payload_len)
        }
        (None, Level::Outer) => {
            let pseudo = ipv6_pseudo_header_sum(src, dst, next_header, payload_len as u32);
            rewrite_transport(payload, next_header, pseudo)?
        }
        (None, Level::Inner) => {
            let src4 = ip.src();
            let dst4 = ip.dst();
            let declared = payload_len as u16;
            rewrite_embedded_transport(payload, next_header, |old| {
                adjust_checksum_4to6(old, src4, dst4, src, dst, next_header, declared)
                    .unwrap_or(old)
            })
        }
    };

    let ipv6_payload_len = match level {
        Level::Outer => body.total_len(),
        Level::Inner => payload_len,
    };
    let header = Ipv6Repr {
        traffic_class: ip.tos(),
        flow_label: 0,
        payload_len: u16::try_from(ipv6_payload_len)
            .map_err(|_| Nat64Error::malformed("Translated IPv6 payload too large"))?,
        next_header,
        hop_limit,
        src,
        dst,
    };

    let mut segments = ScatterGather::new();
    segments.push(Segment::Ipv6(header.emit()));
    segments.extend(body);

    Ok(Translation::Forward(Datagram {
        segments,
        destination: IpAddr::V6(dst),
    }))
}

/// Source and destination in the IPv6 world.
///
/// An embedded datagram travelled the opposite way, so its source is the
/// leased address and its destination is an IPv4 host.
fn resolve(
    translator: &Translator,
    ip: &Ipv4Header<'_>,
    level: Level,
) -> Nat64Result<(Ipv6Addr, Ipv6Addr)> {
    let prefix = translator.prefix();
    let bindings = translator.bindings();
    match level {
        Level::Outer => Ok((prefix.embed(ip.src()), bindings.lookup_v6_for(ip.dst())?)),
        Level::Inner => Ok((bindings.lookup_v6_for(ip.src())?, prefix.embed(ip.dst()))),
    }
}

/// Body of an outer ICMPv6 message with a freshly computed checksum.
///
/// The inner result is `Err` when the embedded datagram is dropped.
fn icmp_body<'a>(
    translator: &Translator,
    rest: PacketView<'a>,
    mapped: IcmpTranslation,
    src: Ipv6Addr,
    dst: Ipv6Addr,
) -> Nat64Result<Result<ScatterGather<'a>, DropReason>> {
    let mut body = ScatterGather::new();
    body.push(Segment::Icmp(mapped.header()));

    match mapped.kind {
        IcmpKind::Informational => body.push(Segment::Payload(rest.bytes())),
        IcmpKind::Error => match translate(translator, rest, Level::Inner)? {
            Translation::Forward(inner) => {
                body.extend(inner.segments);
                body.truncate_payload(ICMPV6_ERROR_MAX_LEN - IPV6_HEADER_LEN);
            }
            Translation::Drop(reason) => return Ok(Err(reason)),
            Translation::Reply(_) => {
                return Err(Nat64Error::malformed("Embedded datagram produced a reply"))
            }
        },
    }

    let pseudo = ipv6_pseudo_header_sum(src, dst, proto::ICMPV6, body.total_len() as u32);
    let checksum = body.checksum_from(0, pseudo);
    body.patch_checksum(0, 2, checksum)?;
    Ok(Ok(body))
}

/// Echo message embedded in an ICMP error.
///
/// Only part of the message may be present, so the checksum is updated for
/// the type change and the added pseudo-header instead of recomputed.
fn embedded_echo_body<'a>(
    rest: PacketView<'a>,
    header: &IcmpHeader<'a>,
    mapped: IcmpTranslation,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    declared_len: usize,
) -> ScatterGather<'a> {
    let old_word = u16::from_be_bytes([header.icmp_type(), header.code()]);
    let new_word = u16::from_be_bytes([mapped.icmp_type, mapped.code]);
    let checksum = update_checksum_16(header.checksum(), old_word, new_word);

    let pseudo = fold_checksum(ipv6_pseudo_header_sum(
        src,
        dst,
        proto::ICMPV6,
        declared_len as u32,
    ));
    let checksum = update_checksum_16(checksum, 0, pseudo);

    let mut icmp_header = mapped.header();
    icmp_header[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut body = ScatterGather::new();
    body.push(Segment::Icmp(icmp_header));
    body.push(Segment::Payload(rest.bytes()));
    body
}
