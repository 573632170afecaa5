//! End-to-end translation through the public API with a capturing egress.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use tunnel_nat64::checksum::{compute_checksum, ipv6_pseudo_header_sum, Checksum};
use tunnel_nat64::packet::{proto, Header, Ipv4Header, Ipv6Header, Ipv6Repr, ScatterGather};
use tunnel_nat64::{
    BindingTable, Disposition, DropReason, Egress, Nat64Config, Nat64Error, Nat64Prefix,
    Nat64Result, Translator,
};

#[derive(Default)]
struct CaptureEgress {
    datagrams: Mutex<Vec<(Vec<u8>, IpAddr)>>,
}

impl CaptureEgress {
    fn take(&self) -> Vec<(Vec<u8>, IpAddr)> {
        std::mem::take(&mut *self.datagrams.lock().unwrap())
    }
}

impl Egress for CaptureEgress {
    fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
        self.datagrams
            .lock()
            .unwrap()
            .push((segments.to_vec(), destination));
        Ok(())
    }
}

/// Rejects datagrams above `mtu` the way a raw socket does.
struct MtuEgress {
    mtu: usize,
    inner: CaptureEgress,
}

impl Egress for MtuEgress {
    fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
        if segments.total_len() > self.mtu {
            #[cfg(target_os = "macos")]
            const EMSGSIZE: i32 = 40;
            #[cfg(not(target_os = "macos"))]
            const EMSGSIZE: i32 = 90;
            return Err(std::io::Error::from_raw_os_error(EMSGSIZE).into());
        }
        self.inner.send(segments, destination)
    }
}

const HOST: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0xaaaa, 0, 0, 0, 0, 0x10);
const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 80);

fn setup() -> (Translator, Arc<CaptureEgress>) {
    let config = Nat64Config {
        pool: vec!["192.0.2.0/29".parse().unwrap()],
        reserved: vec![Ipv4Addr::new(192, 0, 2, 1)],
        ..Default::default()
    };
    config.validate().unwrap();
    let table = Arc::new(config.build_binding_table().unwrap());
    let translator = Translator::new(config.nat64_prefix().unwrap(), table);
    (translator, Arc::new(CaptureEgress::default()))
}

fn ipv6_udp(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut udp = Vec::with_capacity(len);
    udp.extend_from_slice(&40000u16.to_be_bytes());
    udp.extend_from_slice(&53u16.to_be_bytes());
    udp.extend_from_slice(&(len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let checksum = Checksum::new()
        .add_sum(ipv6_pseudo_header_sum(src, dst, proto::UDP, len as u32))
        .add_bytes(&udp)
        .finish();
    udp[6..8].copy_from_slice(&checksum.to_be_bytes());

    let mut packet = Ipv6Repr {
        traffic_class: 0,
        flow_label: 0,
        payload_len: len as u16,
        next_header: proto::UDP,
        hop_limit: 64,
        src,
        dst,
    }
    .emit()
    .to_vec();
    packet.extend_from_slice(&udp);
    packet
}

/// Turn a translated IPv4 UDP datagram into the server's reply.
fn server_reply(request: &[u8], payload: &[u8]) -> Vec<u8> {
    let ip = Ipv4Header::parse(request).unwrap();
    let udp = &request[20..28];
    let len = 8 + payload.len();

    let mut reply = vec![0u8; 20 + len];
    reply[0] = 0x45;
    reply[2..4].copy_from_slice(&((20 + len) as u16).to_be_bytes());
    reply[8] = 57;
    reply[9] = proto::UDP;
    reply[12..16].copy_from_slice(&ip.dst().octets());
    reply[16..20].copy_from_slice(&ip.src().octets());
    let header_checksum = compute_checksum(&reply[..20]);
    reply[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    reply[20..22].copy_from_slice(&udp[2..4]);
    reply[22..24].copy_from_slice(&udp[0..2]);
    reply[24..26].copy_from_slice(&(len as u16).to_be_bytes());
    reply[28..].copy_from_slice(payload);
    // Leave the UDP checksum at zero; the translator must compute one for IPv6.
    reply
}

fn udp_checksum_ok_v6(packet: &[u8]) -> bool {
    let ip = Ipv6Header::parse(packet).unwrap();
    let udp = &packet[40..];
    let sum = Checksum::new()
        .add_sum(ipv6_pseudo_header_sum(ip.src(), ip.dst(), proto::UDP, udp.len() as u32))
        .add_bytes(udp)
        .finish();
    sum == 0
}

#[test]
fn test_request_and_reply_round_trip() {
    let (translator, egress) = setup();
    let server_v6 = Nat64Prefix::WELL_KNOWN.embed(SERVER);

    let request = ipv6_udp(HOST, server_v6, b"example query");
    assert!(matches!(
        translator.process(&request, &*egress).unwrap(),
        Disposition::Sent
    ));

    let sent = egress.take();
    assert_eq!(sent.len(), 1);
    let (v4_request, destination) = &sent[0];
    assert_eq!(*destination, IpAddr::V4(SERVER));

    let ip = Ipv4Header::parse(v4_request).unwrap();
    // .1 is reserved, so the first lease is .2.
    assert_eq!(ip.src(), Ipv4Addr::new(192, 0, 2, 2));
    assert_eq!(ip.dst(), SERVER);
    assert_eq!(ip.ttl(), 63);

    let reply = server_reply(v4_request, b"example answer");
    assert!(matches!(
        translator.process(&reply, &*egress).unwrap(),
        Disposition::Sent
    ));

    let sent = egress.take();
    let (v6_reply, destination) = &sent[0];
    assert_eq!(*destination, IpAddr::V6(HOST));

    let ip = Ipv6Header::parse(v6_reply).unwrap();
    assert_eq!(ip.src(), server_v6);
    assert_eq!(ip.dst(), HOST);
    assert_eq!(ip.hop_limit(), 56);
    assert_eq!(&v6_reply[48..], b"example answer");
    assert!(udp_checksum_ok_v6(v6_reply));

    assert_eq!(translator.bindings().active_bindings(), 1);
}

#[test]
fn test_hosts_get_distinct_leases_until_exhausted() {
    let (translator, egress) = setup();
    let server_v6 = Nat64Prefix::WELL_KNOWN.embed(SERVER);

    // /29 gives .1-.6; .1 is reserved.
    let mut leased = Vec::new();
    for i in 0..5u16 {
        let host = Ipv6Addr::new(0x2001, 0xdb8, 0xaaaa, 0, 0, 0, 1, i);
        translator
            .process(&ipv6_udp(host, server_v6, b"hi"), &*egress)
            .unwrap();
        leased.push(translator.bindings().lookup_v4_for(host).unwrap());
    }
    assert_eq!(
        leased,
        (2..=6).map(|i| Ipv4Addr::new(192, 0, 2, i)).collect::<Vec<_>>()
    );
    assert_eq!(egress.take().len(), 5);

    let late = Ipv6Addr::new(0x2001, 0xdb8, 0xaaaa, 0, 0, 0, 2, 0);
    match translator
        .process(&ipv6_udp(late, server_v6, b"hi"), &*egress)
        .unwrap()
    {
        Disposition::Failed(Nat64Error::PoolExhausted(addr)) => assert_eq!(addr, late),
        other => panic!("expected pool exhaustion, got {:?}", other),
    }
    assert!(egress.take().is_empty());
}

#[test]
fn test_unknown_destination_and_drops_send_nothing() {
    let (translator, egress) = setup();

    let mut packet = ipv6_udp(HOST, Nat64Prefix::WELL_KNOWN.embed(SERVER), b"x");
    packet[6] = 60; // destination options header
    assert!(matches!(
        translator.process(&packet, &*egress).unwrap(),
        Disposition::Dropped(DropReason::UnsupportedProtocol(60))
    ));

    // IPv4 traffic to a pool address nobody holds.
    let mut v4 = vec![0u8; 28];
    v4[0] = 0x45;
    v4[3] = 28;
    v4[8] = 64;
    v4[9] = proto::UDP;
    v4[12..16].copy_from_slice(&SERVER.octets());
    v4[16..20].copy_from_slice(&[192, 0, 2, 5]);
    v4[25] = 8;
    assert!(matches!(
        translator.process(&v4, &*egress).unwrap(),
        Disposition::Failed(Nat64Error::NoBinding(_))
    ));

    assert!(egress.take().is_empty());
}

#[test]
fn test_binding_table_shared_across_threads() {
    let table = Arc::new(BindingTable::default());
    table
        .configure_range(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 64))
        .unwrap();
    let translator = Arc::new(Translator::new(Nat64Prefix::WELL_KNOWN, table.clone()));
    let egress = Arc::new(CaptureEgress::default());
    let server_v6 = Nat64Prefix::WELL_KNOWN.embed(SERVER);

    let handles: Vec<_> = (0..8u16)
        .map(|t| {
            let translator = translator.clone();
            let egress = egress.clone();
            std::thread::spawn(move || {
                for i in 0..8u16 {
                    let host = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, t, i);
                    let packet = ipv6_udp(host, server_v6, b"load");
                    assert!(matches!(
                        translator.process(&packet, &*egress).unwrap(),
                        Disposition::Sent
                    ));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.active_bindings(), 64);
    assert_eq!(table.free_addresses(), 0);
    assert_eq!(egress.take().len(), 64);

    let mut leased: Vec<Ipv4Addr> = table.snapshot().iter().map(|b| b.ipv4).collect();
    leased.sort();
    leased.dedup();
    assert_eq!(leased.len(), 64);
}

#[test]
fn test_oversized_translation_fails_only_that_packet() {
    let (translator, capture) = setup();
    let egress = MtuEgress {
        mtu: 1500,
        inner: CaptureEgress::default(),
    };
    let server_v6 = Nat64Prefix::WELL_KNOWN.embed(SERVER);

    translator
        .process(&ipv6_udp(HOST, server_v6, b"query"), &*capture)
        .unwrap();
    let request = capture.take().remove(0).0;

    // 1500 bytes of IPv4 become 1520 bytes of IPv6.
    let full_size = server_reply(&request, &[0x42; 1472]);
    assert_eq!(full_size.len(), 1500);
    match translator.process(&full_size, &egress).unwrap() {
        Disposition::Failed(Nat64Error::Io(e)) => assert!(e.raw_os_error().is_some()),
        other => panic!("expected a failed send, got {:?}", other),
    }

    let small = server_reply(&request, b"fits");
    assert!(matches!(
        translator.process(&small, &egress).unwrap(),
        Disposition::Sent
    ));
    let sent = egress.inner.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, IpAddr::V6(HOST));
}

#[test]
fn test_short_send_counts_as_failed() {
    struct ShortEgress;

    impl Egress for ShortEgress {
        fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
            Err(Nat64Error::ShortSend {
                destination,
                sent: segments.total_len() / 2,
                expected: segments.total_len(),
            })
        }
    }

    let (translator, _) = setup();
    let packet = ipv6_udp(HOST, Nat64Prefix::WELL_KNOWN.embed(SERVER), b"half");
    assert!(matches!(
        translator.process(&packet, &ShortEgress).unwrap(),
        Disposition::Failed(Nat64Error::ShortSend { .. })
    ));
}
