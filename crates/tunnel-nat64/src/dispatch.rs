//! Packet loop: TUN device in, translator, raw sockets out.

use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;

use crate::device::TunDevice;
use crate::egress::Egress;
use crate::error::Nat64Result;
use crate::packet::ip_version;
use crate::translate::{Disposition, Translator};

/// Per-run packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Packets translated or answered and sent.
    pub sent: u64,
    /// Packets deliberately not forwarded.
    pub dropped: u64,
    /// Packets that failed translation.
    pub failed: u64,
    /// Frames that were neither IPv4 nor IPv6.
    pub unknown: u64,
}

/// Reads packets, branches on the IP version and hands them to the
/// translator and then to egress, one at a time.
pub struct Dispatcher<E> {
    translator: Arc<Translator>,
    egress: E,
    stats: DispatchStats,
}

impl<E: Egress> Dispatcher<E> {
    pub fn new(translator: Arc<Translator>, egress: E) -> Self {
        Self {
            translator,
            egress,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Handle one received frame.
    ///
    /// Only socket failures that outlive this packet are returned; everything
    /// else is counted and the loop carries on.
    pub fn handle(&mut self, frame: &[u8]) -> Nat64Result<()> {
        match ip_version(frame) {
            Some(4) | Some(6) => {}
            _ => {
                self.stats.unknown += 1;
                log::warn!("Unknown internet layer protocol ({} bytes)", frame.len());
                log::debug!("{}", hex_dump(frame));
                return Ok(());
            }
        }

        match self.translator.process(frame, &self.egress)? {
            Disposition::Sent => self.stats.sent += 1,
            Disposition::Dropped(_) => self.stats.dropped += 1,
            Disposition::Failed(_) => self.stats.failed += 1,
        }
        Ok(())
    }

    /// Run until `shutdown` resolves or the device or a socket fails.
    pub async fn run<F>(&mut self, device: &mut TunDevice, shutdown: F) -> Nat64Result<DispatchStats>
    where
        F: Future,
    {
        let mut buf = vec![0u8; device.buffer_size()];
        tokio::pin!(shutdown);

        log::info!("NAT64 translating on {}", device.name());

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down");
                    break Ok(());
                }
                read = device.read(&mut buf) => {
                    let len = match read {
                        Ok(len) => len,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = self.handle(&buf[..len]) {
                        break Err(e);
                    }
                }
            }
        };

        self.log_stats();
        result.map(|()| self.stats)
    }

    fn log_stats(&self) {
        log::info!(
            "NAT64 stats: {} sent, {} dropped, {} failed, {} unknown, {} active binding(s)",
            self.stats.sent,
            self.stats.dropped,
            self.stats.failed,
            self.stats.unknown,
            self.translator.bindings().active_bindings()
        );
    }
}

/// Hex dump, 16 bytes per line with offsets.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3 + data.len() / 16 * 8);
    for (i, line) in data.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x}:", i * 16);
        for byte in line {
            let _ = write!(out, " {:02x}", byte);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Nat64Prefix;
    use crate::bib::BindingTable;
    use crate::error::{Nat64Error, Nat64Result};
    use crate::packet::{proto, Ipv6Repr, ScatterGather};
    use std::cell::RefCell;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[derive(Default)]
    struct Capture {
        sent: RefCell<Vec<(Vec<u8>, IpAddr)>>,
        fail: Option<fn() -> io::Error>,
    }

    impl Egress for Capture {
        fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
            if let Some(error) = self.fail {
                return Err(error().into());
            }
            self.sent.borrow_mut().push((segments.to_vec(), destination));
            Ok(())
        }
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "socket closed")
    }

    fn message_too_long() -> io::Error {
        #[cfg(target_os = "macos")]
        const EMSGSIZE: i32 = 40;
        #[cfg(not(target_os = "macos"))]
        const EMSGSIZE: i32 = 90;
        io::Error::from_raw_os_error(EMSGSIZE)
    }

    fn no_route() -> io::Error {
        io::Error::from(io::ErrorKind::HostUnreachable)
    }

    fn dispatcher(fail: Option<fn() -> io::Error>) -> Dispatcher<Capture> {
        let table = Arc::new(BindingTable::default());
        table
            .configure_range(Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(10, 1, 0, 8))
            .unwrap();
        let translator = Arc::new(Translator::new(Nat64Prefix::WELL_KNOWN, table));
        Dispatcher::new(
            translator,
            Capture {
                fail,
                ..Default::default()
            },
        )
    }

    fn echo_request_v6(hop_limit: u8) -> Vec<u8> {
        let src: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let dst = Nat64Prefix::WELL_KNOWN.embed(Ipv4Addr::new(192, 0, 2, 33));
        let mut icmp = vec![128, 0, 0, 0, 0, 1, 0, 1, 0xAA, 0xBB];
        let pseudo = crate::checksum::ipv6_pseudo_header_sum(src, dst, proto::ICMPV6, icmp.len() as u32);
        let checksum = crate::checksum::Checksum::new()
            .add_sum(pseudo)
            .add_bytes(&icmp)
            .finish();
        icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

        let mut packet = Ipv6Repr {
            traffic_class: 0,
            flow_label: 0,
            payload_len: icmp.len() as u16,
            next_header: proto::ICMPV6,
            hop_limit,
            src,
            dst,
        }
        .emit()
        .to_vec();
        packet.extend_from_slice(&icmp);
        packet
    }

    #[test]
    fn test_version_branch_and_counters() {
        let mut dispatcher = dispatcher(None);

        dispatcher.handle(&echo_request_v6(64)).unwrap();
        dispatcher.handle(&[0x50, 0, 0, 0]).unwrap();
        dispatcher.handle(&[]).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.unknown, 2);

        let sent = dispatcher.egress.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 33)));
        assert_eq!(sent[0].0[0] >> 4, 4);
    }

    #[test]
    fn test_failures_do_not_stop_the_loop() {
        let mut dispatcher = dispatcher(None);

        // Truncated IPv4 header.
        dispatcher.handle(&[0x45, 0, 0, 20, 0, 0]).unwrap();
        // IPv4 to an address nobody leases.
        let mut v4 = vec![0u8; 28];
        v4[0] = 0x45;
        v4[3] = 28;
        v4[8] = 64;
        v4[9] = proto::UDP;
        v4[12..16].copy_from_slice(&[192, 0, 2, 1]);
        v4[16..20].copy_from_slice(&[10, 1, 0, 7]);
        v4[25] = 8;
        dispatcher.handle(&v4).unwrap();

        dispatcher.handle(&echo_request_v6(64)).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.sent, 1);
    }

    #[test]
    fn test_drop_counted() {
        let mut dispatcher = dispatcher(None);
        let mut packet = echo_request_v6(64);
        packet[6] = 0; // hop-by-hop options header
        dispatcher.handle(&packet).unwrap();
        assert_eq!(dispatcher.stats().dropped, 1);
    }

    #[test]
    fn test_egress_error_is_fatal() {
        let mut dispatcher = dispatcher(Some(broken_pipe));
        assert!(matches!(
            dispatcher.handle(&echo_request_v6(64)),
            Err(Nat64Error::Io(_))
        ));
    }

    #[test]
    fn test_per_datagram_send_errors_keep_running() {
        for error in [message_too_long as fn() -> io::Error, no_route] {
            let mut dispatcher = dispatcher(Some(error));
            dispatcher.handle(&echo_request_v6(64)).unwrap();
            dispatcher.handle(&echo_request_v6(64)).unwrap();

            let stats = dispatcher.stats();
            assert_eq!(stats.failed, 2);
            assert_eq!(stats.sent, 0);
        }
    }

    #[test]
    fn test_hex_dump() {
        let data: Vec<u8> = (0u8..18).collect();
        assert_eq!(
            hex_dump(&data),
            "0000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n0010: 10 11"
        );
        assert_eq!(hex_dump(&[]), "");
    }
}
