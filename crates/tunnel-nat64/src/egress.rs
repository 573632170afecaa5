//! Egress: one raw socket per address family.
//!
//! Translated datagrams carry their own IP header, so both sockets are opened
//! with `IPPROTO_RAW`, which on Linux implies header inclusion for IPv4 and
//! IPv6 alike. Each send writes exactly one datagram from the segment list.
//!
//! Errors the kernel raises for a single datagram (`EMSGSIZE`, no route,
//! firewall rejects) are packet level, see [`Nat64Error::is_packet_level`].

use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Nat64Error, Nat64Result};
use crate::packet::ScatterGather;

const IPPROTO_RAW: i32 = 255;

/// Sends one finished datagram.
pub trait Egress {
    fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()>;
}

impl<E: Egress + ?Sized> Egress for std::sync::Arc<E> {
    fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
        (**self).send(segments, destination)
    }
}

/// Raw IPv4 and IPv6 sockets. Requires `CAP_NET_RAW`.
#[derive(Debug)]
pub struct RawEgress {
    v4: Socket,
    v6: Socket,
}

impl RawEgress {
    pub fn open() -> Nat64Result<Self> {
        let v4 = open_raw(Domain::IPV4)?;
        let v6 = open_raw(Domain::IPV6)?;
        log::info!("Opened raw egress sockets");
        Ok(Self { v4, v6 })
    }
}

fn open_raw(domain: Domain) -> Nat64Result<Socket> {
    Socket::new(domain, Type::RAW, Some(Protocol::from(IPPROTO_RAW))).map_err(|e| {
        Nat64Error::config_with_source(format!("Failed to open raw {:?} socket", domain), e)
    })
}

impl Egress for RawEgress {
    fn send(&self, segments: &ScatterGather<'_>, destination: IpAddr) -> Nat64Result<()> {
        let socket = match destination {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        let addr = SockAddr::from(SocketAddr::new(destination, 0));
        let expected = segments.total_len();
        let sent = socket.send_to_vectored(&segments.io_slices(), &addr)?;
        if sent != expected {
            return Err(Nat64Error::ShortSend {
                destination,
                sent,
                expected,
            });
        }
        Ok(())
    }
}
