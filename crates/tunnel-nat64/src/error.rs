//! Error types for the NAT64 translator.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Which ICMP flavour an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpFamily {
    /// ICMP for IPv4 (RFC 792).
    V4,
    /// ICMPv6 (RFC 4443).
    V6,
}

impl fmt::Display for IcmpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcmpFamily::V4 => f.write_str("ICMP"),
            IcmpFamily::V6 => f.write_str("ICMPv6"),
        }
    }
}

/// NAT64 errors.
///
/// Protocol and resource errors only ever affect the packet being translated;
/// see [`Nat64Error::is_packet_level`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Nat64Error {
    /// The packet is truncated or a header field is inconsistent.
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// ICMP type with no translation rule.
    #[error("Unknown {family} type {icmp_type}")]
    UnknownIcmpType { family: IcmpFamily, icmp_type: u8 },

    /// ICMP code with no translation rule for an otherwise known type.
    #[error("Unknown {family} code {code} for type {icmp_type}")]
    UnknownIcmpCode {
        family: IcmpFamily,
        icmp_type: u8,
        code: u8,
    },

    /// A translation rule exists in RFC 6145 but is deliberately unsupported.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// An ICMP error message embeds another ICMP error message.
    #[error("ICMP error embeds another ICMP error ({family} type {icmp_type})")]
    NestedIcmpError { family: IcmpFamily, icmp_type: u8 },

    /// Only /96 NAT64 prefixes are supported.
    #[error("Unsupported NAT64 prefix length /{0} (only /96 is supported)")]
    UnsupportedPrefixLength(u8),

    /// No free IPv4 address is left to lease to a new IPv6 host.
    #[error("IPv4 address pool exhausted while binding {0}")]
    PoolExhausted(Ipv6Addr),

    /// No IPv6 host holds a lease on this IPv4 address.
    #[error("No binding for {0}")]
    NoBinding(Ipv4Addr),

    /// A pool range overlaps a previously configured range.
    #[error("Address range {first}-{last} overlaps a configured pool range")]
    RangeCollision { first: Ipv4Addr, last: Ipv4Addr },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// TUN device creation or setup failed.
    #[error("TUN device error: {0}")]
    TunDevice(#[source] ErrorContext),

    /// The kernel accepted only part of a datagram.
    #[error("Short send to {destination}: {sent} of {expected} bytes")]
    ShortSend {
        destination: IpAddr,
        sent: usize,
        expected: usize,
    },

    /// Device or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Nat64Error {
    /// Create a malformed-packet error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }

    /// Create a TUN device error with context only.
    pub fn tun_device(message: impl Into<String>) -> Self {
        Self::TunDevice(ErrorContext::new(message))
    }

    /// Create a TUN device error with preserved source.
    pub fn tun_device_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::TunDevice(ErrorContext::with_source(message, source))
    }

    /// Returns true if this error only concerns the packet being translated.
    ///
    /// **Packet level (drop the packet, keep going):**
    /// - `Malformed`, `UnknownIcmpType`, `UnknownIcmpCode`, `NotImplemented`,
    ///   `NestedIcmpError`, `UnsupportedPrefixLength`
    /// - `PoolExhausted`, `NoBinding`
    /// - `ShortSend`, and `Io` errors the kernel raises for one datagram
    ///   (too big, no route, filtered, out of buffers)
    ///
    /// **Fatal:**
    /// - `RangeCollision`, `Config` - startup only
    /// - `TunDevice`, any other `Io` - the device or a socket is broken
    pub fn is_packet_level(&self) -> bool {
        match self {
            Nat64Error::Malformed(_)
            | Nat64Error::UnknownIcmpType { .. }
            | Nat64Error::UnknownIcmpCode { .. }
            | Nat64Error::NotImplemented(_)
            | Nat64Error::NestedIcmpError { .. }
            | Nat64Error::UnsupportedPrefixLength(_)
            | Nat64Error::PoolExhausted(_)
            | Nat64Error::NoBinding(_)
            | Nat64Error::ShortSend { .. } => true,
            Nat64Error::Io(err) => is_datagram_send_error(err),
            Nat64Error::RangeCollision { .. }
            | Nat64Error::Config(_)
            | Nat64Error::TunDevice(_) => false,
        }
    }
}

#[cfg(target_os = "macos")]
mod errno {
    pub const EMSGSIZE: i32 = 40;
    pub const ENETUNREACH: i32 = 51;
    pub const ENOBUFS: i32 = 55;
    pub const EHOSTUNREACH: i32 = 65;
}

#[cfg(not(target_os = "macos"))]
mod errno {
    pub const EMSGSIZE: i32 = 90;
    pub const ENETUNREACH: i32 = 101;
    pub const ENOBUFS: i32 = 105;
    pub const EHOSTUNREACH: i32 = 113;
}

/// Send errors that reject one datagram while the socket stays usable.
pub fn is_datagram_send_error(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(errno::EMSGSIZE)
        | Some(errno::ENETUNREACH)
        | Some(errno::ENOBUFS)
        | Some(errno::EHOSTUNREACH) => true,
        _ => matches!(
            err.kind(),
            io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::HostUnreachable
                | io::ErrorKind::PermissionDenied
        ),
    }
}

/// Result type alias for NAT64 operations.
pub type Nat64Result<T> = Result<T, Nat64Error>;
