//! Stateful NAT64 translator for tunnel-rs.
//!
//! IPv6-only hosts reach IPv4 servers through addresses under a /96 NAT64
//! prefix (RFC 6052). Each IPv6 host leases one IPv4 address from a pool for
//! as long as it keeps sending, and packets are rewritten between the two
//! families per RFC 6145.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        tunnel-nat64                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TUN device ──► Dispatcher ──► Translator ──► raw sockets    │
//! │                                  │    │                      │
//! │                     BindingTable ┘    └ checksum / address   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod bib;
pub mod checksum;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod egress;
pub mod error;
pub mod packet;
pub mod translate;

// Re-exports for convenience
pub use address::Nat64Prefix;
pub use bib::BindingTable;
pub use config::Nat64Config;
pub use dispatch::{DispatchStats, Dispatcher};
pub use egress::{Egress, RawEgress};
pub use error::{Nat64Error, Nat64Result};
pub use translate::{Datagram, Disposition, DropReason, Level, Translation, Translator};
