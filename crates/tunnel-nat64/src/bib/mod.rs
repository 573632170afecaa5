//! Binding Information Base.
//!
//! Leases IPv4 addresses from a configured pool to IPv6 hosts. Leases expire
//! after a period without lookups, but are only reclaimed when a new lease is
//! needed.

mod clock;
mod pool;
mod table;

pub use pool::AddressPool;
pub use table::{Binding, BindingTable, DEFAULT_EXPIRY};
