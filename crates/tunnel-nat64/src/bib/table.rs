//! IPv6 host to leased IPv4 address bindings.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ipnet::Ipv4Net;

use super::clock::Instant;
use super::pool::AddressPool;
use crate::error::{Nat64Error, Nat64Result};

/// Default binding expiry (30 minutes).
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(1800);

/// One lease of an IPv4 address to an IPv6 host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    /// Time of the last successful lookup in either direction.
    pub last_used: Instant,
}

/// Everything guarded by the table lock.
///
/// `free` and the two maps are only ever changed together.
#[derive(Debug, Default)]
struct BindingState {
    /// Addresses not leased to anyone.
    free: AddressPool,
    /// Every address ever configured, for collision checks.
    configured: AddressPool,
    by_v6: HashMap<Ipv6Addr, Ipv4Addr>,
    by_v4: HashMap<Ipv4Addr, Binding>,
}

impl BindingState {
    fn reclaim(&mut self, expiry: Duration) -> usize {
        let now = Instant::now();

        let expired: Vec<Binding> = self
            .by_v4
            .values()
            .filter(|b| now.duration_since(b.last_used) > expiry)
            .copied()
            .collect();

        for binding in &expired {
            self.by_v4.remove(&binding.ipv4);
            self.by_v6.remove(&binding.ipv6);
            self.free.insert(binding.ipv4);
            log::debug!(
                "NAT64 binding expired: {} -> {}",
                binding.ipv6,
                binding.ipv4
            );
        }

        expired.len()
    }
}

/// Binding Information Base: which IPv4 address each IPv6 host is using.
///
/// All state sits behind one mutex, so allocation, reclamation and lookups
/// from any number of threads are serialized and an allocation is never
/// observed half done.
#[derive(Debug)]
pub struct BindingTable {
    state: Mutex<BindingState>,
    expiry: Duration,
}

impl BindingTable {
    /// Create an empty table; configure at least one pool range before use.
    pub fn new(expiry: Duration) -> Self {
        Self {
            state: Mutex::new(BindingState::default()),
            expiry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BindingState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expiry window measured from the last successful lookup.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Add the usable host addresses of `net` to the free pool.
    ///
    /// Network and broadcast addresses are left out for prefixes shorter
    /// than /31.
    pub fn configure_pool(&self, net: Ipv4Net) -> Nat64Result<()> {
        let (first, last) = if net.prefix_len() < 31 {
            (
                Ipv4Addr::from(u32::from(net.network()) + 1),
                Ipv4Addr::from(u32::from(net.broadcast()) - 1),
            )
        } else {
            (net.network(), net.broadcast())
        };
        self.configure_range(first, last)
    }

    /// Add the inclusive range `first..=last` to the free pool.
    pub fn configure_range(&self, first: Ipv4Addr, last: Ipv4Addr) -> Nat64Result<()> {
        if first > last {
            return Err(Nat64Error::config(format!(
                "Pool range {}-{} is empty",
                first, last
            )));
        }

        let mut state = self.lock();
        if state.configured.overlaps(first, last) {
            return Err(Nat64Error::RangeCollision { first, last });
        }
        state.configured.insert_range(first, last);
        state.free.insert_range(first, last);

        log::info!("NAT64 pool range added: {}-{}", first, last);
        Ok(())
    }

    /// Take `addr` out of the free pool so it is never leased.
    ///
    /// Returns false if the address was not free.
    pub fn reserve(&self, addr: Ipv4Addr) -> bool {
        let removed = self.lock().free.remove(addr);
        if removed {
            log::debug!("NAT64 pool address reserved: {}", addr);
        }
        removed
    }

    /// IPv4 address leased to `v6`, allocating one on first use.
    ///
    /// A miss first reclaims expired bindings, then leases the lowest free
    /// address.
    pub fn lookup_v4_for(&self, v6: Ipv6Addr) -> Nat64Result<Ipv4Addr> {
        let mut state = self.lock();
        let now = Instant::now();

        if let Some(&v4) = state.by_v6.get(&v6) {
            if let Some(binding) = state.by_v4.get_mut(&v4) {
                binding.last_used = now;
            }
            return Ok(v4);
        }

        let reclaimed = state.reclaim(self.expiry);
        if reclaimed > 0 {
            log::debug!("NAT64 reclaimed {} expired binding(s)", reclaimed);
        }

        let v4 = state
            .free
            .take_lowest()
            .ok_or(Nat64Error::PoolExhausted(v6))?;

        state.by_v6.insert(v6, v4);
        state.by_v4.insert(
            v4,
            Binding {
                ipv4: v4,
                ipv6: v6,
                last_used: now,
            },
        );

        log::debug!("NAT64 binding created: {} -> {}", v6, v4);
        Ok(v4)
    }

    /// IPv6 host holding the lease on `v4`. Never allocates.
    pub fn lookup_v6_for(&self, v4: Ipv4Addr) -> Nat64Result<Ipv6Addr> {
        let mut state = self.lock();
        let binding = state
            .by_v4
            .get_mut(&v4)
            .ok_or(Nat64Error::NoBinding(v4))?;
        binding.last_used = Instant::now();
        Ok(binding.ipv6)
    }

    /// Remove every expired binding and return its address to the pool.
    ///
    /// Returns the number of bindings removed.
    pub fn reclaim(&self) -> usize {
        self.lock().reclaim(self.expiry)
    }

    /// Number of live bindings (expired ones count until reclaimed).
    pub fn active_bindings(&self) -> usize {
        self.lock().by_v4.len()
    }

    /// Number of addresses available for new leases.
    pub fn free_addresses(&self) -> u64 {
        self.lock().free.len()
    }

    /// Copy of all bindings, ordered by IPv4 address.
    pub fn snapshot(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self.lock().by_v4.values().copied().collect();
        bindings.sort_by_key(|b| b.ipv4);
        bindings
    }
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}

#[cfg(test)]
mod tests {
    use super::super::clock::MockClock;
    use super::*;
    use std::sync::Arc;

    fn host(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn small_table() -> BindingTable {
        MockClock::set_time(Duration::ZERO);
        let table = BindingTable::new(DEFAULT_EXPIRY);
        table
            .configure_range(ip("10.0.0.1"), ip("10.0.0.3"))
            .unwrap();
        table
    }

    #[test]
    fn test_allocation_is_lowest_first() {
        let table = small_table();

        assert_eq!(table.lookup_v4_for(host(0xA)).unwrap(), ip("10.0.0.1"));
        assert_eq!(table.lookup_v4_for(host(0xB)).unwrap(), ip("10.0.0.2"));
        assert_eq!(table.lookup_v4_for(host(0xC)).unwrap(), ip("10.0.0.3"));

        match table.lookup_v4_for(host(0xD)) {
            Err(Nat64Error::PoolExhausted(v6)) => assert_eq!(v6, host(0xD)),
            other => panic!("expected PoolExhausted, got {:?}", other),
        }

        // Existing bindings are unaffected by the failed allocation.
        assert_eq!(table.active_bindings(), 3);
        assert_eq!(table.lookup_v4_for(host(0xB)).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_lookup_is_symmetric() {
        let table = small_table();

        let v4 = table.lookup_v4_for(host(1)).unwrap();
        assert_eq!(table.lookup_v6_for(v4).unwrap(), host(1));
        assert_eq!(table.lookup_v4_for(host(1)).unwrap(), v4);
        assert_eq!(table.active_bindings(), 1);
        assert_eq!(table.free_addresses(), 2);
    }

    #[test]
    fn test_v4_lookup_never_allocates() {
        let table = small_table();

        assert!(matches!(
            table.lookup_v6_for(ip("10.0.0.1")),
            Err(Nat64Error::NoBinding(_))
        ));
        assert_eq!(table.active_bindings(), 0);
        assert_eq!(table.free_addresses(), 3);
    }

    #[test]
    fn test_reclamation_is_lazy() {
        let table = small_table();
        table.reserve(ip("10.0.0.3"));

        let a = host(0xA);
        assert_eq!(table.lookup_v4_for(a).unwrap(), ip("10.0.0.1"));

        MockClock::advance(Duration::from_secs(1801));

        // Nothing happens on its own.
        assert_eq!(table.active_bindings(), 1);
        assert_eq!(table.free_addresses(), 1);

        // The next allocation reclaims A's lease and hands out the lowest address.
        let c = host(0xC);
        assert_eq!(table.lookup_v4_for(c).unwrap(), ip("10.0.0.1"));
        assert_eq!(table.lookup_v6_for(ip("10.0.0.1")).unwrap(), c);
        assert_eq!(table.active_bindings(), 1);

        // A comes back and gets a fresh, different lease.
        assert_eq!(table.lookup_v4_for(a).unwrap(), ip("10.0.0.2"));
        assert_eq!(table.active_bindings(), 2);
    }

    #[test]
    fn test_lookup_refreshes_last_used() {
        let table = small_table();

        let v4 = table.lookup_v4_for(host(1)).unwrap();

        MockClock::advance(Duration::from_secs(1000));
        table.lookup_v6_for(v4).unwrap();

        MockClock::advance(Duration::from_secs(1000));
        assert_eq!(table.reclaim(), 0);

        MockClock::advance(Duration::from_secs(500));
        table.lookup_v4_for(host(1)).unwrap();

        MockClock::advance(Duration::from_secs(1801));
        assert_eq!(table.reclaim(), 1);
        assert_eq!(table.active_bindings(), 0);
        assert_eq!(table.free_addresses(), 3);
    }

    #[test]
    fn test_expired_binding_revived_on_hit() {
        let table = small_table();

        let v4 = table.lookup_v4_for(host(1)).unwrap();
        MockClock::advance(Duration::from_secs(4000));

        // Not reclaimed yet, so a hit keeps it alive.
        assert_eq!(table.lookup_v4_for(host(1)).unwrap(), v4);
        assert_eq!(table.reclaim(), 0);
    }

    #[test]
    fn test_exhausted_pool_recovers_after_expiry() {
        let table = small_table();
        for n in 1..=3 {
            table.lookup_v4_for(host(n)).unwrap();
        }
        assert!(table.lookup_v4_for(host(4)).is_err());

        MockClock::advance(Duration::from_secs(1801));
        assert_eq!(table.lookup_v4_for(host(4)).unwrap(), ip("10.0.0.1"));
        assert_eq!(table.active_bindings(), 1);
        assert_eq!(table.free_addresses(), 2);
    }

    #[test]
    fn test_range_collision() {
        let table = BindingTable::default();
        table.configure_pool("192.168.10.0/24".parse().unwrap()).unwrap();

        let err = table
            .configure_range(ip("192.168.10.200"), ip("192.168.11.5"))
            .unwrap_err();
        assert!(matches!(err, Nat64Error::RangeCollision { .. }));

        // Collision is against configured ranges, not only free addresses.
        table.reserve(ip("192.168.10.1"));
        assert!(table
            .configure_range(ip("192.168.10.1"), ip("192.168.10.1"))
            .is_err());

        table.configure_pool("192.168.11.0/24".parse().unwrap()).unwrap();
        assert_eq!(table.free_addresses(), 253 + 254);
    }

    #[test]
    fn test_configure_pool_host_range() {
        MockClock::set_time(Duration::ZERO);
        let table = BindingTable::default();
        table.configure_pool("100.64.0.0/30".parse().unwrap()).unwrap();
        assert_eq!(table.free_addresses(), 2);
        assert_eq!(table.lookup_v4_for(host(1)).unwrap(), ip("100.64.0.1"));

        let table = BindingTable::default();
        table.configure_pool("100.64.0.8/31".parse().unwrap()).unwrap();
        table.configure_pool("100.64.0.20/32".parse().unwrap()).unwrap();
        assert_eq!(table.free_addresses(), 3);
        assert_eq!(table.lookup_v4_for(host(1)).unwrap(), ip("100.64.0.8"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = small_table();
        table.lookup_v4_for(host(3)).unwrap();
        table.lookup_v4_for(host(1)).unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].ipv4, ip("10.0.0.1"));
        assert_eq!(snapshot[0].ipv6, host(3));
        assert_eq!(snapshot[1].ipv4, ip("10.0.0.2"));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        MockClock::set_time(Duration::ZERO);
        let table = Arc::new(BindingTable::default());
        table.configure_pool("10.1.0.0/24".parse().unwrap()).unwrap();

        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..50u16)
                        .map(|n| table.lookup_v4_for(host(t * 100 + n)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut leased: Vec<Ipv4Addr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        leased.sort();
        leased.dedup();

        assert_eq!(leased.len(), 200);
        assert_eq!(table.active_bindings(), 200);
        assert_eq!(table.free_addresses(), 54);
    }
}
