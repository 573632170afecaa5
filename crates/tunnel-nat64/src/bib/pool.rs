//! Interval set over the IPv4 address space.
//!
//! Addresses are stored as disjoint, non-adjacent inclusive ranges keyed by
//! their first address, so every operation is logarithmic in the number of
//! ranges rather than linear in the number of addresses.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Set of IPv4 addresses stored as sorted inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPool {
    /// first -> last (inclusive)
    ranges: BTreeMap<u32, u32>,
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `first..=last`, merging with overlapping or adjacent ranges.
    pub fn insert_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) {
        let (mut start, mut end) = (u32::from(first), u32::from(last));
        if start > end {
            return;
        }

        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if u64::from(e) + 1 >= u64::from(start) {
                self.ranges.remove(&s);
                start = s;
                end = end.max(e);
            }
        }

        while let Some((&s, &e)) = self.ranges.range(start..).next() {
            if u64::from(s) > u64::from(end) + 1 {
                break;
            }
            self.ranges.remove(&s);
            end = end.max(e);
        }

        self.ranges.insert(start, end);
    }

    /// Add a single address.
    pub fn insert(&mut self, addr: Ipv4Addr) {
        self.insert_range(addr, addr);
    }

    /// Remove `first..=last`, splitting ranges as needed.
    ///
    /// Returns the number of addresses that were actually removed.
    pub fn remove_range(&mut self, first: Ipv4Addr, last: Ipv4Addr) -> u64 {
        let (first, last) = (u32::from(first), u32::from(last));
        if first > last {
            return 0;
        }

        let mut overlapping: Vec<(u32, u32)> = Vec::new();
        if let Some((&s, &e)) = self.ranges.range(..first).next_back() {
            if e >= first {
                overlapping.push((s, e));
            }
        }
        overlapping.extend(self.ranges.range(first..=last).map(|(&s, &e)| (s, e)));

        let mut removed = 0u64;
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            removed += u64::from(e.min(last)) - u64::from(s.max(first)) + 1;
            if s < first {
                self.ranges.insert(s, first - 1);
            }
            if e > last {
                self.ranges.insert(last + 1, e);
            }
        }
        removed
    }

    /// Remove a single address. Returns whether it was present.
    pub fn remove(&mut self, addr: Ipv4Addr) -> bool {
        self.remove_range(addr, addr) == 1
    }

    /// Remove and return the numerically lowest address.
    pub fn take_lowest(&mut self) -> Option<Ipv4Addr> {
        let (s, e) = self.ranges.pop_first()?;
        if s < e {
            self.ranges.insert(s + 1, e);
        }
        Some(Ipv4Addr::from(s))
    }

    /// Whether any address of `first..=last` is in the set.
    pub fn overlaps(&self, first: Ipv4Addr, last: Ipv4Addr) -> bool {
        let (first, last) = (u32::from(first), u32::from(last));
        if first > last {
            return false;
        }
        // The range with the greatest start not past `last` is the only candidate.
        self.ranges
            .range(..=last)
            .next_back()
            .is_some_and(|(_, &e)| e >= first)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.overlaps(addr, addr)
    }

    /// Number of addresses in the set.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(&s, &e)| u64::from(e) - u64::from(s) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate over the stored ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = (Ipv4Addr, Ipv4Addr)> + '_ {
        self.ranges
            .iter()
            .map(|(&s, &e)| (Ipv4Addr::from(s), Ipv4Addr::from(e)))
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (first, last)) in self.ranges().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if first == last {
                write!(f, "{}", first)?;
            } else {
                write!(f, "{}-{}", first, last)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_merges_adjacent() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("10.0.0.1"), ip("10.0.0.3"));
        pool.insert_range(ip("10.0.0.4"), ip("10.0.0.6"));
        pool.insert_range(ip("10.0.0.10"), ip("10.0.0.12"));
        assert_eq!(pool.ranges().count(), 2);
        assert_eq!(pool.len(), 9);

        // Bridge the gap
        pool.insert_range(ip("10.0.0.7"), ip("10.0.0.9"));
        assert_eq!(pool.to_string(), "10.0.0.1-10.0.0.12");
    }

    #[test]
    fn test_insert_overlapping() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("10.0.0.5"), ip("10.0.0.10"));
        pool.insert_range(ip("10.0.0.1"), ip("10.0.0.7"));
        pool.insert_range(ip("10.0.0.9"), ip("10.0.0.20"));
        assert_eq!(pool.to_string(), "10.0.0.1-10.0.0.20");
        assert_eq!(pool.len(), 20);
    }

    #[test]
    fn test_address_space_edges() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("0.0.0.0"), ip("0.0.0.1"));
        pool.insert_range(ip("255.255.255.254"), ip("255.255.255.255"));
        assert_eq!(pool.len(), 4);
        assert!(pool.contains(ip("255.255.255.255")));

        pool.insert_range(ip("0.0.0.0"), ip("255.255.255.255"));
        assert_eq!(pool.len(), 1 << 32);
        assert_eq!(pool.remove_range(ip("0.0.0.0"), ip("255.255.255.255")), 1 << 32);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_remove_range_splits() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("10.0.0.1"), ip("10.0.0.10"));

        assert_eq!(pool.remove_range(ip("10.0.0.4"), ip("10.0.0.6")), 3);
        assert_eq!(pool.to_string(), "10.0.0.1-10.0.0.3, 10.0.0.7-10.0.0.10");

        // Spanning a hole only counts present addresses.
        assert_eq!(pool.remove_range(ip("10.0.0.3"), ip("10.0.0.7")), 2);
        assert_eq!(pool.to_string(), "10.0.0.1-10.0.0.2, 10.0.0.8-10.0.0.10");

        assert!(pool.remove(ip("10.0.0.1")));
        assert!(!pool.remove(ip("10.0.0.1")));
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_take_lowest() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("10.0.0.5"), ip("10.0.0.6"));
        pool.insert(ip("10.0.0.1"));

        assert_eq!(pool.take_lowest(), Some(ip("10.0.0.1")));
        assert_eq!(pool.take_lowest(), Some(ip("10.0.0.5")));
        pool.insert(ip("10.0.0.2"));
        assert_eq!(pool.take_lowest(), Some(ip("10.0.0.2")));
        assert_eq!(pool.take_lowest(), Some(ip("10.0.0.6")));
        assert_eq!(pool.take_lowest(), None);
    }

    #[test]
    fn test_overlaps() {
        let mut pool = AddressPool::new();
        pool.insert_range(ip("10.0.0.10"), ip("10.0.0.20"));
        pool.insert_range(ip("10.0.0.40"), ip("10.0.0.50"));

        assert!(pool.overlaps(ip("10.0.0.1"), ip("10.0.0.10")));
        assert!(pool.overlaps(ip("10.0.0.15"), ip("10.0.0.16")));
        assert!(pool.overlaps(ip("10.0.0.20"), ip("10.0.0.45")));
        assert!(!pool.overlaps(ip("10.0.0.21"), ip("10.0.0.39")));
        assert!(!pool.overlaps(ip("10.0.0.51"), ip("10.0.1.0")));
        assert!(!pool.overlaps(ip("10.0.0.1"), ip("10.0.0.9")));
    }
}
