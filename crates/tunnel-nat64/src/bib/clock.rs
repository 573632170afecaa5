//! Mockable clock for binding expiry.
//!
//! Outside tests this is `std::time::Instant`. Unit tests get
//! `mock_instant::thread_local::Instant`, advanced through `MockClock`, so
//! expiry can be exercised without sleeping.
//!
//! ```ignore
//! MockClock::set_time(Duration::ZERO);
//! let v4 = table.lookup_v4_for(host)?;
//! MockClock::advance(Duration::from_secs(1801));
//! assert_eq!(table.reclaim(), 1);
//! ```

#[cfg(test)]
pub use mock_instant::thread_local::Instant;

#[cfg(not(test))]
pub use std::time::Instant;

#[cfg(test)]
pub use mock_instant::thread_local::MockClock;
