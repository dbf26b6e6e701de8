//! Keyed tables with time-based eviction.

mod ttl;

pub use ttl::TtlMap;
