//! Process-wide single-flight result cache.
//!
//! At most one computation runs per key per namespace generation; every concurrent caller for
//! that key waits on the same ready signal and observes the same result. Invalidation is O(1):
//! bumping a [`Namespace`] generation (or the cache-wide epoch) makes earlier entries
//! unreachable without walking the index, and the LRU bound evicts them eventually.

#![forbid(unsafe_code)]

mod single_flight;

pub use single_flight::{CacheError, Namespace, NamespaceId, SingleFlightCache};
