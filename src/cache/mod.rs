//! Caching layer for offline resilience.
//!
//! This module provides the TTL cache that sits between the reconciliation
//! client and the durable stores:
//! - Keeps an in-memory map of entries with write time and validator
//! - Mirrors every write into the session store so reloads can hydrate
//! - Treats entries older than `max_age` (default 1 hour) as absent
//! - Exposes stale entries separately for validators and offline mode

mod entry;
mod ttl;

pub use entry::{CacheEntry, CacheSource, Fetched};
pub use ttl::{TtlCache, DEFAULT_PREFIX};
