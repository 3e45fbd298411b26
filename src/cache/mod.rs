//! Key/value caching in front of the durable store.
//!
//! This module provides:
//! - A `CacheBackend` contract with per-key TTL and lazy expiry
//! - SQLite, in-memory and no-op backends
//! - Deterministic, namespaced cache keys with TTL tiers
//! - A `CacheManager` doing cache-aside reads and scoped invalidation

mod keys;
mod layer;
mod storage;
mod traits;

pub use keys::{CacheKey, TtlPolicy};
pub use layer::CacheManager;
pub use storage::{MemoryCache, NoopCache, SqliteCache};
pub use traits::{CacheBackend, CacheEntry, CacheResult, CacheSource};
