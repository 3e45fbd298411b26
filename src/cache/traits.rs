//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;

/// A stored cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  /// Serialized JSON payload
  pub value: Vec<u8>,
  pub inserted_at: DateTime<Utc>,
  pub ttl_seconds: u64,
}

impl CacheEntry {
  pub fn new(key: &str, value: &[u8], ttl_seconds: u64, inserted_at: DateTime<Utc>) -> Self {
    Self {
      key: key.to_string(),
      value: value.to_vec(),
      inserted_at,
      ttl_seconds,
    }
  }

  /// An entry is a hit only while `now - inserted_at < ttl`.
  ///
  /// TTLs beyond what a `Duration` can hold never expire.
  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    match i64::try_from(self.ttl_seconds).ok().and_then(Duration::try_seconds) {
      Some(ttl) => now - self.inserted_at < ttl,
      None => true,
    }
  }
}

/// Key/value store with per-key TTL fronting the durable store.
///
/// Backends expire lazily: `get` and `exists` treat expired entries as
/// absent, no background sweep is required. Errors mean the backend itself
/// is unreachable; callers decide whether that is fatal.
pub trait CacheBackend: Send + Sync {
  /// Get a fresh entry, or `None` on miss or expiry.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Store a value for `ttl_seconds`.
  fn set(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()>;

  /// Remove a key. Removing a missing key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// Whether a fresh entry exists.
  fn exists(&self, key: &str) -> Result<bool>;
}

/// Result from a cache-aside read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from a durable store read.
  pub fn from_store(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Store,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh read from the durable store
  Store,
  /// Unexpired cache entry
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_freshness_boundary() {
    let inserted = Utc::now();
    let entry = CacheEntry::new("k", b"1", 60, inserted);
    assert!(entry.is_fresh_at(inserted));
    assert!(entry.is_fresh_at(inserted + Duration::seconds(59)));
    assert!(!entry.is_fresh_at(inserted + Duration::seconds(60)));
  }

  #[test]
  fn test_zero_ttl_is_never_fresh() {
    let inserted = Utc::now();
    let entry = CacheEntry::new("k", b"1", 0, inserted);
    assert!(!entry.is_fresh_at(inserted));
  }

  #[test]
  fn test_huge_ttl_never_expires() {
    let inserted = Utc::now();
    for ttl in [10_000_000_000_000_000, i64::MAX as u64, u64::MAX] {
      let entry = CacheEntry::new("k", b"1", ttl, inserted);
      assert!(entry.is_fresh_at(inserted));
      assert!(entry.is_fresh_at(inserted + Duration::days(365 * 100)));
    }
  }
}
