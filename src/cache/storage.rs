//! Cache backend implementations: SQLite, in-memory and no-op.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::traits::{CacheBackend, CacheEntry};

/// Backend that doesn't cache anything.
/// Used when caching is disabled - every read is a miss.
pub struct NoopCache;

impl CacheBackend for NoopCache {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8], _ttl_seconds: u64) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn exists(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }
}

/// Process-local cache backend.
///
/// Can be switched into an "unavailable" mode where every call fails, which
/// is how a remote cache behaves when its server is down.
#[derive(Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
  unavailable: AtomicBool,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  fn check_available(&self) -> Result<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      return Err(eyre!("Cache backend unavailable"));
    }
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Outage simulation and inspection.
#[allow(dead_code)]
impl MemoryCache {
  /// Make every subsequent call fail (or succeed again).
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Insert a fully specified entry, e.g. one with a past `inserted_at`.
  pub fn insert_entry(&self, entry: CacheEntry) -> Result<()> {
    self.check_available()?;
    self.lock()?.insert(entry.key.clone(), entry);
    Ok(())
  }

  /// Number of stored entries, expired ones included.
  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }
}

impl CacheBackend for MemoryCache {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.check_available()?;
    let mut entries = self.lock()?;
    match entries.get(key) {
      Some(entry) if entry.is_fresh_at(Utc::now()) => Ok(Some(entry.clone())),
      Some(_) => {
        entries.remove(key);
        Ok(None)
      }
      None => Ok(None),
    }
  }

  fn set(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
    self.check_available()?;
    self
      .lock()?
      .insert(key.to_string(), CacheEntry::new(key, value, ttl_seconds, Utc::now()));
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.check_available()?;
    self.lock()?.remove(key);
    Ok(())
  }

  fn exists(&self, key: &str) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }
}

/// SQLite-based cache backend.
pub struct SqliteCache {
  conn: Mutex<Connection>,
}

impl SqliteCache {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory cache database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    inserted_at TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
"#;

impl CacheBackend for SqliteCache {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT value, inserted_at, ttl_seconds FROM cache_entries WHERE cache_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((value, inserted_at, ttl_seconds)) = row else {
      return Ok(None);
    };

    let entry = CacheEntry {
      key: key.to_string(),
      value,
      inserted_at: parse_datetime(&inserted_at)?,
      ttl_seconds: u64::try_from(ttl_seconds).unwrap_or(0),
    };

    if entry.is_fresh_at(Utc::now()) {
      return Ok(Some(entry));
    }

    // Lazy expiry
    conn
      .execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to expire cache entry: {}", e))?;
    Ok(None)
  }

  fn set(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<()> {
    let ttl = i64::try_from(ttl_seconds).map_err(|e| eyre!("TTL out of range: {}", e))?;
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_key, value, inserted_at, ttl_seconds)
         VALUES (?, ?, ?, ?)",
        params![key, value, format_datetime(Utc::now()), ttl],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM cache_entries WHERE cache_key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(())
  }

  fn exists(&self, key: &str) -> Result<bool> {
    Ok(self.get(key)?.is_some())
  }
}

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.format(DATETIME_FORMAT).to_string()
}

/// Parse a datetime string written by `format_datetime`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_sqlite_roundtrip_and_delete() {
    let cache = SqliteCache::open_in_memory().unwrap();
    cache.set("k", b"[1,2]", 60).unwrap();

    let entry = cache.get("k").unwrap().unwrap();
    assert_eq!(entry.value, b"[1,2]");
    assert_eq!(entry.ttl_seconds, 60);
    assert!(cache.exists("k").unwrap());

    cache.delete("k").unwrap();
    assert!(cache.get("k").unwrap().is_none());
    // Deleting again is fine
    cache.delete("k").unwrap();
  }

  #[test]
  fn test_sqlite_zero_ttl_expires() {
    let cache = SqliteCache::open_in_memory().unwrap();
    cache.set("k", b"1", 0).unwrap();
    assert!(cache.get("k").unwrap().is_none());
    assert!(!cache.exists("k").unwrap());
  }

  #[test]
  fn test_sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let cache = SqliteCache::open(&path).unwrap();
      cache.set("k", b"\"v\"", 3600).unwrap();
    }
    let cache = SqliteCache::open(&path).unwrap();
    assert_eq!(cache.get("k").unwrap().unwrap().value, b"\"v\"");
  }

  #[test]
  fn test_memory_lazy_expiry() {
    let cache = MemoryCache::new();
    let old = Utc::now() - Duration::seconds(120);
    cache
      .insert_entry(CacheEntry::new("stale", b"1", 60, old))
      .unwrap();
    cache.set("fresh", b"2", 60).unwrap();
    assert_eq!(cache.len(), 2);

    assert!(cache.get("stale").unwrap().is_none());
    assert!(cache.get("fresh").unwrap().is_some());
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn test_memory_unavailable_fails_calls() {
    let cache = MemoryCache::new();
    cache.set("k", b"1", 60).unwrap();
    cache.set_unavailable(true);
    assert!(cache.get("k").is_err());
    assert!(cache.set("k", b"2", 60).is_err());
    cache.set_unavailable(false);
    assert_eq!(cache.get("k").unwrap().unwrap().value, b"1");
  }

  #[test]
  fn test_noop_always_misses() {
    let cache = NoopCache;
    cache.set("k", b"1", 60).unwrap();
    assert!(cache.get("k").unwrap().is_none());
    assert!(!cache.exists("k").unwrap());
  }

  #[test]
  fn test_datetime_format_roundtrip() {
    let now = Utc::now();
    let parsed = parse_datetime(&format_datetime(now)).unwrap();
    assert!((now - parsed).num_milliseconds().abs() <= 1);
  }
}
