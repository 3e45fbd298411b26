//! Cache consistency manager: cache-aside reads and scoped invalidation.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::keys::{CacheKey, TtlPolicy};
use super::traits::{CacheBackend, CacheResult};
use crate::widget::{CacheKeyRef, WidgetId};

/// Owns the cache backend and the invalidation policy.
///
/// The cache is never authoritative. Backend failures are logged and the
/// caller falls through to the durable store, so nothing here can fail a read.
pub struct CacheManager {
  storage: Arc<dyn CacheBackend>,
  namespace: String,
  ttl: TtlPolicy,
  /// Invalidation count per rendered key, shared by clones
  generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl CacheManager {
  /// Create a new cache manager over the given backend.
  pub fn new(storage: Arc<dyn CacheBackend>, namespace: impl Into<String>) -> Self {
    Self {
      storage,
      namespace: namespace.into(),
      ttl: TtlPolicy::default(),
      generations: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn with_ttl_policy(mut self, ttl: TtlPolicy) -> Self {
    self.ttl = ttl;
    self
  }

  /// The rendered storage key.
  pub fn key(&self, key: &CacheKey) -> String {
    key.render(&self.namespace)
  }

  /// Cache-aside read.
  ///
  /// 1. Fresh cache entry - return it
  /// 2. Otherwise fetch from the durable store
  /// 3. Populate the cache with the fetched value, unless the key was
  ///    invalidated while the fetch ran
  ///
  /// Only the fetcher's error can surface; cache trouble degrades to a fetch.
  pub async fn fetch<T, E, F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheResult<T>, E>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let rendered = self.key(key);
    let generation = self.generation(&rendered);

    match self.storage.get(&rendered) {
      Ok(Some(entry)) => match serde_json::from_slice::<T>(&entry.value) {
        Ok(data) => {
          debug!(key = %rendered, "cache hit: {}", key.description());
          return Ok(CacheResult::from_cache(data, entry.inserted_at));
        }
        Err(e) => {
          warn!(key = %rendered, error = %e, "Discarding undecodable cache entry");
          self.delete_logged(&rendered);
        }
      },
      Ok(None) => debug!(key = %rendered, "cache miss: {}", key.description()),
      Err(e) => warn!(key = %rendered, error = %e, "Cache read failed, reading from store"),
    }

    let data = fetcher().await?;
    self.store(key, &data, Some(generation));
    Ok(CacheResult::from_store(data))
  }

  /// Write a value with the TTL tier of its key. Failures are logged only.
  ///
  /// Returns a reference to the entry on success.
  pub fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Option<CacheKeyRef> {
    self.store(key, value, None)
  }

  /// Write unless `expected` is given and the key has been invalidated since.
  fn store<T: Serialize>(
    &self,
    key: &CacheKey,
    value: &T,
    expected: Option<u64>,
  ) -> Option<CacheKeyRef> {
    let rendered = self.key(key);
    let bytes = match serde_json::to_vec(value) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(key = %rendered, error = %e, "Failed to serialize cache value");
        return None;
      }
    };

    // Held through the write so an invalidation can't slip in between
    let generations = self.lock_generations();
    if let Some(expected) = expected {
      if generations.get(&rendered).copied().unwrap_or(0) != expected {
        debug!(key = %rendered, "invalidated during fetch, not caching");
        return None;
      }
    }

    let ttl = self.ttl.ttl_for(key).as_secs();
    match self.storage.set(&rendered, &bytes, ttl) {
      Ok(()) => Some(CacheKeyRef {
        key: rendered,
        fetched_at: Utc::now(),
      }),
      Err(e) => {
        warn!(key = %rendered, error = %e, "Cache write failed");
        None
      }
    }
  }

  /// Whether a fresh entry exists for `key`. Backend errors count as absent.
  #[allow(dead_code)]
  pub fn contains(&self, key: &CacheKey) -> bool {
    let rendered = self.key(key);
    self.storage.exists(&rendered).unwrap_or_else(|e| {
      warn!(key = %rendered, error = %e, "Cache lookup failed");
      false
    })
  }

  /// Delete exactly the given keys.
  ///
  /// Fetches already in progress for these keys won't write their result.
  pub fn invalidate(&self, keys: &[CacheKey]) {
    let mut generations = self.lock_generations();
    for key in keys {
      let rendered = self.key(key);
      debug!(key = %rendered, "invalidate: {}", key.description());
      self.delete_logged(&rendered);
      let generation = generations.entry(rendered).or_insert(0);
      *generation = generation.wrapping_add(1);
    }
  }

  /// The keys a write to widgets of one dashboard makes stale: each widget's
  /// own data key, the dashboard's widget list, and the user's dashboard list.
  pub fn widget_write_keys<'a>(
    user_id: &str,
    dashboard_id: &str,
    widget_ids: impl IntoIterator<Item = &'a WidgetId>,
  ) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = widget_ids
      .into_iter()
      .map(|id| CacheKey::widget_data(user_id, dashboard_id, id))
      .collect();
    keys.push(CacheKey::widgets(user_id, dashboard_id));
    keys.push(CacheKey::dashboards(user_id));
    keys
  }

  /// Invalidate everything a widget write touches.
  pub fn invalidate_widget_writes<'a>(
    &self,
    user_id: &str,
    dashboard_id: &str,
    widget_ids: impl IntoIterator<Item = &'a WidgetId>,
  ) {
    self.invalidate(&Self::widget_write_keys(user_id, dashboard_id, widget_ids));
  }

  fn generation(&self, rendered: &str) -> u64 {
    self.lock_generations().get(rendered).copied().unwrap_or(0)
  }

  fn lock_generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
    self.generations.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn delete_logged(&self, rendered: &str) {
    if let Err(e) = self.storage.delete(rendered) {
      warn!(key = %rendered, error = %e, "Cache delete failed");
    }
  }
}

impl Clone for CacheManager {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      namespace: self.namespace.clone(),
      ttl: self.ttl,
      generations: Arc::clone(&self.generations),
    }
  }
}
