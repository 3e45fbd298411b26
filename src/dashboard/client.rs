//! Durable store client with transparent caching.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheKey, CacheManager, CacheResult};
use crate::db::{DashboardSummary, DurableStore, StoreError, WidgetUpdate, WriteBatch};
use crate::widget::{CacheKeyRef, Widget, WidgetId, WidgetPatch};

/// Durable store client with transparent caching support.
///
/// Reads go through the cache. Direct mutations write through to the store
/// and invalidate the affected keys before returning, so a caller never
/// reads back its own write from a stale entry.
pub struct CachedDashboardClient<D: DurableStore> {
  inner: Arc<D>,
  cache: CacheManager,
  user_id: String,
}

impl<D: DurableStore> Clone for CachedDashboardClient<D> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      cache: self.cache.clone(),
      user_id: self.user_id.clone(),
    }
  }
}

impl<D: DurableStore> CachedDashboardClient<D> {
  pub fn new(inner: Arc<D>, cache: CacheManager, user_id: impl Into<String>) -> Self {
    Self {
      inner,
      cache,
      user_id: user_id.into(),
    }
  }

  pub fn store(&self) -> &Arc<D> {
    &self.inner
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// All widgets of a dashboard with caching.
  pub async fn list_widgets(&self, dashboard_id: &str) -> Result<Vec<Widget>, StoreError> {
    let key = CacheKey::widgets(&self.user_id, dashboard_id);
    let result = self
      .cache
      .fetch(&key, || self.inner.list_widgets(dashboard_id))
      .await?;
    Ok(result.data)
  }

  /// The user's dashboards with caching.
  pub async fn list_dashboards(&self) -> Result<Vec<DashboardSummary>, StoreError> {
    let key = CacheKey::dashboards(&self.user_id);
    let result = self
      .cache
      .fetch(&key, || self.inner.list_dashboards(&self.user_id))
      .await?;
    Ok(result.data)
  }

  /// A widget's materialized data with caching, plus a reference to the
  /// cache entry holding it.
  pub async fn widget_data(
    &self,
    dashboard_id: &str,
    widget_id: &WidgetId,
  ) -> Result<(CacheResult<Option<Value>>, CacheKeyRef), StoreError> {
    let key = CacheKey::widget_data(&self.user_id, dashboard_id, widget_id);
    let result = self
      .cache
      .fetch(&key, || async {
        let widgets = self.inner.list_widgets(dashboard_id).await?;
        widgets
          .into_iter()
          .find(|w| &w.id == widget_id)
          .map(|w| w.data)
          .ok_or_else(|| StoreError::NotFound {
            entity: "widget",
            id: widget_id.to_string(),
          })
      })
      .await?;

    let key_ref = CacheKeyRef {
      key: self.cache.key(&key),
      fetched_at: result.cached_at.unwrap_or_else(chrono::Utc::now),
    };
    Ok((result, key_ref))
  }

  /// Update one durable widget directly.
  pub async fn update_widget(
    &self,
    dashboard_id: &str,
    widget_id: &WidgetId,
    patch: WidgetPatch,
  ) -> Result<(), StoreError> {
    let batch = WriteBatch {
      updates: vec![WidgetUpdate {
        id: widget_id.clone(),
        patch,
      }],
      ..Default::default()
    };
    self.inner.batch_write(dashboard_id, &batch).await?;
    self
      .cache
      .invalidate_widget_writes(&self.user_id, dashboard_id, [widget_id]);
    info!(widget_id = %widget_id, "widget updated");
    Ok(())
  }

  /// Delete one durable widget directly.
  pub async fn delete_widget(
    &self,
    dashboard_id: &str,
    widget_id: &WidgetId,
  ) -> Result<(), StoreError> {
    let batch = WriteBatch {
      deletes: vec![widget_id.clone()],
      ..Default::default()
    };
    self.inner.batch_write(dashboard_id, &batch).await?;
    self
      .cache
      .invalidate_widget_writes(&self.user_id, dashboard_id, [widget_id]);
    info!(widget_id = %widget_id, "widget deleted");
    Ok(())
  }

  pub async fn create_dashboard(&self, name: &str) -> Result<DashboardSummary, StoreError> {
    let summary = self.inner.create_dashboard(&self.user_id, name).await?;
    self.cache.invalidate(&[CacheKey::dashboards(&self.user_id)]);
    info!(dashboard_id = %summary.id, "dashboard created");
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryCache};
  use crate::db::MemoryStore;
  use crate::widget::{NewWidget, Position, WidgetKind};
  use chrono::Utc;
  use serde_json::json;
  use std::time::Duration;

  fn client() -> (CachedDashboardClient<MemoryStore>, Arc<MemoryStore>) {
    client_over(MemoryStore::new())
  }

  fn client_over(store: MemoryStore) -> (CachedDashboardClient<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(store);
    store.insert_dashboard("d1", "u1", "Main");
    store.insert_widget(
      NewWidget::new(WidgetKind::Kpi)
        .with_data(json!({"value": 42}))
        .into_widget(WidgetId::new("w1"), "d1", Position::default(), Utc::now()),
    );
    let cache = CacheManager::new(Arc::new(MemoryCache::new()), "test");
    (CachedDashboardClient::new(store.clone(), cache, "u1"), store)
  }

  #[tokio::test]
  async fn test_update_is_visible_on_next_read() {
    let (client, _) = client();
    let before = client.list_widgets("d1").await.unwrap();
    assert_eq!(before[0].title, "KPI");

    client
      .update_widget("d1", &WidgetId::new("w1"), WidgetPatch::title("Revenue"))
      .await
      .unwrap();

    assert!(!client.cache().contains(&CacheKey::widgets("u1", "d1")));
    let after = client.list_widgets("d1").await.unwrap();
    assert_eq!(after[0].title, "Revenue");
  }

  #[tokio::test]
  async fn test_failed_write_keeps_cache() {
    let (client, store) = client();
    client.list_widgets("d1").await.unwrap();
    store.fail_next(StoreError::Unavailable("down".into()));

    let err = client
      .delete_widget("d1", &WidgetId::new("w1"))
      .await
      .unwrap_err();
    assert!(err.is_transient());
    assert!(client.cache().contains(&CacheKey::widgets("u1", "d1")));
  }

  #[tokio::test]
  async fn test_widget_data_is_cached() {
    let (client, _) = client();
    let id = WidgetId::new("w1");

    let (first, key_ref) = client.widget_data("d1", &id).await.unwrap();
    assert_eq!(first.source, CacheSource::Store);
    assert_eq!(first.data, Some(json!({"value": 42})));
    assert!(key_ref.key.starts_with("test:"));

    let (second, _) = client.widget_data("d1", &id).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);

    let missing = client.widget_data("d1", &WidgetId::new("nope")).await;
    assert!(matches!(missing, Err(StoreError::NotFound { entity: "widget", .. })));
  }

  #[tokio::test]
  async fn test_create_dashboard_refreshes_listing() {
    let (client, _) = client();
    assert_eq!(client.list_dashboards().await.unwrap().len(), 1);

    client.create_dashboard("Second").await.unwrap();
    let names: Vec<String> = client
      .list_dashboards()
      .await
      .unwrap()
      .into_iter()
      .map(|d| d.name)
      .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"Second".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_read_does_not_cache_over_a_write() {
    let (client, _) = client_over(MemoryStore::new().with_read_latency(Duration::from_millis(300)));
    let reader = client.clone();
    let slow = tokio::spawn(async move { reader.list_widgets("d1").await });

    // The reader has its rows and is still on the way back
    tokio::time::sleep(Duration::from_millis(10)).await;
    client
      .update_widget("d1", &WidgetId::new("w1"), WidgetPatch::title("Revenue"))
      .await
      .unwrap();

    let raced = slow.await.unwrap().unwrap();
    assert_eq!(raced[0].title, "KPI");
    assert!(!client.cache().contains(&CacheKey::widgets("u1", "d1")));

    let after = client.list_widgets("d1").await.unwrap();
    assert_eq!(after[0].title, "Revenue");
  }
}
