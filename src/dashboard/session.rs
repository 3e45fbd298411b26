//! An open dashboard: widget store, writer task and cached reads wired up.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::client::CachedDashboardClient;
use super::layout::{Layout, StackLayout};
use super::store::WidgetStore;
use crate::db::{DurableStore, StoreError};
use crate::sync::{lock, BatchWriter, DashboardState, FlushOutcome, RetryPolicy, SharedState};
use crate::widget::WidgetId;

/// Knobs for a session's writer and layout.
#[derive(Clone)]
pub struct SessionOptions {
  pub debounce: Duration,
  pub retry: RetryPolicy,
  pub layout: Arc<dyn Layout>,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      debounce: Duration::from_secs(1),
      retry: RetryPolicy::default(),
      layout: Arc::new(StackLayout::default()),
    }
  }
}

pub struct DashboardSession<D: DurableStore> {
  client: CachedDashboardClient<D>,
  state: SharedState,
  store: WidgetStore,
}

impl<D: DurableStore> DashboardSession<D> {
  /// Load a dashboard's widgets through the cache and start its writer.
  pub async fn open(
    client: CachedDashboardClient<D>,
    dashboard_id: &str,
    options: SessionOptions,
  ) -> Result<Self, StoreError> {
    let widgets = client.list_widgets(dashboard_id).await?;
    info!(dashboard_id, widgets = widgets.len(), "dashboard opened");
    let state = DashboardState::new(dashboard_id, widgets).shared();
    Ok(Self::mount(client, state, options))
  }

  /// Start a writer over existing state, e.g. one left behind by `unmount`.
  /// Intent still queued there is scheduled right away.
  pub fn mount(client: CachedDashboardClient<D>, state: SharedState, options: SessionOptions) -> Self {
    let writer = BatchWriter::new(
      client.user_id(),
      state.clone(),
      Arc::clone(client.store()),
      client.cache().clone(),
    )
    .with_debounce(options.debounce)
    .with_retry_policy(options.retry)
    .spawn();

    let pending = !lock(&state).queue().is_empty();
    let store = WidgetStore::new(state.clone(), options.layout, writer);
    if pending {
      debug!(pending = store.pending_count(), "resuming queued intent");
      store.writer().schedule();
    }

    Self {
      client,
      state,
      store,
    }
  }

  pub fn dashboard_id(&self) -> String {
    lock(&self.state).dashboard_id().to_string()
  }

  pub fn widgets(&self) -> &WidgetStore {
    &self.store
  }

  #[allow(dead_code)]
  pub fn client(&self) -> &CachedDashboardClient<D> {
    &self.client
  }

  pub fn set_reachable(&self, online: bool) {
    self.store.writer().set_reachable(online);
  }

  /// Flush now and wait for the result.
  pub async fn flush(&self) -> FlushOutcome {
    self.store.writer().flush().await
  }

  /// Re-read a widget's data through the cache and attach it locally.
  ///
  /// Widgets that only exist locally, or that have edits not yet confirmed
  /// by the store, keep what they have.
  pub async fn refresh_data(&self, id: &WidgetId) -> Result<Option<Value>, StoreError> {
    let Some(widget) = self.store.get(id) else {
      return Err(StoreError::NotFound {
        entity: "widget",
        id: id.to_string(),
      });
    };
    if widget.id.is_temporary() {
      return Ok(widget.data);
    }

    let mark = self.store.read_mark();
    let (result, key_ref) = self
      .client
      .widget_data(&widget.dashboard_id, &widget.id)
      .await?;
    if self
      .store
      .attach_data(&widget.id, result.data.clone(), key_ref, mark)
    {
      Ok(result.data)
    } else {
      Ok(self.store.get(&widget.id).and_then(|w| w.data))
    }
  }

  /// Tear down without flushing. The pending timer is dropped; queued
  /// intent stays in the returned state for the next `mount`.
  #[allow(dead_code)]
  pub fn unmount(self) -> SharedState {
    let writer = self.store.writer();
    writer.cancel();
    writer.shutdown();
    self.state
  }

  /// Flush whatever is queued, then stop the writer.
  pub async fn close(self) -> FlushOutcome {
    let outcome = self.flush().await;
    self.store.writer().shutdown();
    outcome
  }
}
