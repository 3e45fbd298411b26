//! In-memory durable store with failure injection.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
  new_durable_id, validate_batch, BatchWriteResult, DashboardSummary, DurableStore, StoreError,
  WriteBatch,
};
use crate::widget::{Widget, WidgetId};

#[derive(Default)]
struct State {
  dashboards: Vec<DashboardSummary>,
  widgets: Vec<Widget>,
  /// (dashboard id, temp id) -> durable id of every create applied so far
  client_refs: HashMap<(String, WidgetId), WidgetId>,
  /// Every batch_write call, successful or not
  requests: Vec<WriteBatch>,
  failures: VecDeque<StoreError>,
}

/// Durable store kept in process memory.
///
/// Has the same semantics as `SqliteStore` and lets callers inject failures
/// and latency, which is what the sync engine needs to be exercised against.
#[derive(Default)]
pub struct MemoryStore {
  state: Mutex<State>,
  latency: Option<Duration>,
  read_latency: Option<Duration>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a dashboard with a fixed id.
  pub fn insert_dashboard(&self, id: &str, user_id: &str, name: &str) {
    self.lock().dashboards.push(DashboardSummary {
      id: id.to_string(),
      user_id: user_id.to_string(),
      name: name.to_string(),
      widget_count: 0,
      updated_at: Utc::now(),
    });
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    // Writes are applied to a copy, so a poisoned state is still consistent
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Latency and failure injection, plus inspection of what was written.
#[allow(dead_code)]
impl MemoryStore {
  /// Delay every batch write by `latency` before it is applied.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = Some(latency);
    self
  }

  /// Delay `list_widgets` results by `latency` after the rows are read.
  pub fn with_read_latency(mut self, latency: Duration) -> Self {
    self.read_latency = Some(latency);
    self
  }

  /// Make the next `batch_write` fail with `error`. Failures queue up.
  pub fn fail_next(&self, error: StoreError) {
    self.lock().failures.push_back(error);
  }

  /// All batch_write requests received so far, in order.
  pub fn requests(&self) -> Vec<WriteBatch> {
    self.lock().requests.clone()
  }

  pub fn request_count(&self) -> usize {
    self.lock().requests.len()
  }

  /// Seed a widget that already has a durable id.
  pub fn insert_widget(&self, widget: Widget) {
    self.lock().widgets.push(widget);
  }

  /// Snapshot of stored widgets for a dashboard.
  pub fn widgets(&self, dashboard_id: &str) -> Vec<Widget> {
    self
      .lock()
      .widgets
      .iter()
      .filter(|w| w.dashboard_id == dashboard_id)
      .cloned()
      .collect()
  }
}

impl State {
  fn ensure_dashboard(&self, dashboard_id: &str) -> Result<(), StoreError> {
    if self.dashboards.iter().any(|d| d.id == dashboard_id) {
      Ok(())
    } else {
      Err(StoreError::NotFound {
        entity: "dashboard",
        id: dashboard_id.to_string(),
      })
    }
  }

  fn apply(&mut self, dashboard_id: &str, batch: &WriteBatch) -> Result<BatchWriteResult, StoreError> {
    self.ensure_dashboard(dashboard_id)?;
    let now = Utc::now();
    let mut widgets = self.widgets.clone();
    let mut client_refs = self.client_refs.clone();
    let mut created_ids = HashMap::new();

    for widget in &batch.creates {
      let client_ref = (dashboard_id.to_string(), widget.id.clone());
      let durable = client_refs
        .get(&client_ref)
        .cloned()
        .unwrap_or_else(|| WidgetId::new(new_durable_id()));
      let stored = Widget {
        id: durable.clone(),
        dashboard_id: dashboard_id.to_string(),
        ..widget.clone()
      };
      match widgets.iter_mut().find(|w| w.id == durable) {
        Some(existing) => *existing = stored,
        None => widgets.push(stored),
      }
      client_refs.insert(client_ref, durable.clone());
      created_ids.insert(widget.id.clone(), durable);
    }

    for update in &batch.updates {
      let widget = widgets
        .iter_mut()
        .find(|w| w.id == update.id && w.dashboard_id == dashboard_id)
        .ok_or_else(|| StoreError::Rejected(format!("update for unknown widget {}", update.id)))?;
      widget.apply(&update.patch, now);
    }

    widgets.retain(|w| w.dashboard_id != dashboard_id || !batch.deletes.contains(&w.id));

    // Commit
    self.widgets = widgets;
    self.client_refs = client_refs;
    if let Some(dashboard) = self.dashboards.iter_mut().find(|d| d.id == dashboard_id) {
      dashboard.updated_at = now;
    }
    Ok(BatchWriteResult { created_ids })
  }
}

impl DurableStore for MemoryStore {
  async fn batch_write(
    &self,
    dashboard_id: &str,
    batch: &WriteBatch,
  ) -> Result<BatchWriteResult, StoreError> {
    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }

    let mut state = self.lock();
    state.requests.push(batch.clone());
    if let Some(error) = state.failures.pop_front() {
      return Err(error);
    }
    validate_batch(batch)?;
    state.apply(dashboard_id, batch)
  }

  async fn list_widgets(&self, dashboard_id: &str) -> Result<Vec<Widget>, StoreError> {
    let widgets: Vec<Widget> = {
      let state = self.lock();
      state.ensure_dashboard(dashboard_id)?;
      state
        .widgets
        .iter()
        .filter(|w| w.dashboard_id == dashboard_id)
        .cloned()
        .collect()
    };
    if let Some(latency) = self.read_latency {
      tokio::time::sleep(latency).await;
    }
    Ok(widgets)
  }

  async fn list_dashboards(&self, user_id: &str) -> Result<Vec<DashboardSummary>, StoreError> {
    let state = self.lock();
    let mut summaries: Vec<DashboardSummary> = state
      .dashboards
      .iter()
      .filter(|d| d.user_id == user_id)
      .map(|d| DashboardSummary {
        widget_count: state
          .widgets
          .iter()
          .filter(|w| w.dashboard_id == d.id)
          .count() as u32,
        ..d.clone()
      })
      .collect();
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(summaries)
  }

  async fn create_dashboard(
    &self,
    user_id: &str,
    name: &str,
  ) -> Result<DashboardSummary, StoreError> {
    let name = name.trim();
    if name.is_empty() {
      return Err(StoreError::Rejected("dashboard name must not be blank".into()));
    }
    let summary = DashboardSummary {
      id: new_durable_id(),
      user_id: user_id.to_string(),
      name: name.to_string(),
      widget_count: 0,
      updated_at: Utc::now(),
    };
    self.lock().dashboards.push(summary.clone());
    Ok(summary)
  }
}
