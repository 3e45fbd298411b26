//! Durable store contract and implementations.
//!
//! The durable store is the record of truth for dashboards and widgets. The
//! sync engine only talks to it through `DurableStore`, one batch per flush.

mod memory;
pub mod schema;
mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

use crate::widget::{Widget, WidgetId, WidgetPatch};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Failures reported by the durable store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  /// Network, IO or locking trouble; retrying may succeed
  #[error("Durable store unavailable: {0}")]
  Unavailable(String),

  /// The store refused the write; retrying the same payload will fail again
  #[error("Durable store rejected the write: {0}")]
  Rejected(String),
}

impl StoreError {
  pub fn is_transient(&self) -> bool {
    matches!(self, StoreError::Unavailable(_))
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(rusqlite::ErrorCode::ConstraintViolation) => StoreError::Rejected(e.to_string()),
      _ => StoreError::Unavailable(e.to_string()),
    }
  }
}

/// A partial update addressed to one widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetUpdate {
  pub id: WidgetId,
  pub patch: WidgetPatch,
}

/// The net set of operations sent in one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
  /// New widgets, still carrying their temporary ids
  pub creates: Vec<Widget>,
  pub updates: Vec<WidgetUpdate>,
  pub deletes: Vec<WidgetId>,
}

impl WriteBatch {
  pub fn is_empty(&self) -> bool {
    self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.creates.len() + self.updates.len() + self.deletes.len()
  }
}

/// Outcome of a successful batch write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteResult {
  /// Temporary id -> durable id for every created widget
  pub created_ids: HashMap<WidgetId, WidgetId>,
}

/// Row of the dashboard list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSummary {
  pub id: String,
  pub user_id: String,
  pub name: String,
  pub widget_count: u32,
  pub updated_at: DateTime<Utc>,
}

/// Contract of the durable store collaborator.
///
/// `batch_write` must apply a batch all-or-nothing, and creates must be
/// idempotent on the temporary id so a replayed batch converges.
pub trait DurableStore: Send + Sync + 'static {
  fn batch_write(
    &self,
    dashboard_id: &str,
    batch: &WriteBatch,
  ) -> impl Future<Output = Result<BatchWriteResult, StoreError>> + Send;

  fn list_widgets(
    &self,
    dashboard_id: &str,
  ) -> impl Future<Output = Result<Vec<Widget>, StoreError>> + Send;

  fn list_dashboards(
    &self,
    user_id: &str,
  ) -> impl Future<Output = Result<Vec<DashboardSummary>, StoreError>> + Send;

  fn create_dashboard(
    &self,
    user_id: &str,
    name: &str,
  ) -> impl Future<Output = Result<DashboardSummary, StoreError>> + Send;
}

/// Allocate a durable id for a new record.
pub(crate) fn new_durable_id() -> String {
  uuid::Uuid::new_v4().to_string()
}

/// Check everything in a batch that the store would refuse.
pub(crate) fn validate_batch(batch: &WriteBatch) -> Result<(), StoreError> {
  for widget in &batch.creates {
    if !widget.id.is_temporary() {
      return Err(StoreError::Rejected(format!(
        "create for widget {} must carry a temporary id",
        widget.id
      )));
    }
    widget
      .config
      .validate()
      .map_err(|e| StoreError::Rejected(format!("widget {}: {}", widget.id, e)))?;
  }
  for update in &batch.updates {
    if let Some(config) = &update.patch.config {
      config
        .validate()
        .map_err(|e| StoreError::Rejected(format!("widget {}: {}", update.id, e)))?;
    }
  }
  Ok(())
}
