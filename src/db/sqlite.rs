//! SQLite-backed durable store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::schema::SCHEMA;
use super::{
  new_durable_id, validate_batch, BatchWriteResult, DashboardSummary, DurableStore, StoreError,
  WriteBatch,
};
use crate::widget::{Widget, WidgetId};

/// Durable store over a single SQLite connection.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch("PRAGMA foreign_keys = ON;")
      .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

impl DurableStore for SqliteStore {
  async fn batch_write(
    &self,
    dashboard_id: &str,
    batch: &WriteBatch,
  ) -> Result<BatchWriteResult, StoreError> {
    validate_batch(batch)?;

    let mut conn = self.lock()?;
    let tx = conn.transaction()?;
    ensure_dashboard(&tx, dashboard_id)?;

    let now = Utc::now();
    let mut created_ids = HashMap::new();

    for widget in &batch.creates {
      // A replayed create lands on the row it created the first time
      let existing: Option<String> = tx
        .query_row(
          "SELECT id FROM widgets WHERE client_ref = ? AND dashboard_id = ?",
          params![widget.id.as_str(), dashboard_id],
          |row| row.get(0),
        )
        .optional()?;

      let durable = match existing {
        Some(id) => {
          let stored = Widget {
            id: WidgetId::new(id.as_str()),
            dashboard_id: dashboard_id.to_string(),
            ..widget.clone()
          };
          write_widget(&tx, &stored)?;
          id
        }
        None => {
          let id = new_durable_id();
          insert_widget(&tx, &id, dashboard_id, widget)?;
          id
        }
      };
      created_ids.insert(widget.id.clone(), WidgetId::new(durable));
    }

    for update in &batch.updates {
      // Widgets of other dashboards are invisible to this batch
      let mut widget = load_widget(&tx, dashboard_id, &update.id)?.ok_or_else(|| {
        StoreError::Rejected(format!("update for unknown widget {}", update.id))
      })?;
      widget.apply(&update.patch, now);
      write_widget(&tx, &widget)?;
    }

    for id in &batch.deletes {
      // Deleting an absent row is a no-op so replays converge
      tx.execute(
        "DELETE FROM widgets WHERE id = ? AND dashboard_id = ?",
        params![id.as_str(), dashboard_id],
      )?;
    }

    tx.execute(
      "UPDATE dashboards SET updated_at = ? WHERE id = ?",
      params![now.to_rfc3339(), dashboard_id],
    )?;
    tx.commit()?;

    debug!(
      dashboard_id,
      creates = batch.creates.len(),
      updates = batch.updates.len(),
      deletes = batch.deletes.len(),
      "batch committed"
    );
    Ok(BatchWriteResult { created_ids })
  }

  async fn list_widgets(&self, dashboard_id: &str) -> Result<Vec<Widget>, StoreError> {
    let conn = self.lock()?;
    ensure_dashboard(&conn, dashboard_id)?;

    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM widgets WHERE dashboard_id = ? ORDER BY created_at, id",
      WIDGET_COLUMNS
    ))?;
    let rows: Vec<WidgetRow> = stmt
      .query_map(params![dashboard_id], WidgetRow::from_row)?
      .collect::<rusqlite::Result<_>>()?;

    rows.into_iter().map(WidgetRow::into_widget).collect()
  }

  async fn list_dashboards(&self, user_id: &str) -> Result<Vec<DashboardSummary>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT d.id, d.user_id, d.name, d.updated_at, COUNT(w.id)
       FROM dashboards d
       LEFT JOIN widgets w ON w.dashboard_id = d.id
       WHERE d.user_id = ?
       GROUP BY d.id
       ORDER BY d.updated_at DESC",
    )?;

    let rows: Vec<(String, String, String, String, u32)> = stmt
      .query_map(params![user_id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })?
      .collect::<rusqlite::Result<_>>()?;

    rows
      .into_iter()
      .map(|(id, user_id, name, updated_at, widget_count)| {
        Ok(DashboardSummary {
          id,
          user_id,
          name,
          widget_count,
          updated_at: parse_timestamp(&updated_at)?,
        })
      })
      .collect()
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

    let conn = self.lock()?;
    let now = Utc::now();
    let id = new_durable_id();
    conn.execute(
      "INSERT INTO dashboards (id, user_id, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
      params![id, user_id, name, now.to_rfc3339(), now.to_rfc3339()],
    )?;

    Ok(DashboardSummary {
      id,
      user_id: user_id.to_string(),
      name: name.to_string(),
      widget_count: 0,
      updated_at: now,
    })
  }
}

const WIDGET_COLUMNS: &str = "id, dashboard_id, title, config, data, position, is_configured, \
                              cache_key_ref, created_at, updated_at";

/// Raw widget row before JSON decoding.
struct WidgetRow {
  id: String,
  dashboard_id: String,
  title: String,
  config: String,
  data: Option<String>,
  position: String,
  is_configured: bool,
  cache_key_ref: Option<String>,
  created_at: String,
  updated_at: String,
}

impl WidgetRow {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      dashboard_id: row.get(1)?,
      title: row.get(2)?,
      config: row.get(3)?,
      data: row.get(4)?,
      position: row.get(5)?,
      is_configured: row.get(6)?,
      cache_key_ref: row.get(7)?,
      created_at: row.get(8)?,
      updated_at: row.get(9)?,
    })
  }

  fn into_widget(self) -> Result<Widget, StoreError> {
    Ok(Widget {
      config: decode(&self.config)?,
      data: self.data.as_deref().map(decode).transpose()?,
      position: decode(&self.position)?,
      cache_key_ref: self.cache_key_ref.as_deref().map(decode).transpose()?,
      created_at: parse_timestamp(&self.created_at)?,
      updated_at: parse_timestamp(&self.updated_at)?,
      id: WidgetId::new(self.id),
      dashboard_id: self.dashboard_id,
      title: self.title,
      is_configured: self.is_configured,
    })
  }
}

fn ensure_dashboard(conn: &Connection, dashboard_id: &str) -> Result<(), StoreError> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM dashboards WHERE id = ?",
      params![dashboard_id],
      |row| row.get(0),
    )
    .optional()?;

  match found {
    Some(_) => Ok(()),
    None => Err(StoreError::NotFound {
      entity: "dashboard",
      id: dashboard_id.to_string(),
    }),
  }
}

fn load_widget(
  tx: &Transaction<'_>,
  dashboard_id: &str,
  id: &WidgetId,
) -> Result<Option<Widget>, StoreError> {
  let row = tx
    .query_row(
      &format!(
        "SELECT {} FROM widgets WHERE id = ? AND dashboard_id = ?",
        WIDGET_COLUMNS
      ),
      params![id.as_str(), dashboard_id],
      WidgetRow::from_row,
    )
    .optional()?;
  row.map(WidgetRow::into_widget).transpose()
}

fn insert_widget(
  tx: &Transaction<'_>,
  id: &str,
  dashboard_id: &str,
  widget: &Widget,
) -> Result<(), StoreError> {
  tx.execute(
    "INSERT INTO widgets (id, dashboard_id, client_ref, title, kind, config, data, position,
                          is_configured, cache_key_ref, created_at, updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      id,
      dashboard_id,
      widget.id.as_str(),
      widget.title,
      widget.kind().as_str(),
      encode(&widget.config)?,
      widget.data.as_ref().map(encode).transpose()?,
      encode(&widget.position)?,
      widget.is_configured,
      widget.cache_key_ref.as_ref().map(encode).transpose()?,
      widget.created_at.to_rfc3339(),
      widget.updated_at.to_rfc3339(),
    ],
  )?;
  Ok(())
}

fn write_widget(tx: &Transaction<'_>, widget: &Widget) -> Result<(), StoreError> {
  tx.execute(
    "UPDATE widgets SET title = ?, kind = ?, config = ?, data = ?, position = ?,
                        is_configured = ?, cache_key_ref = ?, updated_at = ?
     WHERE id = ? AND dashboard_id = ?",
    params![
      widget.title,
      widget.kind().as_str(),
      encode(&widget.config)?,
      widget.data.as_ref().map(encode).transpose()?,
      encode(&widget.position)?,
      widget.is_configured,
      widget.cache_key_ref.as_ref().map(encode).transpose()?,
      widget.updated_at.to_rfc3339(),
      widget.id.as_str(),
      widget.dashboard_id,
    ],
  )?;
  Ok(())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
  serde_json::to_string(value).map_err(|e| StoreError::Rejected(format!("unencodable value: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
  serde_json::from_str(s).map_err(|e| StoreError::Unavailable(format!("corrupt row: {}", e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Unavailable(format!("corrupt timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::WidgetUpdate;
  use crate::widget::{ChartKind, NewWidget, Position, WidgetKind, WidgetPatch};

  fn temp_widget(dashboard_id: &str, kind: WidgetKind) -> Widget {
    NewWidget::new(kind).into_widget(
      WidgetId::temporary(),
      dashboard_id,
      Position::new(0, 0, 6, 4),
      Utc::now(),
    )
  }

  async fn store_with_dashboard() -> (SqliteStore, String) {
    let store = SqliteStore::open_in_memory().unwrap();
    let dashboard = store.create_dashboard("u1", "Sales").await.unwrap();
    (store, dashboard.id)
  }

  #[tokio::test]
  async fn test_create_assigns_durable_ids() {
    let (store, dashboard) = store_with_dashboard().await;
    let widget = temp_widget(&dashboard, WidgetKind::Chart);

    let batch = WriteBatch {
      creates: vec![widget.clone()],
      ..Default::default()
    };
    let result = store.batch_write(&dashboard, &batch).await.unwrap();

    let durable = &result.created_ids[&widget.id];
    assert!(!durable.is_temporary());

    let widgets = store.list_widgets(&dashboard).await.unwrap();
    assert_eq!(widgets.len(), 1);
    assert_eq!(&widgets[0].id, durable);
    assert_eq!(widgets[0].config, widget.config);
  }

  #[tokio::test]
  async fn test_replayed_create_is_idempotent() {
    let (store, dashboard) = store_with_dashboard().await;
    let mut widget = temp_widget(&dashboard, WidgetKind::Text);
    let batch = WriteBatch {
      creates: vec![widget.clone()],
      ..Default::default()
    };
    let first = store.batch_write(&dashboard, &batch).await.unwrap();

    widget.title = "Renamed".into();
    let replay = WriteBatch {
      creates: vec![widget.clone()],
      ..Default::default()
    };
    let second = store.batch_write(&dashboard, &replay).await.unwrap();

    assert_eq!(first.created_ids, second.created_ids);
    let widgets = store.list_widgets(&dashboard).await.unwrap();
    assert_eq!(widgets.len(), 1);
    assert_eq!(widgets[0].title, "Renamed");
  }

  #[tokio::test]
  async fn test_update_and_delete() {
    let (store, dashboard) = store_with_dashboard().await;
    let a = temp_widget(&dashboard, WidgetKind::Kpi);
    let b = temp_widget(&dashboard, WidgetKind::Table);
    let created = store
      .batch_write(
        &dashboard,
        &WriteBatch {
          creates: vec![a.clone(), b.clone()],
          ..Default::default()
        },
      )
      .await
      .unwrap()
      .created_ids;

    let batch = WriteBatch {
      updates: vec![WidgetUpdate {
        id: created[&a.id].clone(),
        patch: WidgetPatch::title("Revenue"),
      }],
      deletes: vec![created[&b.id].clone(), WidgetId::new("already-gone")],
      ..Default::default()
    };
    store.batch_write(&dashboard, &batch).await.unwrap();

    let widgets = store.list_widgets(&dashboard).await.unwrap();
    assert_eq!(widgets.len(), 1);
    assert_eq!(widgets[0].title, "Revenue");
  }

  #[tokio::test]
  async fn test_failed_batch_rolls_back() {
    let (store, dashboard) = store_with_dashboard().await;
    let batch = WriteBatch {
      creates: vec![temp_widget(&dashboard, WidgetKind::Text)],
      updates: vec![WidgetUpdate {
        id: WidgetId::new("missing"),
        patch: WidgetPatch::title("x"),
      }],
      ..Default::default()
    };

    let err = store.batch_write(&dashboard, &batch).await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));
    assert!(!err.is_transient());
    assert!(store.list_widgets(&dashboard).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_invalid_config_is_rejected() {
    let (store, dashboard) = store_with_dashboard().await;
    let mut widget = NewWidget::chart(ChartKind::Pie).into_widget(
      WidgetId::temporary(),
      &dashboard,
      Position::default(),
      Utc::now(),
    );
    if let crate::widget::WidgetConfig::Chart(chart) = &mut widget.config {
      chart.y_fields = vec!["a".into(), "b".into()];
    }

    let batch = WriteBatch {
      creates: vec![widget],
      ..Default::default()
    };
    assert!(matches!(
      store.batch_write(&dashboard, &batch).await,
      Err(StoreError::Rejected(_))
    ));
  }

  #[tokio::test]
  async fn test_unknown_dashboard_is_not_found() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(matches!(
      store.list_widgets("nope").await,
      Err(StoreError::NotFound {
        entity: "dashboard",
        ..
      })
    ));
  }

  #[tokio::test]
  async fn test_dashboard_summaries_count_widgets() {
    let (store, dashboard) = store_with_dashboard().await;
    store.create_dashboard("u2", "Other user").await.unwrap();
    store
      .batch_write(
        &dashboard,
        &WriteBatch {
          creates: vec![
            temp_widget(&dashboard, WidgetKind::Text),
            temp_widget(&dashboard, WidgetKind::Chart),
          ],
          ..Default::default()
        },
      )
      .await
      .unwrap();

    let summaries = store.list_dashboards("u1").await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "Sales");
    assert_eq!(summaries[0].widget_count, 2);
  }

  #[tokio::test]
  async fn test_batch_cannot_touch_other_dashboards() {
    let (store, mine) = store_with_dashboard().await;
    let theirs = store.create_dashboard("u2", "Theirs").await.unwrap().id;
    let foreign = temp_widget(&theirs, WidgetKind::Kpi);
    let created = store
      .batch_write(
        &theirs,
        &WriteBatch {
          creates: vec![foreign.clone()],
          ..Default::default()
        },
      )
      .await
      .unwrap()
      .created_ids;
    let foreign_id = created[&foreign.id].clone();

    let update = WriteBatch {
      updates: vec![WidgetUpdate {
        id: foreign_id.clone(),
        patch: WidgetPatch::title("renamed"),
      }],
      ..Default::default()
    };
    assert!(matches!(
      store.batch_write(&mine, &update).await,
      Err(StoreError::Rejected(_))
    ));

    let delete = WriteBatch {
      deletes: vec![foreign_id],
      ..Default::default()
    };
    store.batch_write(&mine, &delete).await.unwrap();

    let left = store.list_widgets(&theirs).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].title, foreign.title);
  }
}
