use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::config::{ChartKind, WidgetConfig, WidgetKind};

/// Prefix marking ids generated on the client before the store assigned one.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Widget identifier, either temporary (client-generated) or durable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Allocate a fresh temporary id.
  pub fn temporary() -> Self {
    Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple()))
  }

  pub fn is_temporary(&self) -> bool {
    self.0.starts_with(TEMP_ID_PREFIX)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for WidgetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(&self.0)
  }
}

impl From<&str> for WidgetId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for WidgetId {
  fn from(id: String) -> Self {
    Self(id)
  }
}

/// Grid placement. Opaque to the sync engine; produced by the layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
  pub x: u32,
  pub y: u32,
  pub w: u32,
  pub h: u32,
}

impl Position {
  pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
    Self { x, y, w, h }
  }

  pub fn bottom(&self) -> u32 {
    self.y.saturating_add(self.h)
  }

  pub fn right(&self) -> u32 {
    self.x.saturating_add(self.w)
  }

  pub fn overlaps(&self, other: &Position) -> bool {
    self.x < other.right()
      && other.x < self.right()
      && self.y < other.bottom()
      && other.y < self.bottom()
  }
}

/// Pointer to a cache entry holding a widget's materialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyRef {
  pub key: String,
  pub fetched_at: DateTime<Utc>,
}

/// One visual element on a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
  pub id: WidgetId,
  pub dashboard_id: String,
  pub title: String,
  pub config: WidgetConfig,
  /// Materialized query output, if any
  pub data: Option<Value>,
  pub position: Position,
  pub is_configured: bool,
  pub cache_key_ref: Option<CacheKeyRef>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Widget {
  pub fn kind(&self) -> WidgetKind {
    self.config.kind()
  }

  pub fn subtype(&self) -> Option<ChartKind> {
    self.config.subtype()
  }

  /// Apply a partial update. Only fields present in the patch change.
  pub fn apply(&mut self, patch: &WidgetPatch, now: DateTime<Utc>) {
    if let Some(title) = &patch.title {
      self.title = title.clone();
    }
    if let Some(config) = &patch.config {
      self.config = config.clone();
      self.is_configured = config.is_renderable();
    }
    if let Some(data) = &patch.data {
      self.data = Some(data.clone());
    }
    if let Some(position) = patch.position {
      self.position = position;
    }
    if let Some(cache_key_ref) = &patch.cache_key_ref {
      self.cache_key_ref = Some(cache_key_ref.clone());
    }
    self.updated_at = now;
  }
}

/// A partial widget update. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub config: Option<WidgetConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<Position>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_key_ref: Option<CacheKeyRef>,
}

impl WidgetPatch {
  pub fn title(title: impl Into<String>) -> Self {
    Self {
      title: Some(title.into()),
      ..Default::default()
    }
  }

  pub fn config(config: WidgetConfig) -> Self {
    Self {
      config: Some(config),
      ..Default::default()
    }
  }

  pub fn position(position: Position) -> Self {
    Self {
      position: Some(position),
      ..Default::default()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.title.is_none()
      && self.config.is_none()
      && self.data.is_none()
      && self.position.is_none()
      && self.cache_key_ref.is_none()
  }

  /// Fold a newer patch on top of this one; the newer value wins per field.
  pub fn merge(&mut self, newer: WidgetPatch) {
    if newer.title.is_some() {
      self.title = newer.title;
    }
    if newer.config.is_some() {
      self.config = newer.config;
    }
    if newer.data.is_some() {
      self.data = newer.data;
    }
    if newer.position.is_some() {
      self.position = newer.position;
    }
    if newer.cache_key_ref.is_some() {
      self.cache_key_ref = newer.cache_key_ref;
    }
  }
}

/// Parameters for creating a widget.
#[derive(Debug, Clone)]
pub struct NewWidget {
  pub kind: WidgetKind,
  pub subtype: Option<ChartKind>,
  pub title: Option<String>,
  pub config: Option<WidgetConfig>,
  pub data: Option<Value>,
  /// Explicit placement; otherwise the layout picks one
  pub position: Option<Position>,
}

impl NewWidget {
  pub fn new(kind: WidgetKind) -> Self {
    Self {
      kind,
      subtype: None,
      title: None,
      config: None,
      data: None,
      position: None,
    }
  }

  pub fn chart(subtype: ChartKind) -> Self {
    Self {
      subtype: Some(subtype),
      ..Self::new(WidgetKind::Chart)
    }
  }

  pub fn with_title(mut self, title: impl Into<String>) -> Self {
    self.title = Some(title.into());
    self
  }

  /// Use an explicit config. The widget kind follows the config.
  pub fn with_config(mut self, config: WidgetConfig) -> Self {
    self.kind = config.kind();
    self.subtype = config.subtype();
    self.config = Some(config);
    self
  }

  pub fn with_data(mut self, data: Value) -> Self {
    self.data = Some(data);
    self
  }

  pub fn at(mut self, position: Position) -> Self {
    self.position = Some(position);
    self
  }

  /// Materialize into a widget with the given id and placement.
  pub fn into_widget(
    self,
    id: WidgetId,
    dashboard_id: &str,
    position: Position,
    now: DateTime<Utc>,
  ) -> Widget {
    let config = self
      .config
      .unwrap_or_else(|| WidgetConfig::default_for(self.kind, self.subtype));
    Widget {
      id,
      dashboard_id: dashboard_id.to_string(),
      title: self
        .title
        .unwrap_or_else(|| config.kind().default_title().to_string()),
      is_configured: config.is_renderable(),
      config,
      data: self.data,
      position,
      cache_key_ref: None,
      created_at: now,
      updated_at: now,
    }
  }
}
