//! Variant-specific widget configuration.
//!
//! Every widget type carries its own typed configuration. The `type` tag is
//! part of the serialized config, so a widget's type and its config can never
//! disagree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of widget variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
  Text,
  Chart,
  Kpi,
  Table,
}

impl WidgetKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      WidgetKind::Text => "text",
      WidgetKind::Chart => "chart",
      WidgetKind::Kpi => "kpi",
      WidgetKind::Table => "table",
    }
  }

  /// Title given to a freshly created widget of this kind.
  pub fn default_title(&self) -> &'static str {
    match self {
      WidgetKind::Text => "Text",
      WidgetKind::Chart => "Chart",
      WidgetKind::Kpi => "KPI",
      WidgetKind::Table => "Table",
    }
  }
}

impl fmt::Display for WidgetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Chart subtype
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
  #[default]
  Bar,
  Line,
  Area,
  Pie,
  Scatter,
}

/// How a KPI value is formatted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
  #[default]
  Number,
  Currency,
  Percent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextConfig {
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub markdown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
  #[serde(default)]
  pub subtype: ChartKind,
  pub query: Option<String>,
  pub x_field: Option<String>,
  #[serde(default)]
  pub y_fields: Vec<String>,
  #[serde(default = "default_true")]
  pub show_legend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiConfig {
  pub query: Option<String>,
  pub value_field: Option<String>,
  #[serde(default)]
  pub label: String,
  #[serde(default)]
  pub format: ValueFormat,
  /// Field holding the previous-period value, if a delta should be shown
  pub comparison_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
  pub query: Option<String>,
  #[serde(default)]
  pub columns: Vec<String>,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

fn default_true() -> bool {
  true
}

fn default_page_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

const DEFAULT_PAGE_SIZE: u32 = 25;
const MAX_PAGE_SIZE: u32 = 500;

/// Widget configuration, tagged by widget type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WidgetConfig {
  Text(TextConfig),
  Chart(ChartConfig),
  Kpi(KpiConfig),
  Table(TableConfig),
}

/// Reasons a configuration cannot be persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
  #[error("pie charts take exactly one value field, got {0}")]
  PieSeries(usize),
  #[error("table page size must be between 1 and {MAX_PAGE_SIZE}, got {0}")]
  PageSize(u32),
  #[error("{kind} query must not be blank")]
  BlankQuery { kind: WidgetKind },
}

impl WidgetConfig {
  /// Default configuration for a new widget of the given kind.
  ///
  /// `subtype` only matters for charts and is ignored otherwise.
  pub fn default_for(kind: WidgetKind, subtype: Option<ChartKind>) -> Self {
    match kind {
      WidgetKind::Text => WidgetConfig::Text(TextConfig::default()),
      WidgetKind::Chart => WidgetConfig::Chart(ChartConfig {
        subtype: subtype.unwrap_or_default(),
        query: None,
        x_field: None,
        y_fields: Vec::new(),
        show_legend: !matches!(subtype, Some(ChartKind::Pie)),
      }),
      WidgetKind::Kpi => WidgetConfig::Kpi(KpiConfig {
        query: None,
        value_field: None,
        label: String::new(),
        format: ValueFormat::Number,
        comparison_field: None,
      }),
      WidgetKind::Table => WidgetConfig::Table(TableConfig {
        query: None,
        columns: Vec::new(),
        page_size: DEFAULT_PAGE_SIZE,
      }),
    }
  }

  pub fn kind(&self) -> WidgetKind {
    match self {
      WidgetConfig::Text(_) => WidgetKind::Text,
      WidgetConfig::Chart(_) => WidgetKind::Chart,
      WidgetConfig::Kpi(_) => WidgetKind::Kpi,
      WidgetConfig::Table(_) => WidgetKind::Table,
    }
  }

  pub fn subtype(&self) -> Option<ChartKind> {
    match self {
      WidgetConfig::Chart(chart) => Some(chart.subtype),
      _ => None,
    }
  }

  /// Whether the config has everything needed to render.
  pub fn is_renderable(&self) -> bool {
    match self {
      WidgetConfig::Text(text) => !text.content.trim().is_empty(),
      WidgetConfig::Chart(chart) => {
        has_text(&chart.query) && has_text(&chart.x_field) && !chart.y_fields.is_empty()
      }
      WidgetConfig::Kpi(kpi) => has_text(&kpi.query) && has_text(&kpi.value_field),
      WidgetConfig::Table(table) => has_text(&table.query),
    }
  }

  /// Check structural constraints. An incomplete config is still valid;
  /// only contradictory ones are rejected.
  pub fn validate(&self) -> Result<(), ConfigError> {
    match self {
      WidgetConfig::Text(_) => Ok(()),
      WidgetConfig::Chart(chart) => {
        if chart.subtype == ChartKind::Pie && chart.y_fields.len() > 1 {
          return Err(ConfigError::PieSeries(chart.y_fields.len()));
        }
        check_query(WidgetKind::Chart, &chart.query)
      }
      WidgetConfig::Kpi(kpi) => check_query(WidgetKind::Kpi, &kpi.query),
      WidgetConfig::Table(table) => {
        if table.page_size == 0 || table.page_size > MAX_PAGE_SIZE {
          return Err(ConfigError::PageSize(table.page_size));
        }
        check_query(WidgetKind::Table, &table.query)
      }
    }
  }
}

fn has_text(value: &Option<String>) -> bool {
  value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

fn check_query(kind: WidgetKind, query: &Option<String>) -> Result<(), ConfigError> {
  match query {
    Some(q) if q.trim().is_empty() => Err(ConfigError::BlankQuery { kind }),
    _ => Ok(()),
  }
}
