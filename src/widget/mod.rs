//! Widget domain types shared by the store, the queue and the collaborators.

mod config;
mod types;

pub use config::{
  ChartConfig, ChartKind, ConfigError, KpiConfig, TableConfig, TextConfig, ValueFormat,
  WidgetConfig, WidgetKind,
};
pub use types::{CacheKeyRef, NewWidget, Position, Widget, WidgetId, WidgetPatch, TEMP_ID_PREFIX};
