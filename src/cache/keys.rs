//! Cache key derivation and TTL tiers.

use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::widget::WidgetId;

/// Logical cache keys.
///
/// Rendered keys look like `<namespace>:<collection>:<sha256>`, so they are
/// namespaced, deterministic and fixed length regardless of id contents.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
  /// Summary list of a user's dashboards
  DashboardList { user_id: String },
  /// Widgets belonging to one dashboard
  WidgetList {
    user_id: String,
    dashboard_id: String,
  },
  /// Files uploaded to a dashboard
  FileList {
    user_id: String,
    dashboard_id: String,
  },
  /// Computed data payload of a single widget
  WidgetData {
    user_id: String,
    dashboard_id: String,
    widget_id: WidgetId,
  },
}

impl CacheKey {
  pub fn dashboards(user_id: &str) -> Self {
    Self::DashboardList {
      user_id: user_id.to_string(),
    }
  }

  pub fn widgets(user_id: &str, dashboard_id: &str) -> Self {
    Self::WidgetList {
      user_id: user_id.to_string(),
      dashboard_id: dashboard_id.to_string(),
    }
  }

  #[allow(dead_code)]
  pub fn files(user_id: &str, dashboard_id: &str) -> Self {
    Self::FileList {
      user_id: user_id.to_string(),
      dashboard_id: dashboard_id.to_string(),
    }
  }

  pub fn widget_data(user_id: &str, dashboard_id: &str, widget_id: &WidgetId) -> Self {
    Self::WidgetData {
      user_id: user_id.to_string(),
      dashboard_id: dashboard_id.to_string(),
      widget_id: widget_id.clone(),
    }
  }

  /// Collection name used as the middle key segment.
  pub fn collection(&self) -> &'static str {
    match self {
      Self::DashboardList { .. } => "dashboards",
      Self::WidgetList { .. } => "widgets",
      Self::FileList { .. } => "files",
      Self::WidgetData { .. } => "widget_data",
    }
  }

  /// Render the storage key under `namespace`.
  pub fn render(&self, namespace: &str) -> String {
    let input = match self {
      Self::DashboardList { user_id } => user_id.clone(),
      Self::WidgetList {
        user_id,
        dashboard_id,
      }
      | Self::FileList {
        user_id,
        dashboard_id,
      } => format!("{}\u{1f}{}", user_id, dashboard_id),
      Self::WidgetData {
        user_id,
        dashboard_id,
        widget_id,
      } => format!("{}\u{1f}{}\u{1f}{}", user_id, dashboard_id, widget_id),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!(
      "{}:{}:{}",
      namespace,
      self.collection(),
      hex::encode(hasher.finalize())
    )
  }

  /// Human-readable description for logs.
  pub fn description(&self) -> String {
    match self {
      Self::DashboardList { user_id } => format!("dashboards of {}", user_id),
      Self::WidgetList { dashboard_id, .. } => format!("widgets of dashboard {}", dashboard_id),
      Self::FileList { dashboard_id, .. } => format!("files of dashboard {}", dashboard_id),
      Self::WidgetData { widget_id, .. } => format!("data of widget {}", widget_id),
    }
  }
}

/// TTLs tiered by how volatile each kind of data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
  /// Computed query results; recomputed often
  pub widget_data: Duration,
  pub widget_list: Duration,
  pub dashboard_list: Duration,
  /// File associations rarely change
  pub file_list: Duration,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      widget_data: Duration::from_secs(5 * 60),
      widget_list: Duration::from_secs(10 * 60),
      dashboard_list: Duration::from_secs(10 * 60),
      file_list: Duration::from_secs(60 * 60),
    }
  }
}

impl TtlPolicy {
  pub fn ttl_for(&self, key: &CacheKey) -> Duration {
    match key {
      CacheKey::DashboardList { .. } => self.dashboard_list,
      CacheKey::WidgetList { .. } => self.widget_list,
      CacheKey::FileList { .. } => self.file_list,
      CacheKey::WidgetData { .. } => self.widget_data,
    }
  }
}
