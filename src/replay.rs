//! Scripted editing sessions.
//!
//! A replay script is a YAML list of steps played against an open
//! dashboard session, the way a user would click through the editor:
//!
//! ```yaml
//! steps:
//!   - create: { kind: chart, subtype: line, title: Revenue, as: rev }
//!   - update: { widget: rev, title: Revenue (EUR) }
//!   - wait: 200
//!   - reposition: [{ widget: rev, x: 0, y: 4, w: 6, h: 4 }]
//!   - offline
//!   - delete: rev
//!   - online
//!   - flush
//!   - refresh: rev
//! ```
//!
//! Widgets are addressed by the alias given at creation (`as`) or by id.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::dashboard::{DashboardSession, PositionChange};
use crate::db::DurableStore;
use crate::sync::FlushOutcome;
use crate::widget::{ChartKind, NewWidget, Position, WidgetConfig, WidgetId, WidgetKind, WidgetPatch};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Script {
  pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
  Create(CreateStep),
  Update(UpdateStep),
  /// Widget alias or id
  Delete(String),
  Duplicate(DuplicateStep),
  Reposition(Vec<MoveStep>),
  /// Milliseconds
  Wait(u64),
  Offline,
  Online,
  Flush,
  /// Re-read a widget's data through the cache
  Refresh(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateStep {
  pub kind: WidgetKind,
  pub subtype: Option<ChartKind>,
  pub title: Option<String>,
  pub config: Option<WidgetConfig>,
  pub data: Option<Value>,
  #[serde(rename = "as")]
  pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateStep {
  pub widget: String,
  pub title: Option<String>,
  pub config: Option<WidgetConfig>,
  pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DuplicateStep {
  pub widget: String,
  #[serde(rename = "as")]
  pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MoveStep {
  pub widget: String,
  pub x: u32,
  pub y: u32,
  pub w: u32,
  pub h: u32,
}

impl Script {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read script {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse script {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }
}

/// Plays steps against a session, tracking widget aliases.
pub struct Replayer<'a, D: DurableStore> {
  session: &'a DashboardSession<D>,
  aliases: HashMap<String, WidgetId>,
}

impl<'a, D: DurableStore> Replayer<'a, D> {
  pub fn new(session: &'a DashboardSession<D>) -> Self {
    session
      .widgets()
      .subscribe(|widgets| debug!(widgets = widgets.len(), "widgets changed"));
    Self {
      session,
      aliases: HashMap::new(),
    }
  }

  /// The id an alias was bound to; unknown names are taken as ids.
  pub fn resolve(&self, name: &str) -> WidgetId {
    self
      .aliases
      .get(name)
      .cloned()
      .unwrap_or_else(|| WidgetId::new(name))
  }

  pub async fn run(&mut self, script: &Script) -> Result<()> {
    info!(
      dashboard_id = %self.session.dashboard_id(),
      steps = script.steps.len(),
      "replay started"
    );
    let mut status = self.session.widgets().writer().subscribe_status();
    tokio::spawn(async move {
      while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        info!(status = ?current, "save status");
      }
    });

    for (index, step) in script.steps.iter().enumerate() {
      debug!(step = index + 1, ?step, "replaying");
      self.apply(step).await?;
    }
    Ok(())
  }

  async fn apply(&mut self, step: &Step) -> Result<()> {
    let store = self.session.widgets();
    match step {
      Step::Create(create) => {
        let mut params = match (create.kind, create.subtype) {
          (WidgetKind::Chart, Some(subtype)) => NewWidget::chart(subtype),
          (kind, None) => NewWidget::new(kind),
          (kind, Some(subtype)) => {
            return Err(eyre!(
              "create: subtype {:?} only applies to charts, not {}",
              subtype,
              kind
            ));
          }
        };
        if let Some(config) = &create.config {
          if config.kind() != create.kind {
            return Err(eyre!(
              "create: config type {} does not match kind {}",
              config.kind(),
              create.kind
            ));
          }
          params = params.with_config(config.clone());
        }
        if let Some(title) = &create.title {
          params = params.with_title(title.clone());
        }
        if let Some(data) = &create.data {
          params = params.with_data(data.clone());
        }
        let widget = store.create(params);
        info!(widget_id = %widget.id, title = %widget.title, "created");
        if let Some(alias) = &create.alias {
          self.aliases.insert(alias.clone(), widget.id);
        }
      }
      Step::Update(update) => {
        let patch = WidgetPatch {
          title: update.title.clone(),
          config: update.config.clone(),
          data: update.data.clone(),
          ..Default::default()
        };
        store.update(&self.resolve(&update.widget), patch);
      }
      Step::Delete(name) => {
        store.delete(&self.resolve(name));
      }
      Step::Duplicate(duplicate) => {
        if let Some(copy) = store.duplicate(&self.resolve(&duplicate.widget)) {
          info!(widget_id = %copy.id, "duplicated {}", duplicate.widget);
          if let Some(alias) = &duplicate.alias {
            self.aliases.insert(alias.clone(), copy.id);
          }
        }
      }
      Step::Reposition(moves) => {
        let changes: Vec<PositionChange> = moves
          .iter()
          .map(|m| PositionChange {
            id: self.resolve(&m.widget),
            position: Position::new(m.x, m.y, m.w, m.h),
          })
          .collect();
        store.reposition(&changes);
      }
      Step::Wait(ms) => tokio::time::sleep(Duration::from_millis(*ms)).await,
      Step::Offline => self.session.set_reachable(false),
      Step::Online => self.session.set_reachable(true),
      Step::Flush => match self.session.flush().await {
        FlushOutcome::Stopped => return Err(eyre!("flush: writer is not running")),
        outcome => info!(?outcome, "flushed"),
      },
      Step::Refresh(name) => {
        let id = self.resolve(name);
        let data = self.session.refresh_data(&id).await?;
        info!(widget_id = %id, state = ?store.sync_state(&id), ?data, "refreshed");
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheManager, NoopCache};
  use crate::dashboard::{CachedDashboardClient, SessionOptions};
  use crate::db::MemoryStore;
  use std::sync::Arc;

  const SCRIPT: &str = r#"
steps:
  - create: { kind: chart, subtype: line, title: Revenue, as: rev }
  - create: { kind: text, as: note }
  - update: { widget: rev, title: Revenue (EUR) }
  - duplicate: { widget: rev, as: rev2 }
  - wait: 1500
  - offline
  - delete: note
  - reposition:
      - { widget: rev, x: 0, y: 8, w: 6, h: 4 }
  - online
  - wait: 100
  - flush
  - refresh: rev
"#;

  #[test]
  fn test_parse_script() {
    let script = Script::parse(SCRIPT).unwrap();
    assert_eq!(script.steps.len(), 12);
    assert!(matches!(&script.steps[0], Step::Create(c) if c.subtype == Some(ChartKind::Line)));
    assert_eq!(script.steps[5], Step::Offline);
    assert_eq!(script.steps[6], Step::Delete("note".to_string()));
    assert_eq!(script.steps[11], Step::Refresh("rev".to_string()));
  }

  #[test]
  fn test_parse_rejects_unknown_step() {
    assert!(Script::parse("steps:\n  - explode: now\n").is_err());
  }

  fn session() -> (Arc<MemoryStore>, CachedDashboardClient<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    backend.insert_dashboard("d1", "u1", "Main");
    let cache = CacheManager::new(Arc::new(NoopCache), "test");
    let client = CachedDashboardClient::new(backend.clone(), cache, "u1");
    (backend, client)
  }

  #[tokio::test(start_paused = true)]
  async fn test_subtype_on_non_chart_is_refused() {
    let (backend, client) = session();
    let session = DashboardSession::open(client, "d1", SessionOptions::default())
      .await
      .unwrap();
    let script = Script::parse("steps:\n  - create: { kind: kpi, subtype: line }\n").unwrap();

    let err = Replayer::new(&session).run(&script).await.unwrap_err();
    assert!(err.to_string().contains("only applies to charts"));
    assert!(session.widgets().widgets().is_empty());
    assert_eq!(backend.request_count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_replay_converges_on_store() {
    let (backend, client) = session();
    let options = SessionOptions {
      debounce: Duration::from_millis(1000),
      ..Default::default()
    };
    let session = DashboardSession::open(client, "d1", options).await.unwrap();

    let mut replayer = Replayer::new(&session);
    replayer.run(&Script::parse(SCRIPT).unwrap()).await.unwrap();

    let stored = backend.widgets("d1");
    assert_eq!(stored.len(), 2);
    let rev = stored
      .iter()
      .find(|w| w.id == session.widgets().get(&replayer.resolve("rev")).unwrap().id)
      .unwrap();
    assert_eq!(rev.title, "Revenue (EUR)");
    assert_eq!(rev.position, Position::new(0, 8, 6, 4));
    assert_eq!(session.widgets().pending_count(), 0);
  }
}
