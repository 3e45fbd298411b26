//! Optimistic, in-memory widget collection for one dashboard.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::layout::Layout;
use crate::sync::{lock, SaveStatus, SharedState, SyncOperation, WidgetSyncState, WriterHandle};
use crate::widget::{CacheKeyRef, NewWidget, Position, Widget, WidgetId, WidgetPatch};

/// New placement for one widget.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PositionChange {
  pub id: WidgetId,
  pub position: Position,
}

/// UI-facing widget store.
///
/// Every call applies to local state synchronously and returns without
/// waiting on the network. The resulting intent is queued and the writer's
/// debounce window restarted. Nothing here fails: unknown ids are logged and
/// ignored, persistence trouble only shows up in `status()`.
#[derive(Clone)]
pub struct WidgetStore {
  state: SharedState,
  layout: Arc<dyn Layout>,
  writer: WriterHandle,
}

impl WidgetStore {
  pub fn new(state: SharedState, layout: Arc<dyn Layout>, writer: WriterHandle) -> Self {
    Self {
      state,
      layout,
      writer,
    }
  }

  /// Add a widget under a fresh temporary id.
  pub fn create(&self, params: NewWidget) -> Widget {
    let (widget, notification) = {
      let mut state = lock(&self.state);
      let position = params.position.unwrap_or_else(|| {
        let existing: Vec<Position> = state.widgets().iter().map(|w| w.position).collect();
        self.layout.place(params.kind, &existing)
      });
      let widget = params.into_widget(
        WidgetId::temporary(),
        state.dashboard_id(),
        position,
        Utc::now(),
      );
      state.widgets_mut().push(widget.clone());
      state.queue_mut().enqueue(SyncOperation::create(widget.clone()));
      (widget, state.notification())
    };

    debug!(widget_id = %widget.id, kind = %widget.kind(), "widget created");
    notification.send();
    self.writer.schedule();
    widget
  }

  /// Merge `patch` into a widget. Returns the updated widget.
  pub fn update(&self, id: &WidgetId, patch: WidgetPatch) -> Option<Widget> {
    if patch.is_empty() {
      return self.get(id);
    }
    if let Some(Err(e)) = patch.config.as_ref().map(|c| c.validate()) {
      warn!(widget_id = %id, error = %e, "config will be refused by the store");
    }

    let (widget, notification) = {
      let mut state = lock(&self.state);
      let id = state.resolve(id);
      let Some(widget) = state.widgets_mut().iter_mut().find(|w| w.id == id) else {
        warn!(widget_id = %id, "update for unknown widget ignored");
        return None;
      };
      widget.apply(&patch, Utc::now());
      let widget = widget.clone();
      state.queue_mut().enqueue(SyncOperation::update(id, patch));
      (widget, state.notification())
    };

    notification.send();
    self.writer.schedule();
    Some(widget)
  }

  /// Remove a widget. A never-flushed widget leaves no trace in the queue.
  pub fn delete(&self, id: &WidgetId) -> bool {
    let (notification, pending) = {
      let mut state = lock(&self.state);
      let id = state.resolve(id);
      let before = state.widgets().len();
      state.widgets_mut().retain(|w| w.id != id);
      if state.widgets().len() == before {
        warn!(widget_id = %id, "delete for unknown widget ignored");
        return false;
      }
      state.queue_mut().enqueue(SyncOperation::delete(id));
      (state.notification(), !state.queue().is_empty())
    };

    notification.send();
    if pending {
      self.writer.schedule();
    }
    true
  }

  /// Create a new widget with the kind, config and title of an existing one.
  pub fn duplicate(&self, id: &WidgetId) -> Option<Widget> {
    let Some(source) = self.get(id) else {
      warn!(widget_id = %id, "duplicate of unknown widget ignored");
      return None;
    };
    let params = NewWidget::new(source.kind())
      .with_config(source.config)
      .with_title(source.title);
    Some(self.create(params))
  }

  /// Move several widgets at once. Unknown ids are skipped.
  pub fn reposition(&self, changes: &[PositionChange]) {
    let notification = {
      let mut state = lock(&self.state);
      let now = Utc::now();
      let mut moved = 0;
      for change in changes {
        let id = state.resolve(&change.id);
        let Some(widget) = state.widgets_mut().iter_mut().find(|w| w.id == id) else {
          warn!(widget_id = %change.id, "reposition for unknown widget ignored");
          continue;
        };
        widget.position = change.position;
        widget.updated_at = now;
        state
          .queue_mut()
          .enqueue(SyncOperation::reposition(id, change.position));
        moved += 1;
      }
      (moved > 0).then(|| state.notification())
    };

    if let Some(notification) = notification {
      notification.send();
      self.writer.schedule();
    }
  }

  /// Marker to take before a read whose result goes to `attach_data`.
  pub fn read_mark(&self) -> u64 {
    lock(&self.state).flushes_started()
  }

  /// Attach data read since `mark` to a widget without queueing a write.
  ///
  /// Skipped while the widget has queued or in-flight intent, and when a
  /// flush started after `mark`. Local data is at least as new as the read
  /// in all of those cases.
  pub fn attach_data(
    &self,
    id: &WidgetId,
    data: Option<Value>,
    key_ref: CacheKeyRef,
    mark: u64,
  ) -> bool {
    let notification = {
      let mut state = lock(&self.state);
      let id = state.resolve(id);
      if state.queue().get(&id).is_some() || state.is_in_flight(&id) {
        debug!(widget_id = %id, "unsaved intent, keeping local data");
        return false;
      }
      if state.flushes_started() != mark {
        debug!(widget_id = %id, "flushed during read, keeping local data");
        return false;
      }
      let Some(widget) = state.widgets_mut().iter_mut().find(|w| w.id == id) else {
        return false;
      };
      widget.data = data;
      widget.cache_key_ref = Some(key_ref);
      state.notification()
    };
    notification.send();
    true
  }

  /// Register a callback that receives the full collection after each change.
  pub fn subscribe(&self, listener: impl Fn(&[Widget]) + Send + Sync + 'static) {
    lock(&self.state).add_listener(Arc::new(listener));
  }

  pub fn widgets(&self) -> Vec<Widget> {
    lock(&self.state).widgets().to_vec()
  }

  /// Look up a widget by its current id or a reconciled temporary id.
  pub fn get(&self, id: &WidgetId) -> Option<Widget> {
    lock(&self.state).find(id).cloned()
  }

  pub fn sync_state(&self, id: &WidgetId) -> Option<WidgetSyncState> {
    lock(&self.state).sync_state(id)
  }

  pub fn pending_count(&self) -> usize {
    lock(&self.state).queue().len()
  }

  pub fn status(&self) -> SaveStatus {
    self.writer.status()
  }

  pub fn writer(&self) -> &WriterHandle {
    &self.writer
  }
}
